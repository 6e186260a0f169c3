use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference as it arrives from clients and upstream documents: either a bare identifier or an
/// expanded object carrying `id`/`_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Bare(String),
    Expanded {
        #[serde(alias = "_id")]
        id: String,
    },
}

impl EntityRef {
    pub fn into_id(self) -> String {
        match self {
            EntityRef::Bare(id) | EntityRef::Expanded { id } => id.trim().to_string(),
        }
    }
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "EntityRef")]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<EntityRef> for $name {
            fn from(value: EntityRef) -> Self {
                Self(value.into_id())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

entity_id!(
    /// Identifier of a tracked lead.
    LeadId
);
entity_id!(AgencyId);
entity_id!(AgentId);
entity_id!(
    /// Identifier of any authenticated user (customer, staff, admin or agent).
    UserId
);
entity_id!(PropertyId);
entity_id!(TransactionId);
entity_id!(PaymentId);
entity_id!(DocumentId);

/// Roles recognised by the access gate and the scope rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    AgencyAdmin,
    Staff,
    Agent,
    Customer,
}

impl Role {
    pub const fn label(self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::AgencyAdmin => "agency_admin",
            Role::Staff => "staff",
            Role::Agent => "agent",
            Role::Customer => "customer",
        }
    }

    pub const fn ordered() -> [Self; 5] {
        [
            Self::SuperAdmin,
            Self::AgencyAdmin,
            Self::Staff,
            Self::Agent,
            Self::Customer,
        ]
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Role::ordered()
            .into_iter()
            .find(|role| role.label() == value.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown role '{value}'"))
    }
}

/// The authenticated user issuing an action. Identity is resolved upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
    #[serde(default)]
    pub agency: Option<AgencyId>,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role, agency: Option<AgencyId>) -> Self {
        Self {
            id: UserId::new(id),
            role,
            agency,
        }
    }

    pub fn is_agent(&self, agent: &AgentId) -> bool {
        self.role == Role::Agent && self.id.as_str() == agent.as_str()
    }

    pub fn is_user(&self, user: &UserId) -> bool {
        &self.id == user
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadContact {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub alternate_phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl LeadContact {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    #[default]
    Website,
    Phone,
    Email,
    WalkIn,
    Referral,
    SocialMedia,
    Other,
}

/// Position of a lead in the sales pipeline. Exactly one value is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    SiteVisit,
    Negotiation,
    Booked,
    Closed,
    Converted,
    Lost,
}

impl LeadStatus {
    pub const fn ordered() -> [Self; 9] {
        [
            Self::New,
            Self::Contacted,
            Self::Qualified,
            Self::SiteVisit,
            Self::Negotiation,
            Self::Booked,
            Self::Closed,
            Self::Converted,
            Self::Lost,
        ]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::SiteVisit => "site_visit",
            Self::Negotiation => "negotiation",
            Self::Booked => "booked",
            Self::Closed => "closed",
            Self::Converted => "converted",
            Self::Lost => "lost",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Converted | Self::Lost)
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        LeadStatus::ordered()
            .into_iter()
            .find(|status| status.label() == normalized)
            .ok_or_else(|| format!("unknown lead status '{value}'"))
    }
}

/// Fixed vocabulary of reasons a lead can be marked lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostReason {
    PriceTooHigh,
    FoundElsewhere,
    NotInterested,
    LocationNotSuitable,
    TimingNotRight,
    BudgetConstraints,
    Other,
}

impl LostReason {
    pub const fn ordered() -> [Self; 7] {
        [
            Self::PriceTooHigh,
            Self::FoundElsewhere,
            Self::NotInterested,
            Self::LocationNotSuitable,
            Self::TimingNotRight,
            Self::BudgetConstraints,
            Self::Other,
        ]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::PriceTooHigh => "price_too_high",
            Self::FoundElsewhere => "found_elsewhere",
            Self::NotInterested => "not_interested",
            Self::LocationNotSuitable => "location_not_suitable",
            Self::TimingNotRight => "timing_not_right",
            Self::BudgetConstraints => "budget_constraints",
            Self::Other => "other",
        }
    }
}

impl FromStr for LostReason {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        LostReason::ordered()
            .into_iter()
            .find(|reason| reason.label() == normalized)
            .ok_or_else(|| value.trim().to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadPriority {
    Hot,
    #[default]
    Warm,
    Cold,
    #[serde(rename = "Not_interested")]
    NotInterested,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadNote {
    pub author: UserId,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Audit entry appended on every applied status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: LeadStatus,
    pub to: LeadStatus,
    pub actor: UserId,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_reason: Option<LostReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub currency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inquiry {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetRange>,
    #[serde(default)]
    pub preferred_locations: Vec<String>,
    #[serde(default)]
    pub property_types: Vec<String>,
    #[serde(default)]
    pub timeline: Option<String>,
    #[serde(default)]
    pub requirements: Option<String>,
}

/// Payload accepted by `create_lead`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLead {
    pub contact: LeadContact,
    #[serde(default)]
    pub customer: Option<UserId>,
    #[serde(default)]
    pub property: Option<PropertyId>,
    #[serde(default)]
    pub agency: Option<AgencyId>,
    #[serde(default)]
    pub source: LeadSource,
    #[serde(default)]
    pub priority: LeadPriority,
    #[serde(default)]
    pub inquiry: Inquiry,
    #[serde(default)]
    pub follow_up_at: Option<DateTime<Utc>>,
}

/// A prospective customer's interest in a property or a general inquiry.
///
/// Ownership and pipeline fields are private: agency, agent, status and lost reason only change
/// through the crate's transition code so their invariants hold for every stored lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub contact: LeadContact,
    pub customer: Option<UserId>,
    pub property: Option<PropertyId>,
    agency: Option<AgencyId>,
    assigned_agent: Option<AgentId>,
    pub source: LeadSource,
    status: LeadStatus,
    lost_reason: Option<LostReason>,
    pub priority: LeadPriority,
    pub is_approved: bool,
    pub follow_up_at: Option<DateTime<Utc>>,
    pub notes: Vec<LeadNote>,
    pub status_history: Vec<StatusChange>,
    pub inquiry: Inquiry,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(id: LeadId, submission: NewLead, now: DateTime<Utc>) -> Self {
        Self {
            id,
            contact: submission.contact,
            customer: submission.customer,
            property: submission.property,
            agency: submission.agency,
            assigned_agent: None,
            source: submission.source,
            status: LeadStatus::New,
            lost_reason: None,
            priority: submission.priority,
            is_approved: false,
            follow_up_at: submission.follow_up_at,
            notes: Vec::new(),
            status_history: Vec::new(),
            inquiry: submission.inquiry,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn agency(&self) -> Option<&AgencyId> {
        self.agency.as_ref()
    }

    pub fn assigned_agent(&self) -> Option<&AgentId> {
        self.assigned_agent.as_ref()
    }

    pub fn status(&self) -> LeadStatus {
        self.status
    }

    pub fn lost_reason(&self) -> Option<LostReason> {
        self.lost_reason
    }

    /// Moves the lead to another agency. Any agent of the previous agency is detached.
    pub(crate) fn move_to_agency(&mut self, agency: Option<AgencyId>) -> bool {
        if self.agency == agency {
            return false;
        }
        self.agency = agency;
        self.assigned_agent = None;
        true
    }

    pub(crate) fn set_agent(&mut self, agent: Option<AgentId>) -> bool {
        if self.assigned_agent == agent {
            return false;
        }
        self.assigned_agent = agent;
        true
    }

    /// Records a validated transition. The lost reason is kept only for `Lost`.
    pub(crate) fn record_status(&mut self, change: StatusChange) {
        self.status = change.to;
        self.lost_reason = match change.to {
            LeadStatus::Lost => change.lost_reason,
            _ => None,
        };
        self.status_history.push(change);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Sale,
    Rent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Cancelled,
    Refunded,
}

impl TransactionStatus {
    pub const fn ordered() -> [Self; 4] {
        [
            Self::Pending,
            Self::Completed,
            Self::Cancelled,
            Self::Refunded,
        ]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        TransactionStatus::ordered()
            .into_iter()
            .find(|status| status.label() == normalized)
            .ok_or_else(|| format!("unknown transaction status '{value}'"))
    }
}

/// Monetary commitment tied to exactly one lead and one property. Amounts are in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub lead: LeadId,
    pub property: PropertyId,
    pub kind: TransactionKind,
    pub amount: u64,
    pub currency: String,
    status: TransactionStatus,
    customer_confirmed: bool,
    customer_confirmed_at: Option<DateTime<Utc>>,
    payment: Option<PaymentId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub(crate) fn pending(
        id: TransactionId,
        lead: LeadId,
        property: &Property,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            lead,
            property: property.id.clone(),
            kind: property.listing,
            amount: property.price,
            currency: property.currency.clone(),
            status: TransactionStatus::Pending,
            customer_confirmed: false,
            customer_confirmed_at: None,
            payment: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn customer_confirmed(&self) -> bool {
        self.customer_confirmed
    }

    pub fn customer_confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.customer_confirmed_at
    }

    pub fn payment(&self) -> Option<&PaymentId> {
        self.payment.as_ref()
    }

    pub(crate) fn set_status(&mut self, status: TransactionStatus) {
        self.status = status;
    }

    pub(crate) fn mark_customer_confirmed(&mut self, at: DateTime<Utc>) {
        self.customer_confirmed = true;
        self.customer_confirmed_at = Some(at);
    }

    pub(crate) fn attach_payment(&mut self, payment: PaymentId) {
        self.payment = Some(payment);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// Backend-recorded money movement referenced by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub amount: u64,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayment {
    pub amount: u64,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agency {
    pub id: AgencyId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub agency: AgencyId,
    pub name: String,
}

/// Read-only catalog entry; the engine never mutates property data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    #[serde(default)]
    pub agency: Option<AgencyId>,
    pub title: String,
    pub listing: TransactionKind,
    pub price: u64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DocumentOwner {
    Transaction(TransactionId),
    Lead(LeadId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    pub owner: DocumentOwner,
    #[serde(default)]
    pub property: Option<PropertyId>,
    pub storage_key: String,
}
