use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Agency, AgencyId, Agent, AgentId, Document, DocumentOwner, Lead, LeadId, LeadPriority,
    LeadStatus, LostReason, NewPayment, Payment, PaymentId, Property, PropertyId, Transaction,
    TransactionId,
};
use super::follow_up::FollowUpBucket;

/// Error enumeration for store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record version changed since it was read")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Per-request filters for lead listings. Nothing here is retained between requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadFilter {
    #[serde(default)]
    pub status: Option<LeadStatus>,
    #[serde(default)]
    pub agency: Option<AgencyId>,
    #[serde(default)]
    pub priority: Option<LeadPriority>,
}

impl LeadFilter {
    pub fn matches(&self, lead: &Lead) -> bool {
        self.status.map_or(true, |status| lead.status() == status)
            && self
                .agency
                .as_ref()
                .map_or(true, |agency| lead.agency() == Some(agency))
            && self
                .priority
                .map_or(true, |priority| lead.priority == priority)
    }
}

/// Durable lead storage with optimistic concurrency.
///
/// `update` must fail with [`RepositoryError::Conflict`] when the stored version differs from
/// `expected_version`, and must store the record with the version incremented.
pub trait LeadRepository: Send + Sync {
    fn insert(&self, lead: Lead) -> Result<Lead, RepositoryError>;
    fn fetch(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError>;
    fn update(&self, lead: Lead, expected_version: u64) -> Result<Lead, RepositoryError>;
    fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>, RepositoryError>;
}

/// Durable transaction storage. `insert` rejects a second record for the same lead and
/// property with [`RepositoryError::Conflict`].
pub trait TransactionRepository: Send + Sync {
    fn insert(&self, transaction: Transaction) -> Result<Transaction, RepositoryError>;
    fn fetch(&self, id: &TransactionId) -> Result<Option<Transaction>, RepositoryError>;
    fn find_for_lead(
        &self,
        lead: &LeadId,
        property: &PropertyId,
    ) -> Result<Option<Transaction>, RepositoryError>;
    fn update(
        &self,
        transaction: Transaction,
        expected_version: u64,
    ) -> Result<Transaction, RepositoryError>;
}

pub trait Directory: Send + Sync {
    fn list_agencies(&self) -> Result<Vec<Agency>, RepositoryError>;
    fn list_agents(&self, agency: &AgencyId) -> Result<Vec<Agent>, RepositoryError>;
}

pub trait PropertyCatalog: Send + Sync {
    fn get_property(&self, id: &PropertyId) -> Result<Option<Property>, RepositoryError>;
}

pub trait PaymentStore: Send + Sync {
    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError>;
    fn create_payment(&self, payment: NewPayment) -> Result<Payment, RepositoryError>;
}

pub trait DocumentStore: Send + Sync {
    fn list_documents(&self, owner: &DocumentOwner) -> Result<Vec<Document>, RepositoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationParty {
    Customer,
    Agency,
}

/// Lifecycle notifications. Delivery is at-least-once, so consumers must be idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    LeadAssigned {
        lead: LeadId,
        agency: Option<AgencyId>,
        agent: Option<AgentId>,
    },
    StatusChanged {
        lead: LeadId,
        from: LeadStatus,
        to: LeadStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        lost_reason: Option<LostReason>,
    },
    FollowUpDue {
        lead: LeadId,
        follow_up_at: DateTime<Utc>,
        bucket: FollowUpBucket,
    },
    PaymentConfirmed {
        transaction: TransactionId,
        lead: LeadId,
        party: ConfirmationParty,
    },
}

impl LifecycleEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::LeadAssigned { .. } => "lead_assigned",
            LifecycleEvent::StatusChanged { .. } => "status_changed",
            LifecycleEvent::FollowUpDue { .. } => "follow_up_due",
            LifecycleEvent::PaymentConfirmed { .. } => "payment_confirmed",
        }
    }
}

/// Outbound delivery hook (e-mail, push, webhooks). Formatting and retries live behind it.
pub trait NotificationDispatcher: Send + Sync {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), DispatchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}
