use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::access::{AccessControlGate, AccessDenied, Capability, Resource};
use super::assignment::{AssignmentResolver, ScopeViolation};
use super::domain::{
    Actor, AgencyId, Agent, AgentId, Document, DocumentOwner, Lead, LeadId, LeadNote,
    LeadPriority, LeadStatus, NewLead, NewPayment, Payment, PaymentId, Property, PropertyId,
    Role, Transaction, TransactionId, TransactionStatus,
};
use super::follow_up::{FollowUpEntry, FollowUpScheduler};
use super::ledger::{TransactionLedger, TransactionView};
use super::repository::{
    ConfirmationParty, Directory, DocumentStore, LeadFilter, LeadRepository, LifecycleEvent,
    NotificationDispatcher, PaymentStore, PropertyCatalog, RepositoryError,
    TransactionRepository,
};
use super::status::{StatusStateMachine, TransitionError};
use crate::config::PipelineConfig;

const DEFAULT_PAGE_SIZE: usize = 20;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Lead,
    Transaction,
    Property,
    Agency,
    Payment,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::Lead => "lead",
            EntityKind::Transaction => "transaction",
            EntityKind::Property => "property",
            EntityKind::Agency => "agency",
            EntityKind::Payment => "payment",
        };
        f.write_str(label)
    }
}

/// Error raised by the lifecycle service. Every variant is detected before any write.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    PermissionDenied(#[from] AccessDenied),
    #[error(transparent)]
    ScopeViolation(#[from] ScopeViolation),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{entity} {id} was modified concurrently; re-read and retry")]
    Conflict { entity: EntityKind, id: String },
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },
    #[error(transparent)]
    Repository(RepositoryError),
}

impl LifecycleError {
    pub const fn kind(&self) -> &'static str {
        match self {
            LifecycleError::PermissionDenied(_) => "permission_denied",
            LifecycleError::ScopeViolation(_) => "scope_violation",
            LifecycleError::InvalidTransition(_) => "invalid_transition",
            LifecycleError::Validation(_) => "validation",
            LifecycleError::Conflict { .. } => "conflict",
            LifecycleError::NotFound { .. } => "not_found",
            LifecycleError::Repository(_) => "repository",
        }
    }

    fn not_found(entity: EntityKind, id: &str) -> Self {
        LifecycleError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    fn from_store(err: RepositoryError, entity: EntityKind, id: &str) -> Self {
        match err {
            RepositoryError::Conflict => LifecycleError::Conflict {
                entity,
                id: id.to_string(),
            },
            RepositoryError::NotFound => LifecycleError::not_found(entity, id),
            other => LifecycleError::Repository(other),
        }
    }
}

impl From<RepositoryError> for LifecycleError {
    fn from(value: RepositoryError) -> Self {
        LifecycleError::Repository(value)
    }
}

/// Updated entity plus the events emitted while producing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleOutcome<T> {
    pub entity: T,
    pub emitted_events: Vec<LifecycleEvent>,
}

impl<T> LifecycleOutcome<T> {
    fn quiet(entity: T) -> Self {
        Self {
            entity,
            emitted_events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: LeadStatus,
    #[serde(default)]
    pub lost_reason: Option<String>,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRequest {
    #[serde(default)]
    pub agency: Option<AgencyId>,
    #[serde(default)]
    pub agent: Option<AgentId>,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approved: bool,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpRequest {
    #[serde(default)]
    pub follow_up_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRequest {
    pub text: String,
}

/// Listing parameters supplied per request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadQuery {
    #[serde(default)]
    pub status: Option<LeadStatus>,
    #[serde(default)]
    pub agency: Option<AgencyId>,
    #[serde(default)]
    pub priority: Option<LeadPriority>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub per_page: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadPage {
    pub items: Vec<Lead>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub lead: Lead,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionView>,
    /// Why a booked lead has no transaction yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRecording {
    Existing { payment: PaymentId },
    New(NewPayment),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub payment: PaymentRecording,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

enum PaymentSlot {
    Stored(Payment),
    Unsaved(NewPayment),
    Created(Payment),
}

impl PaymentSlot {
    fn into_payment(self) -> Option<Payment> {
        match self {
            PaymentSlot::Stored(payment) | PaymentSlot::Created(payment) => Some(payment),
            PaymentSlot::Unsaved(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatusRequest {
    pub status: TransactionStatus,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

/// External collaborators. All durable state lives behind these traits.
#[derive(Clone)]
pub struct Collaborators {
    pub leads: Arc<dyn LeadRepository>,
    pub transactions: Arc<dyn TransactionRepository>,
    pub directory: Arc<dyn Directory>,
    pub properties: Arc<dyn PropertyCatalog>,
    pub payments: Arc<dyn PaymentStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

static LEAD_SEQUENCE: AtomicU64 = AtomicU64::new(1);
static TRANSACTION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_lead_id() -> LeadId {
    let id = LEAD_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    LeadId(format!("lead-{id:06}"))
}

fn next_transaction_id() -> TransactionId {
    let id = TRANSACTION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    TransactionId(format!("txn-{id:06}"))
}

/// Request-scoped facade over the gate, resolver, state machine, scheduler and ledger.
pub struct LeadLifecycleService {
    store: Collaborators,
    gate: AccessControlGate,
    resolver: AssignmentResolver,
    machine: StatusStateMachine,
    scheduler: FollowUpScheduler,
    ledger: TransactionLedger,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl LeadLifecycleService {
    pub fn new(store: Collaborators, config: PipelineConfig) -> Self {
        Self {
            store,
            gate: AccessControlGate,
            resolver: AssignmentResolver,
            machine: StatusStateMachine,
            scheduler: FollowUpScheduler,
            ledger: TransactionLedger,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register a new lead. Customers always own the leads they submit.
    pub fn create_lead(
        &self,
        actor: &Actor,
        mut submission: NewLead,
    ) -> Result<LifecycleOutcome<Lead>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::Create)?;
        validate_contact(&submission)?;

        if actor.role == Role::Customer {
            submission.customer = Some(actor.id.clone());
        }

        let property = match &submission.property {
            Some(id) => Some(self.load_property(id)?),
            None => None,
        };
        if submission.agency.is_none() {
            submission.agency = match actor.role {
                Role::AgencyAdmin | Role::Staff => actor.agency.clone(),
                _ => property.as_ref().and_then(|property| property.agency.clone()),
            };
        }
        if let Some(agency) = &submission.agency {
            if actor.role != Role::Customer {
                self.resolver.authorize_agency(actor, agency)?;
            }
            self.require_agency(agency)?;
        }

        let lead = Lead::new(next_lead_id(), submission, self.clock.now());
        let id = lead.id.clone();
        let stored = self
            .store
            .leads
            .insert(lead)
            .map_err(|err| LifecycleError::from_store(err, EntityKind::Lead, id.as_str()))?;

        info!(lead_id = %stored.id, actor = %actor.id, role = %actor.role, "lead created");
        Ok(LifecycleOutcome::quiet(stored))
    }

    pub fn get_lead(&self, actor: &Actor, id: &LeadId) -> Result<Lead, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::View)?;
        let lead = self.load_lead(id)?;
        self.resolver.resolve(&lead, actor)?;
        Ok(lead)
    }

    /// Out-of-scope leads are omitted from listings rather than reported as errors.
    pub fn list_leads(&self, actor: &Actor, query: &LeadQuery) -> Result<LeadPage, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::View)?;

        let filter = LeadFilter {
            status: query.status,
            agency: query.agency.clone(),
            priority: query.priority,
        };
        let mut visible: Vec<Lead> = self
            .store
            .leads
            .list(&filter)?
            .into_iter()
            .filter(|lead| filter.matches(lead) && self.resolver.can_view(lead, actor))
            .collect();
        visible.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let per_page = query
            .per_page
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, self.config.max_page_size.max(1));
        let page = query.page.unwrap_or(1).max(1);
        let total = visible.len();
        let items = visible
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();

        Ok(LeadPage {
            items,
            page,
            per_page,
            total,
        })
    }

    /// Validate and apply a pipeline transition. Entering `booked` opens the transaction for
    /// the lead's property if none exists yet.
    pub fn update_lead_status(
        &self,
        actor: &Actor,
        id: &LeadId,
        request: StatusUpdate,
    ) -> Result<LifecycleOutcome<StatusTransition>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::Edit)?;

        let now = self.clock.now();
        let (lead, changed) = self.mutate_lead(id, request.expected_version, |lead| {
            self.resolver.resolve(lead, actor)?;
            let plan = self
                .machine
                .plan(lead, request.status, request.lost_reason.as_deref())?;
            if request.status == LeadStatus::Booked {
                if let Some(property) = &lead.property {
                    self.load_property(property)?;
                }
            }
            let next = self.machine.apply(lead, &plan, actor, now);
            Ok((next != *lead).then_some(next))
        })?;

        let mut events = Vec::new();
        if changed {
            if let Some(change) = lead.status_history.last() {
                info!(
                    lead_id = %lead.id,
                    actor = %actor.id,
                    from = %change.from,
                    to = %change.to,
                    "lead status changed"
                );
                events.push(LifecycleEvent::StatusChanged {
                    lead: lead.id.clone(),
                    from: change.from,
                    to: change.to,
                    lost_reason: change.lost_reason,
                });
            }
        }

        let emitted_events = self.emit(events);

        // The status write stands even when the transaction cannot be opened; booking again
        // retries the open.
        let (transaction, transaction_error) = if lead.status() == LeadStatus::Booked {
            match self.ensure_transaction(&lead) {
                Ok(view) => (Some(view), None),
                Err(err) => {
                    warn!(lead_id = %lead.id, error = %err, "lead booked but transaction not opened");
                    (None, Some(err.to_string()))
                }
            }
        } else {
            (None, None)
        };

        Ok(LifecycleOutcome {
            entity: StatusTransition {
                lead,
                transaction,
                transaction_error,
            },
            emitted_events,
        })
    }

    /// Route a lead to an agency and/or agent. An agency change detaches the previous agent.
    pub fn assign_lead(
        &self,
        actor: &Actor,
        id: &LeadId,
        request: AssignmentRequest,
    ) -> Result<LifecycleOutcome<Lead>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::Edit)?;
        if request.agency.is_none() && request.agent.is_none() {
            return Err(LifecycleError::Validation(
                "assignment requires an agency or an agent".to_string(),
            ));
        }
        if let Some(agency) = &request.agency {
            self.require_agency(agency)?;
        }

        let (lead, changed) = self.mutate_lead(id, request.expected_version, |lead| {
            self.resolver.require_administrator(lead, actor)?;

            let mut next = lead.clone();
            if let Some(agency) = request.agency.as_ref().filter(|a| lead.agency() != Some(*a)) {
                if request.agent.is_some() {
                    return Err(TransitionError::AgentWithAgencyChange.into());
                }
                self.resolver.authorize_agency(actor, agency)?;
                next = self.resolver.reassign(lead, Some(agency.clone()));
            }

            if let Some(agent) = &request.agent {
                let roster = match next.agency() {
                    Some(agency) => self.roster(agency)?,
                    None => Vec::new(),
                };
                next = self.resolver.assign_agent(&next, actor, agent, &roster)?;
            }

            Ok((next != *lead).then_some(next))
        })?;

        if !changed {
            return Ok(LifecycleOutcome::quiet(lead));
        }

        info!(
            lead_id = %lead.id,
            actor = %actor.id,
            agency = ?lead.agency(),
            agent = ?lead.assigned_agent(),
            "lead assignment changed"
        );
        let events = vec![LifecycleEvent::LeadAssigned {
            lead: lead.id.clone(),
            agency: lead.agency().cloned(),
            agent: lead.assigned_agent().cloned(),
        }];
        Ok(LifecycleOutcome {
            entity: lead,
            emitted_events: self.emit(events),
        })
    }

    /// Toggle the approval gate that controls agent and customer visibility.
    pub fn set_approval(
        &self,
        actor: &Actor,
        id: &LeadId,
        request: ApprovalRequest,
    ) -> Result<LifecycleOutcome<Lead>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::Edit)?;
        let (lead, changed) = self.mutate_lead(id, request.expected_version, |lead| {
            self.resolver.require_administrator(lead, actor)?;
            if lead.is_approved == request.approved {
                return Ok(None);
            }
            let mut next = lead.clone();
            next.is_approved = request.approved;
            Ok(Some(next))
        })?;

        if changed {
            info!(lead_id = %lead.id, approved = lead.is_approved, "lead approval changed");
        }
        Ok(LifecycleOutcome::quiet(lead))
    }

    pub fn set_follow_up(
        &self,
        actor: &Actor,
        id: &LeadId,
        request: FollowUpRequest,
    ) -> Result<LifecycleOutcome<Lead>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::Edit)?;
        let (lead, changed) = self.mutate_lead(id, request.expected_version, |lead| {
            self.resolver.resolve(lead, actor)?;
            if lead.follow_up_at == request.follow_up_at {
                return Ok(None);
            }
            let mut next = lead.clone();
            next.follow_up_at = request.follow_up_at;
            Ok(Some(next))
        })?;

        if changed {
            match lead.follow_up_at {
                Some(at) => debug!(lead_id = %lead.id, follow_up_at = %at, "follow-up scheduled"),
                None => debug!(lead_id = %lead.id, "follow-up cleared"),
            }
        }
        Ok(LifecycleOutcome::quiet(lead))
    }

    /// Clear the scheduled follow-up. The pipeline status is not touched.
    pub fn complete_follow_up(
        &self,
        actor: &Actor,
        id: &LeadId,
        expected_version: Option<u64>,
    ) -> Result<LifecycleOutcome<Lead>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::Edit)?;
        let (lead, _) = self.mutate_lead(id, expected_version, |lead| {
            self.resolver.resolve(lead, actor)?;
            if lead.follow_up_at.is_none() {
                return Ok(None);
            }
            Ok(Some(self.scheduler.mark_complete(lead)))
        })?;
        Ok(LifecycleOutcome::quiet(lead))
    }

    /// Append a note. Terminal leads still accept notes.
    pub fn add_note(
        &self,
        actor: &Actor,
        id: &LeadId,
        request: NoteRequest,
    ) -> Result<LifecycleOutcome<Lead>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::Edit)?;
        let text = request.text.trim();
        if text.is_empty() {
            return Err(LifecycleError::Validation(
                "note text must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let (lead, _) = self.mutate_lead(id, None, |lead| {
            self.resolver.resolve(lead, actor)?;
            let mut next = lead.clone();
            next.notes.push(LeadNote {
                author: actor.id.clone(),
                text: text.to_string(),
                at: now,
            });
            Ok(Some(next))
        })?;
        Ok(LifecycleOutcome::quiet(lead))
    }

    /// Follow-ups visible to the actor, soonest first.
    pub fn list_follow_ups(
        &self,
        actor: &Actor,
        limit: Option<usize>,
    ) -> Result<Vec<FollowUpEntry>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::View)?;
        let limit = limit
            .filter(|limit| *limit > 0)
            .unwrap_or(self.config.follow_up_limit);
        let leads = self.visible_leads(actor)?;
        Ok(self.scheduler.agenda(&leads, self.clock.now(), limit))
    }

    /// Emit `FollowUpDue` for every overdue or same-day follow-up in the actor's scope.
    pub fn dispatch_due_follow_ups(
        &self,
        actor: &Actor,
    ) -> Result<LifecycleOutcome<Vec<FollowUpEntry>>, LifecycleError> {
        self.authorize(actor, Resource::Lead, Capability::View)?;
        let leads = self.visible_leads(actor)?;
        let due: Vec<FollowUpEntry> = self
            .scheduler
            .agenda(&leads, self.clock.now(), usize::MAX)
            .into_iter()
            .filter(|entry| entry.bucket.is_due())
            .collect();

        let events = due
            .iter()
            .map(|entry| LifecycleEvent::FollowUpDue {
                lead: entry.lead_id.clone(),
                follow_up_at: entry.follow_up_at,
                bucket: entry.bucket,
            })
            .collect();

        Ok(LifecycleOutcome {
            entity: due,
            emitted_events: self.emit(events),
        })
    }

    /// Open (or return the existing) transaction for a booked lead's property.
    pub fn create_transaction_from_lead(
        &self,
        actor: &Actor,
        lead_id: &LeadId,
    ) -> Result<LifecycleOutcome<TransactionView>, LifecycleError> {
        self.authorize(actor, Resource::Transaction, Capability::Create)?;
        let lead = self.load_lead(lead_id)?;
        self.resolver.require_administrator(&lead, actor)?;
        let view = self.ensure_transaction(&lead)?;
        Ok(LifecycleOutcome::quiet(view))
    }

    pub fn get_transaction(
        &self,
        actor: &Actor,
        id: &TransactionId,
    ) -> Result<TransactionView, LifecycleError> {
        self.authorize(actor, Resource::Transaction, Capability::View)?;
        let transaction = self.load_transaction(id)?;
        let lead = self.load_lead(&transaction.lead)?;
        self.require_transaction_viewer(&lead, actor)?;
        self.view(transaction)
    }

    /// Attach a payment record. Payment details are derived on read, not stored.
    pub fn record_payment(
        &self,
        actor: &Actor,
        id: &TransactionId,
        request: PaymentRequest,
    ) -> Result<LifecycleOutcome<TransactionView>, LifecycleError> {
        self.authorize(actor, Resource::Transaction, Capability::Edit)?;
        let transaction = self.load_transaction(id)?;
        let lead = self.load_lead(&transaction.lead)?;
        self.resolver.require_administrator(&lead, actor)?;

        let now = self.clock.now();
        let mut slot = match request.payment {
            PaymentRecording::Existing { payment } => {
                PaymentSlot::Stored(self.load_payment(&payment)?)
            }
            PaymentRecording::New(new_payment) => PaymentSlot::Unsaved(new_payment),
        };

        // The payment record is written only once the version check has passed, and is reused
        // when a store race forces another attempt.
        let outcome = self.mutate_transaction(id, request.expected_version, |current| {
            let payment = self.settle_payment(&mut slot, current, now)?;
            let next = self.ledger.record_payment(current, &payment, now)?;
            Ok(Some(next))
        });
        let (stored, _) = match outcome {
            Ok(result) => result,
            Err(err) => {
                if let PaymentSlot::Created(payment) = &slot {
                    warn!(
                        transaction_id = %id,
                        payment_id = %payment.id,
                        error = %err,
                        "payment stored but not attached to the transaction"
                    );
                }
                return Err(err);
            }
        };
        let payment = slot.into_payment().ok_or_else(|| {
            LifecycleError::Validation("payment was not recorded".to_string())
        })?;

        info!(
            transaction_id = %stored.id,
            payment_id = %payment.id,
            actor = %actor.id,
            "payment recorded"
        );
        Ok(LifecycleOutcome::quiet(TransactionView::new(
            stored,
            Some(&payment),
        )))
    }

    /// Customer half of dual confirmation. Repeat calls return the same state and no events.
    pub fn customer_confirm(
        &self,
        actor: &Actor,
        id: &TransactionId,
        expected_version: Option<u64>,
    ) -> Result<LifecycleOutcome<TransactionView>, LifecycleError> {
        self.authorize(actor, Resource::Transaction, Capability::Edit)?;
        let transaction = self.load_transaction(id)?;
        let lead = self.load_lead(&transaction.lead)?;
        self.resolver.require_owner(&lead, actor)?;

        let now = self.clock.now();
        let (stored, changed) = self.mutate_transaction(id, expected_version, |current| {
            Ok(self.ledger.confirm_by_customer(current, now)?)
        })?;

        let mut events = Vec::new();
        if changed {
            info!(transaction_id = %stored.id, actor = %actor.id, "customer confirmed transaction");
            events.push(LifecycleEvent::PaymentConfirmed {
                transaction: stored.id.clone(),
                lead: stored.lead.clone(),
                party: ConfirmationParty::Customer,
            });
        }

        Ok(LifecycleOutcome {
            entity: self.view(stored)?,
            emitted_events: self.emit(events),
        })
    }

    /// Administrative transitions. `completed` is the agency half of dual confirmation.
    pub fn update_transaction_status(
        &self,
        actor: &Actor,
        id: &TransactionId,
        request: TransactionStatusRequest,
    ) -> Result<LifecycleOutcome<TransactionView>, LifecycleError> {
        self.authorize(actor, Resource::Transaction, Capability::Edit)?;
        let transaction = self.load_transaction(id)?;
        let lead = self.load_lead(&transaction.lead)?;
        self.resolver.require_administrator(&lead, actor)?;

        let now = self.clock.now();
        let (stored, _) = self.mutate_transaction(id, request.expected_version, |current| {
            let payment = self.payment_of(current)?;
            let next = self
                .ledger
                .transition(current, request.status, payment.as_ref(), now)?;
            Ok(Some(next))
        })?;

        info!(
            transaction_id = %stored.id,
            actor = %actor.id,
            status = %stored.status(),
            "transaction status changed"
        );
        let mut events = Vec::new();
        if stored.status() == TransactionStatus::Completed {
            events.push(LifecycleEvent::PaymentConfirmed {
                transaction: stored.id.clone(),
                lead: stored.lead.clone(),
                party: ConfirmationParty::Agency,
            });
        }

        Ok(LifecycleOutcome {
            entity: self.view(stored)?,
            emitted_events: self.emit(events),
        })
    }

    /// Paperwork for the transaction's own property only, even when the lead carries
    /// documents for other properties.
    pub fn transaction_documents(
        &self,
        actor: &Actor,
        id: &TransactionId,
    ) -> Result<Vec<Document>, LifecycleError> {
        self.authorize(actor, Resource::Transaction, Capability::View)?;
        let transaction = self.load_transaction(id)?;
        let lead = self.load_lead(&transaction.lead)?;
        self.require_transaction_viewer(&lead, actor)?;

        let mut documents = BTreeMap::new();
        for owner in [
            DocumentOwner::Transaction(transaction.id.clone()),
            DocumentOwner::Lead(lead.id.clone()),
        ] {
            for document in self.store.documents.list_documents(&owner)? {
                documents.entry(document.id.clone()).or_insert(document);
            }
        }

        Ok(self
            .ledger
            .documents_for(&transaction, documents.into_values()))
    }

    fn authorize(
        &self,
        actor: &Actor,
        resource: Resource,
        capability: Capability,
    ) -> Result<(), LifecycleError> {
        self.gate
            .require(actor, resource, capability)
            .map_err(|denied| {
                debug!(actor = %actor.id, error = %denied, "permission denied");
                denied.into()
            })
    }

    fn require_transaction_viewer(&self, lead: &Lead, actor: &Actor) -> Result<(), LifecycleError> {
        let allowed = self.resolver.is_administrator(lead, actor)
            || self.resolver.agent_can_view(lead, actor)
            || self.resolver.require_owner(lead, actor).is_ok();
        if allowed {
            Ok(())
        } else {
            Err(ScopeViolation::LeadOutOfScope {
                role: actor.role,
                actor: actor.id.to_string(),
                lead: lead.id.clone(),
            }
            .into())
        }
    }

    /// Validates an unsaved payment against the transaction before creating it, so refused
    /// payments never reach the store.
    fn settle_payment(
        &self,
        slot: &mut PaymentSlot,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<Payment, LifecycleError> {
        let new_payment = match slot {
            PaymentSlot::Stored(payment) | PaymentSlot::Created(payment) => {
                return Ok(payment.clone())
            }
            PaymentSlot::Unsaved(new_payment) => new_payment.clone(),
        };

        let provisional = Payment {
            id: PaymentId::new("provisional"),
            amount: new_payment.amount,
            currency: new_payment.currency.clone(),
            status: new_payment.status,
            method: None,
            reference: None,
            paid_at: None,
        };
        self.ledger.record_payment(transaction, &provisional, now)?;

        let created = self.store.payments.create_payment(new_payment)?;
        *slot = PaymentSlot::Created(created.clone());
        Ok(created)
    }

    /// Read-validate-write with a version check. A caller-pinned version is never retried;
    /// otherwise a store-level race is re-read up to `conflict_retries` times.
    fn mutate_lead<F>(
        &self,
        id: &LeadId,
        expected_version: Option<u64>,
        mut change: F,
    ) -> Result<(Lead, bool), LifecycleError>
    where
        F: FnMut(&Lead) -> Result<Option<Lead>, LifecycleError>,
    {
        let mut retries = self.retry_budget(expected_version);
        loop {
            let current = self.load_lead(id)?;
            check_version(EntityKind::Lead, id.as_str(), current.version, expected_version)?;

            let Some(mut next) = change(&current)? else {
                return Ok((current, false));
            };
            next.updated_at = self.clock.now();

            match self.store.leads.update(next, current.version) {
                Ok(stored) => return Ok((stored, true)),
                Err(RepositoryError::Conflict) if retries > 0 => {
                    retries -= 1;
                    warn!(lead_id = %id, "lead changed concurrently; retrying against fresh read");
                }
                Err(err) => {
                    return Err(LifecycleError::from_store(err, EntityKind::Lead, id.as_str()))
                }
            }
        }
    }

    fn mutate_transaction<F>(
        &self,
        id: &TransactionId,
        expected_version: Option<u64>,
        mut change: F,
    ) -> Result<(Transaction, bool), LifecycleError>
    where
        F: FnMut(&Transaction) -> Result<Option<Transaction>, LifecycleError>,
    {
        let mut retries = self.retry_budget(expected_version);
        loop {
            let current = self.load_transaction(id)?;
            check_version(
                EntityKind::Transaction,
                id.as_str(),
                current.version,
                expected_version,
            )?;

            let Some(mut next) = change(&current)? else {
                return Ok((current, false));
            };
            next.updated_at = self.clock.now();

            match self.store.transactions.update(next, current.version) {
                Ok(stored) => return Ok((stored, true)),
                Err(RepositoryError::Conflict) if retries > 0 => {
                    retries -= 1;
                    warn!(transaction_id = %id, "transaction changed concurrently; retrying against fresh read");
                }
                Err(err) => {
                    return Err(LifecycleError::from_store(
                        err,
                        EntityKind::Transaction,
                        id.as_str(),
                    ))
                }
            }
        }
    }

    fn retry_budget(&self, expected_version: Option<u64>) -> u8 {
        match expected_version {
            Some(_) => 0,
            None => self.config.conflict_retries,
        }
    }

    /// Idempotent per (lead, property): an existing record is returned as-is.
    fn ensure_transaction(&self, lead: &Lead) -> Result<TransactionView, LifecycleError> {
        let property_id = lead
            .property
            .as_ref()
            .ok_or(TransitionError::BookingWithoutProperty)?;

        if let Some(existing) = self
            .store
            .transactions
            .find_for_lead(&lead.id, property_id)?
        {
            return self.view(existing);
        }

        let property = self.load_property(property_id)?;
        let transaction =
            self.ledger
                .open(next_transaction_id(), lead, &property, self.clock.now())?;

        match self.store.transactions.insert(transaction) {
            Ok(stored) => {
                info!(
                    transaction_id = %stored.id,
                    lead_id = %lead.id,
                    property_id = %property_id,
                    "transaction opened"
                );
                self.view(stored)
            }
            Err(RepositoryError::Conflict) => {
                let existing = self
                    .store
                    .transactions
                    .find_for_lead(&lead.id, property_id)?
                    .ok_or_else(|| LifecycleError::Conflict {
                        entity: EntityKind::Transaction,
                        id: lead.id.to_string(),
                    })?;
                self.view(existing)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn view(&self, transaction: Transaction) -> Result<TransactionView, LifecycleError> {
        let payment = self.payment_of(&transaction)?;
        Ok(TransactionView::new(transaction, payment.as_ref()))
    }

    fn payment_of(&self, transaction: &Transaction) -> Result<Option<Payment>, LifecycleError> {
        transaction
            .payment()
            .map(|id| self.load_payment(id))
            .transpose()
    }

    fn visible_leads(&self, actor: &Actor) -> Result<Vec<Lead>, LifecycleError> {
        Ok(self
            .store
            .leads
            .list(&LeadFilter::default())?
            .into_iter()
            .filter(|lead| self.resolver.can_view(lead, actor))
            .collect())
    }

    fn roster(&self, agency: &AgencyId) -> Result<Vec<Agent>, LifecycleError> {
        Ok(self.store.directory.list_agents(agency)?)
    }

    fn require_agency(&self, agency: &AgencyId) -> Result<(), LifecycleError> {
        let known = self
            .store
            .directory
            .list_agencies()?
            .iter()
            .any(|candidate| &candidate.id == agency);
        if known {
            Ok(())
        } else {
            Err(LifecycleError::not_found(EntityKind::Agency, agency.as_str()))
        }
    }

    fn load_lead(&self, id: &LeadId) -> Result<Lead, LifecycleError> {
        self.store
            .leads
            .fetch(id)?
            .ok_or_else(|| LifecycleError::not_found(EntityKind::Lead, id.as_str()))
    }

    fn load_transaction(&self, id: &TransactionId) -> Result<Transaction, LifecycleError> {
        self.store
            .transactions
            .fetch(id)?
            .ok_or_else(|| LifecycleError::not_found(EntityKind::Transaction, id.as_str()))
    }

    fn load_property(&self, id: &PropertyId) -> Result<Property, LifecycleError> {
        self.store
            .properties
            .get_property(id)?
            .ok_or_else(|| LifecycleError::not_found(EntityKind::Property, id.as_str()))
    }

    fn load_payment(&self, id: &PaymentId) -> Result<Payment, LifecycleError> {
        self.store
            .payments
            .get_payment(id)?
            .ok_or_else(|| LifecycleError::not_found(EntityKind::Payment, id.as_str()))
    }

    /// Fire-and-forget: delivery failures are logged and never reach the caller.
    fn emit(&self, events: Vec<LifecycleEvent>) -> Vec<LifecycleEvent> {
        for event in &events {
            if let Err(err) = self.store.notifier.emit(event) {
                warn!(event = event.name(), error = %err, "notification delivery failed");
            }
        }
        events
    }
}

fn check_version(
    entity: EntityKind,
    id: &str,
    current: u64,
    expected: Option<u64>,
) -> Result<(), LifecycleError> {
    match expected {
        Some(expected) if expected != current => {
            debug!(%entity, id, expected, current, "stale version supplied");
            Err(LifecycleError::Conflict {
                entity,
                id: id.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn validate_contact(submission: &NewLead) -> Result<(), LifecycleError> {
    let contact = &submission.contact;
    let missing = [
        ("first_name", contact.first_name.as_str()),
        ("last_name", contact.last_name.as_str()),
        ("email", contact.email.as_str()),
        ("phone", contact.phone.as_str()),
    ]
    .into_iter()
    .find(|(_, value)| value.trim().is_empty());

    if let Some((field, _)) = missing {
        return Err(LifecycleError::Validation(format!(
            "contact {field} is required"
        )));
    }
    if !contact.email.contains('@') {
        return Err(LifecycleError::Validation(format!(
            "contact email '{}' is not an address",
            contact.email
        )));
    }
    Ok(())
}
