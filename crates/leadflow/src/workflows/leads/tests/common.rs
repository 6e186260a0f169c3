use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::config::PipelineConfig;
use crate::workflows::leads::domain::{
    Actor, Agency, AgencyId, Agent, AgentId, Document, DocumentId, DocumentOwner, Inquiry, Lead,
    LeadContact, LeadId, LeadPriority, LeadSource, LeadStatus, NewLead, NewPayment, Payment,
    PaymentId, PaymentStatus, Property, PropertyId, Role, StatusChange, Transaction,
    TransactionId, TransactionKind, UserId,
};
use crate::workflows::leads::repository::{
    DispatchError, Directory, DocumentStore, LeadFilter, LeadRepository, LifecycleEvent,
    NotificationDispatcher, PaymentStore, PropertyCatalog, RepositoryError,
    TransactionRepository,
};
use crate::workflows::leads::service::{Clock, Collaborators, LeadLifecycleService};

pub(super) const NORTH: &str = "agency-north";
pub(super) const SOUTH: &str = "agency-south";
pub(super) const VILLA: &str = "prop-villa";
pub(super) const LOFT: &str = "prop-loft";

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn at(hour: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) struct FixedClock(pub(super) DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub(super) fn super_admin() -> Actor {
    Actor::new("root", Role::SuperAdmin, None)
}

pub(super) fn north_admin() -> Actor {
    Actor::new("admin-north", Role::AgencyAdmin, Some(AgencyId::new(NORTH)))
}

pub(super) fn south_admin() -> Actor {
    Actor::new("admin-south", Role::AgencyAdmin, Some(AgencyId::new(SOUTH)))
}

pub(super) fn north_staff() -> Actor {
    Actor::new("staff-north", Role::Staff, Some(AgencyId::new(NORTH)))
}

pub(super) fn agent_ana() -> Actor {
    Actor::new("agent-ana", Role::Agent, Some(AgencyId::new(NORTH)))
}

pub(super) fn customer() -> Actor {
    Actor::new("cust-1", Role::Customer, None)
}

pub(super) fn stranger() -> Actor {
    Actor::new("cust-2", Role::Customer, None)
}

pub(super) fn agencies() -> Vec<Agency> {
    vec![
        Agency {
            id: AgencyId::new(NORTH),
            name: "North Realty".to_string(),
        },
        Agency {
            id: AgencyId::new(SOUTH),
            name: "South Homes".to_string(),
        },
    ]
}

pub(super) fn agents() -> Vec<Agent> {
    vec![
        Agent {
            id: AgentId::new("agent-ana"),
            agency: AgencyId::new(NORTH),
            name: "Ana".to_string(),
        },
        Agent {
            id: AgentId::new("agent-bo"),
            agency: AgencyId::new(NORTH),
            name: "Bo".to_string(),
        },
        Agent {
            id: AgentId::new("agent-cy"),
            agency: AgencyId::new(SOUTH),
            name: "Cy".to_string(),
        },
    ]
}

pub(super) fn villa() -> Property {
    Property {
        id: PropertyId::new(VILLA),
        agency: Some(AgencyId::new(NORTH)),
        title: "Hillside villa".to_string(),
        listing: TransactionKind::Sale,
        price: 500_000,
        currency: "USD".to_string(),
    }
}

pub(super) fn loft() -> Property {
    Property {
        id: PropertyId::new(LOFT),
        agency: Some(AgencyId::new(SOUTH)),
        title: "Harbour loft".to_string(),
        listing: TransactionKind::Rent,
        price: 2_000,
        currency: "USD".to_string(),
    }
}

pub(super) fn contact() -> LeadContact {
    LeadContact {
        first_name: "Maya".to_string(),
        last_name: "Lind".to_string(),
        email: "maya@example.com".to_string(),
        phone: "+1 555 0100".to_string(),
        alternate_phone: None,
        address: None,
    }
}

pub(super) fn submission(property: Option<&str>) -> NewLead {
    NewLead {
        contact: contact(),
        customer: Some(UserId::new("cust-1")),
        property: property.map(PropertyId::new),
        agency: None,
        source: LeadSource::Website,
        priority: LeadPriority::Hot,
        inquiry: Inquiry::default(),
        follow_up_at: None,
    }
}

/// Lead built directly, bypassing the service, for pure component tests.
pub(super) fn lead_in(agency: Option<&str>, property: Option<&str>) -> Lead {
    let mut new_lead = submission(property);
    new_lead.agency = agency.map(AgencyId::new);
    Lead::new(LeadId::new("lead-fixture"), new_lead, now())
}

pub(super) fn lead_with_status(status: LeadStatus) -> Lead {
    let mut lead = lead_in(Some(NORTH), Some(VILLA));
    if status != LeadStatus::New {
        lead.record_status(StatusChange {
            from: LeadStatus::New,
            to: status,
            actor: UserId::new("root"),
            at: now(),
            lost_reason: None,
        });
    }
    lead
}

pub(super) fn pending_transaction() -> Transaction {
    Transaction::pending(
        TransactionId::new("txn-fixture"),
        LeadId::new("lead-fixture"),
        &villa(),
        now(),
    )
}

pub(super) fn payment(amount: u64, status: PaymentStatus) -> Payment {
    Payment {
        id: PaymentId::new("pay-fixture"),
        amount,
        currency: "USD".to_string(),
        status,
        method: Some("wire".to_string()),
        reference: Some("WX-1".to_string()),
        paid_at: Some(now()),
    }
}

pub(super) fn document(id: &str, owner: DocumentOwner, property: Option<&str>) -> Document {
    Document {
        id: DocumentId::new(id),
        name: format!("{id}.pdf"),
        owner,
        property: property.map(PropertyId::new),
        storage_key: format!("docs/{id}.pdf"),
    }
}

#[derive(Default, Clone)]
pub(super) struct MemoryLeads {
    pub(super) records: Arc<Mutex<HashMap<LeadId, Lead>>>,
}

impl LeadRepository for MemoryLeads {
    fn insert(&self, lead: Lead) -> Result<Lead, RepositoryError> {
        let mut guard = self.records.lock().expect("lead mutex poisoned");
        if guard.contains_key(&lead.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(lead.id.clone(), lead.clone());
        Ok(lead)
    }

    fn fetch(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let guard = self.records.lock().expect("lead mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn update(&self, mut lead: Lead, expected_version: u64) -> Result<Lead, RepositoryError> {
        let mut guard = self.records.lock().expect("lead mutex poisoned");
        let stored = guard.get(&lead.id).ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::Conflict);
        }
        lead.version = expected_version + 1;
        guard.insert(lead.id.clone(), lead.clone());
        Ok(lead)
    }

    fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>, RepositoryError> {
        let guard = self.records.lock().expect("lead mutex poisoned");
        Ok(guard
            .values()
            .filter(|lead| filter.matches(lead))
            .cloned()
            .collect())
    }
}

/// Simulates another writer landing between read and write for the first `races` updates.
#[derive(Clone)]
pub(super) struct RacingLeads {
    pub(super) inner: MemoryLeads,
    pub(super) races: Arc<Mutex<u8>>,
}

impl RacingLeads {
    pub(super) fn new(races: u8) -> Self {
        Self {
            inner: MemoryLeads::default(),
            races: Arc::new(Mutex::new(races)),
        }
    }
}

impl LeadRepository for RacingLeads {
    fn insert(&self, lead: Lead) -> Result<Lead, RepositoryError> {
        self.inner.insert(lead)
    }

    fn fetch(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        self.inner.fetch(id)
    }

    fn update(&self, lead: Lead, expected_version: u64) -> Result<Lead, RepositoryError> {
        let mut races = self.races.lock().expect("race mutex poisoned");
        if *races > 0 {
            *races -= 1;
            let mut records = self.inner.records.lock().expect("lead mutex poisoned");
            if let Some(stored) = records.get_mut(&lead.id) {
                stored.version += 1;
            }
            return Err(RepositoryError::Conflict);
        }
        drop(races);
        self.inner.update(lead, expected_version)
    }

    fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>, RepositoryError> {
        self.inner.list(filter)
    }
}

pub(super) struct UnavailableLeads;

impl LeadRepository for UnavailableLeads {
    fn insert(&self, _lead: Lead) -> Result<Lead, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch(&self, _id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn update(&self, _lead: Lead, _expected_version: u64) -> Result<Lead, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn list(&self, _filter: &LeadFilter) -> Result<Vec<Lead>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

#[derive(Default, Clone)]
pub(super) struct MemoryTransactions {
    pub(super) records: Arc<Mutex<HashMap<TransactionId, Transaction>>>,
}

impl MemoryTransactions {
    pub(super) fn count(&self) -> usize {
        self.records.lock().expect("transaction mutex poisoned").len()
    }
}

impl TransactionRepository for MemoryTransactions {
    fn insert(&self, transaction: Transaction) -> Result<Transaction, RepositoryError> {
        let mut guard = self.records.lock().expect("transaction mutex poisoned");
        let duplicate = guard.values().any(|existing| {
            existing.lead == transaction.lead && existing.property == transaction.property
        });
        if duplicate || guard.contains_key(&transaction.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(transaction.id.clone(), transaction.clone());
        Ok(transaction)
    }

    fn fetch(&self, id: &TransactionId) -> Result<Option<Transaction>, RepositoryError> {
        let guard = self.records.lock().expect("transaction mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn find_for_lead(
        &self,
        lead: &LeadId,
        property: &PropertyId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        let guard = self.records.lock().expect("transaction mutex poisoned");
        Ok(guard
            .values()
            .find(|existing| &existing.lead == lead && &existing.property == property)
            .cloned())
    }

    fn update(
        &self,
        mut transaction: Transaction,
        expected_version: u64,
    ) -> Result<Transaction, RepositoryError> {
        let mut guard = self.records.lock().expect("transaction mutex poisoned");
        let stored = guard
            .get(&transaction.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::Conflict);
        }
        transaction.version = expected_version + 1;
        guard.insert(transaction.id.clone(), transaction.clone());
        Ok(transaction)
    }
}

/// Loses the first `races` transaction updates to a concurrent writer.
#[derive(Clone)]
pub(super) struct RacingTransactions {
    pub(super) inner: MemoryTransactions,
    pub(super) races: Arc<Mutex<u8>>,
}

impl RacingTransactions {
    pub(super) fn new(races: u8) -> Self {
        Self {
            inner: MemoryTransactions::default(),
            races: Arc::new(Mutex::new(races)),
        }
    }
}

impl TransactionRepository for RacingTransactions {
    fn insert(&self, transaction: Transaction) -> Result<Transaction, RepositoryError> {
        self.inner.insert(transaction)
    }

    fn fetch(&self, id: &TransactionId) -> Result<Option<Transaction>, RepositoryError> {
        self.inner.fetch(id)
    }

    fn find_for_lead(
        &self,
        lead: &LeadId,
        property: &PropertyId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        self.inner.find_for_lead(lead, property)
    }

    fn update(
        &self,
        transaction: Transaction,
        expected_version: u64,
    ) -> Result<Transaction, RepositoryError> {
        let mut races = self.races.lock().expect("race mutex poisoned");
        if *races > 0 {
            *races -= 1;
            let mut records = self
                .inner
                .records
                .lock()
                .expect("transaction mutex poisoned");
            if let Some(stored) = records.get_mut(&transaction.id) {
                stored.version += 1;
            }
            return Err(RepositoryError::Conflict);
        }
        drop(races);
        self.inner.update(transaction, expected_version)
    }
}

/// Refuses inserts while `offline` is set; reads and updates pass through.
#[derive(Clone, Default)]
pub(super) struct OfflineInserts {
    pub(super) inner: MemoryTransactions,
    pub(super) offline: Arc<AtomicBool>,
}

impl TransactionRepository for OfflineInserts {
    fn insert(&self, transaction: Transaction) -> Result<Transaction, RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("ledger offline".to_string()));
        }
        self.inner.insert(transaction)
    }

    fn fetch(&self, id: &TransactionId) -> Result<Option<Transaction>, RepositoryError> {
        self.inner.fetch(id)
    }

    fn find_for_lead(
        &self,
        lead: &LeadId,
        property: &PropertyId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        self.inner.find_for_lead(lead, property)
    }

    fn update(
        &self,
        transaction: Transaction,
        expected_version: u64,
    ) -> Result<Transaction, RepositoryError> {
        self.inner.update(transaction, expected_version)
    }
}

pub(super) struct StaticDirectory;

impl Directory for StaticDirectory {
    fn list_agencies(&self) -> Result<Vec<Agency>, RepositoryError> {
        Ok(agencies())
    }

    fn list_agents(&self, agency: &AgencyId) -> Result<Vec<Agent>, RepositoryError> {
        Ok(agents()
            .into_iter()
            .filter(|agent| &agent.agency == agency)
            .collect())
    }
}

pub(super) struct StaticCatalog;

impl PropertyCatalog for StaticCatalog {
    fn get_property(&self, id: &PropertyId) -> Result<Option<Property>, RepositoryError> {
        Ok([villa(), loft()]
            .into_iter()
            .find(|property| &property.id == id))
    }
}

#[derive(Default, Clone)]
pub(super) struct MemoryPayments {
    pub(super) records: Arc<Mutex<HashMap<PaymentId, Payment>>>,
    sequence: Arc<AtomicU64>,
}

impl MemoryPayments {
    pub(super) fn count(&self) -> usize {
        self.records.lock().expect("payment mutex poisoned").len()
    }

    pub(super) fn seed(&self, payment: Payment) {
        self.records
            .lock()
            .expect("payment mutex poisoned")
            .insert(payment.id.clone(), payment);
    }
}

impl PaymentStore for MemoryPayments {
    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError> {
        let guard = self.records.lock().expect("payment mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn create_payment(&self, payment: NewPayment) -> Result<Payment, RepositoryError> {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let stored = Payment {
            id: PaymentId(format!("pay-{id:03}")),
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            method: payment.method,
            reference: payment.reference,
            paid_at: payment.paid_at,
        };
        self.seed(stored.clone());
        Ok(stored)
    }
}

#[derive(Default, Clone)]
pub(super) struct MemoryDocuments {
    pub(super) records: Arc<Mutex<Vec<Document>>>,
}

impl MemoryDocuments {
    pub(super) fn add(&self, document: Document) {
        self.records
            .lock()
            .expect("document mutex poisoned")
            .push(document);
    }
}

impl DocumentStore for MemoryDocuments {
    fn list_documents(&self, owner: &DocumentOwner) -> Result<Vec<Document>, RepositoryError> {
        let guard = self.records.lock().expect("document mutex poisoned");
        Ok(guard
            .iter()
            .filter(|document| &document.owner == owner)
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub(super) struct RecordingNotifier {
    pub(super) events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingNotifier {
    pub(super) fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().expect("notifier mutex poisoned").clone()
    }
}

impl NotificationDispatcher for RecordingNotifier {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), DispatchError> {
        self.events
            .lock()
            .expect("notifier mutex poisoned")
            .push(event.clone());
        Ok(())
    }
}

pub(super) struct FailingNotifier;

impl NotificationDispatcher for FailingNotifier {
    fn emit(&self, _event: &LifecycleEvent) -> Result<(), DispatchError> {
        Err(DispatchError::Transport("smtp relay down".to_string()))
    }
}

pub(super) struct Harness {
    pub(super) service: LeadLifecycleService,
    pub(super) transactions: MemoryTransactions,
    pub(super) payments: MemoryPayments,
    pub(super) documents: MemoryDocuments,
    pub(super) notifier: RecordingNotifier,
}

pub(super) fn harness() -> Harness {
    harness_with(Arc::new(MemoryLeads::default()), PipelineConfig::default())
}

pub(super) fn harness_with(leads: Arc<dyn LeadRepository>, config: PipelineConfig) -> Harness {
    let transactions = MemoryTransactions::default();
    assemble(leads, Arc::new(transactions.clone()), transactions, config)
}

/// Harness over a wrapped transaction store; `records` is the memory store it delegates to.
pub(super) fn harness_with_transactions(
    store: Arc<dyn TransactionRepository>,
    records: MemoryTransactions,
) -> Harness {
    assemble(
        Arc::new(MemoryLeads::default()),
        store,
        records,
        PipelineConfig::default(),
    )
}

fn assemble(
    leads: Arc<dyn LeadRepository>,
    store: Arc<dyn TransactionRepository>,
    transactions: MemoryTransactions,
    config: PipelineConfig,
) -> Harness {
    let payments = MemoryPayments::default();
    let documents = MemoryDocuments::default();
    let notifier = RecordingNotifier::default();

    let collaborators = Collaborators {
        leads,
        transactions: store,
        directory: Arc::new(StaticDirectory),
        properties: Arc::new(StaticCatalog),
        payments: Arc::new(payments.clone()),
        documents: Arc::new(documents.clone()),
        notifier: Arc::new(notifier.clone()),
    };
    let service =
        LeadLifecycleService::new(collaborators, config).with_clock(Arc::new(FixedClock(now())));

    Harness {
        service,
        transactions,
        payments,
        documents,
        notifier,
    }
}

pub(super) fn failing_notifier_service() -> LeadLifecycleService {
    let collaborators = Collaborators {
        leads: Arc::new(MemoryLeads::default()),
        transactions: Arc::new(MemoryTransactions::default()),
        directory: Arc::new(StaticDirectory),
        properties: Arc::new(StaticCatalog),
        payments: Arc::new(MemoryPayments::default()),
        documents: Arc::new(MemoryDocuments::default()),
        notifier: Arc::new(FailingNotifier),
    };
    LeadLifecycleService::new(collaborators, PipelineConfig::default())
        .with_clock(Arc::new(FixedClock(now())))
}

/// Customer-owned villa lead in the north agency, approved and assigned to Ana.
pub(super) fn routed_lead(service: &LeadLifecycleService) -> Lead {
    let lead = service
        .create_lead(&customer(), submission(Some(VILLA)))
        .expect("lead created")
        .entity;
    service
        .set_approval(
            &north_admin(),
            &lead.id,
            crate::workflows::leads::service::ApprovalRequest {
                approved: true,
                expected_version: None,
            },
        )
        .expect("approved");
    service
        .assign_lead(
            &north_admin(),
            &lead.id,
            crate::workflows::leads::service::AssignmentRequest {
                agency: None,
                agent: Some(AgentId::new("agent-ana")),
                expected_version: None,
            },
        )
        .expect("agent assigned")
        .entity
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
