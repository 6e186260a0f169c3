use chrono::{DateTime, NaiveDate, Utc};
use leadflow::config::PipelineConfig;
use leadflow::workflows::leads::{
    Agency, AgencyId, Agent, AgentId, Collaborators, DispatchError, Directory, Document,
    DocumentId, DocumentOwner, DocumentStore, Lead, LeadFilter, LeadId, LeadLifecycleService,
    LeadRepository, LifecycleEvent, NewPayment, NotificationDispatcher, Payment, PaymentId,
    PaymentStore, Property, PropertyCatalog, PropertyId, RepositoryError, Transaction,
    TransactionId, TransactionKind, TransactionRepository,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, RepositoryError> {
    mutex
        .lock()
        .map_err(|_| RepositoryError::Unavailable("in-memory store poisoned".to_string()))
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryLeadRepository {
    records: Arc<Mutex<HashMap<LeadId, Lead>>>,
}

impl LeadRepository for InMemoryLeadRepository {
    fn insert(&self, lead: Lead) -> Result<Lead, RepositoryError> {
        let mut guard = lock(&self.records)?;
        if guard.contains_key(&lead.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(lead.id.clone(), lead.clone());
        Ok(lead)
    }

    fn fetch(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        Ok(lock(&self.records)?.get(id).cloned())
    }

    fn update(&self, mut lead: Lead, expected_version: u64) -> Result<Lead, RepositoryError> {
        let mut guard = lock(&self.records)?;
        let stored = guard.get(&lead.id).ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::Conflict);
        }
        lead.version = expected_version + 1;
        guard.insert(lead.id.clone(), lead.clone());
        Ok(lead)
    }

    fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>, RepositoryError> {
        Ok(lock(&self.records)?
            .values()
            .filter(|lead| filter.matches(lead))
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryTransactionRepository {
    records: Arc<Mutex<HashMap<TransactionId, Transaction>>>,
}

impl TransactionRepository for InMemoryTransactionRepository {
    fn insert(&self, transaction: Transaction) -> Result<Transaction, RepositoryError> {
        let mut guard = lock(&self.records)?;
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
        Ok(lock(&self.records)?.get(id).cloned())
    }

    fn find_for_lead(
        &self,
        lead: &LeadId,
        property: &PropertyId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        Ok(lock(&self.records)?
            .values()
            .find(|existing| &existing.lead == lead && &existing.property == property)
            .cloned())
    }

    fn update(
        &self,
        mut transaction: Transaction,
        expected_version: u64,
    ) -> Result<Transaction, RepositoryError> {
        let mut guard = lock(&self.records)?;
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

#[derive(Default, Clone)]
pub(crate) struct InMemoryPaymentStore {
    records: Arc<Mutex<HashMap<PaymentId, Payment>>>,
    sequence: Arc<AtomicU64>,
}

impl PaymentStore for InMemoryPaymentStore {
    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError> {
        Ok(lock(&self.records)?.get(id).cloned())
    }

    fn create_payment(&self, payment: NewPayment) -> Result<Payment, RepositoryError> {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let stored = Payment {
            id: PaymentId(format!("pay-{id:06}")),
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            method: payment.method,
            reference: payment.reference,
            paid_at: payment.paid_at,
        };
        lock(&self.records)?.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }
}

/// Fixed agencies, agents, listings and paperwork served by the demo deployment.
#[derive(Clone)]
pub(crate) struct SeedCatalog {
    agencies: Vec<Agency>,
    agents: Vec<Agent>,
    properties: Vec<Property>,
    documents: Arc<Mutex<Vec<Document>>>,
}

impl SeedCatalog {
    pub(crate) fn attach_document(&self, document: Document) -> Result<(), RepositoryError> {
        lock(&self.documents)?.push(document);
        Ok(())
    }
}

impl Default for SeedCatalog {
    fn default() -> Self {
        let agency = |id: &str, name: &str| Agency {
            id: AgencyId::new(id),
            name: name.to_string(),
        };
        let agent = |id: &str, agency: &str, name: &str| Agent {
            id: AgentId::new(id),
            agency: AgencyId::new(agency),
            name: name.to_string(),
        };
        let property = |id: &str,
                        agency: &str,
                        title: &str,
                        listing: TransactionKind,
                        price: u64,
                        currency: &str| Property {
                id: PropertyId::new(id),
                agency: Some(AgencyId::new(agency)),
                title: title.to_string(),
                listing,
                price,
                currency: currency.to_string(),
            };

        Self {
            agencies: vec![
                agency("agency-harbor", "Harbor Realty"),
                agency("agency-summit", "Summit Homes"),
            ],
            agents: vec![
                agent("agent-lena", "agency-harbor", "Lena Ortiz"),
                agent("agent-omar", "agency-harbor", "Omar Haddad"),
                agent("agent-rui", "agency-summit", "Rui Costa"),
            ],
            properties: vec![
                property(
                    "prop-bayview",
                    "agency-harbor",
                    "Bayview penthouse",
                    TransactionKind::Sale,
                    125_000_000,
                    "USD",
                ),
                property(
                    "prop-elm-12",
                    "agency-summit",
                    "12 Elm Street, unit 4",
                    TransactionKind::Rent,
                    240_000,
                    "USD",
                ),
            ],
            documents: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Directory for SeedCatalog {
    fn list_agencies(&self) -> Result<Vec<Agency>, RepositoryError> {
        Ok(self.agencies.clone())
    }

    fn list_agents(&self, agency: &AgencyId) -> Result<Vec<Agent>, RepositoryError> {
        Ok(self
            .agents
            .iter()
            .filter(|agent| &agent.agency == agency)
            .cloned()
            .collect())
    }
}

impl PropertyCatalog for SeedCatalog {
    fn get_property(&self, id: &PropertyId) -> Result<Option<Property>, RepositoryError> {
        Ok(self
            .properties
            .iter()
            .find(|property| &property.id == id)
            .cloned())
    }
}

impl DocumentStore for SeedCatalog {
    fn list_documents(&self, owner: &DocumentOwner) -> Result<Vec<Document>, RepositoryError> {
        Ok(lock(&self.documents)?
            .iter()
            .filter(|document| &document.owner == owner)
            .cloned()
            .collect())
    }
}

/// Writes every lifecycle event to the log. A recording dispatcher also keeps a copy for
/// inspection; the default one does not retain anything.
#[derive(Default, Clone)]
pub(crate) struct LoggingDispatcher {
    retained: Option<Arc<Mutex<Vec<LifecycleEvent>>>>,
}

impl LoggingDispatcher {
    pub(crate) fn recording() -> Self {
        Self {
            retained: Some(Arc::default()),
        }
    }

    pub(crate) fn events(&self) -> Vec<LifecycleEvent> {
        self.retained
            .as_ref()
            .and_then(|events| events.lock().ok().map(|guard| guard.clone()))
            .unwrap_or_default()
    }
}

impl NotificationDispatcher for LoggingDispatcher {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), DispatchError> {
        let payload = serde_json::to_string(event)
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        info!(event = event.name(), %payload, "lifecycle notification");
        if let Some(events) = &self.retained {
            events
                .lock()
                .map_err(|_| DispatchError::Transport("outbox poisoned".to_string()))?
                .push(event.clone());
        }
        Ok(())
    }
}

/// Handles to the in-memory collaborators wired into a service instance.
#[derive(Clone, Default)]
pub(crate) struct InMemoryStores {
    pub(crate) leads: InMemoryLeadRepository,
    pub(crate) transactions: InMemoryTransactionRepository,
    pub(crate) payments: InMemoryPaymentStore,
    pub(crate) catalog: SeedCatalog,
    pub(crate) dispatcher: LoggingDispatcher,
}

impl InMemoryStores {
    pub(crate) fn service(&self, config: PipelineConfig) -> LeadLifecycleService {
        let catalog = Arc::new(self.catalog.clone());
        let collaborators = Collaborators {
            leads: Arc::new(self.leads.clone()),
            transactions: Arc::new(self.transactions.clone()),
            directory: catalog.clone(),
            properties: catalog.clone(),
            payments: Arc::new(self.payments.clone()),
            documents: catalog,
            notifier: Arc::new(self.dispatcher.clone()),
        };
        LeadLifecycleService::new(collaborators, config)
    }
}

pub(crate) fn document(
    id: &str,
    owner: DocumentOwner,
    property: &str,
    name: &str,
) -> Document {
    Document {
        id: DocumentId::new(id),
        name: name.to_string(),
        owner,
        property: Some(PropertyId::new(property)),
        storage_key: format!("s3://leadflow/docs/{id}.pdf"),
    }
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|err| format!("invalid date '{value}': {err}"))
}

/// Midday UTC on the given date, the demo's notion of "now".
pub(crate) fn midday(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(12, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or_else(Utc::now)
}
