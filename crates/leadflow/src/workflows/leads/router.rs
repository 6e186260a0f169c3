use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::domain::{Actor, AgencyId, LeadId, NewLead, Role, TransactionId};
use super::service::{
    ApprovalRequest, AssignmentRequest, FollowUpRequest, LeadLifecycleService, LeadQuery,
    LifecycleError, NoteRequest, PaymentRequest, StatusUpdate, TransactionStatusRequest,
};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_AGENCY_HEADER: &str = "x-actor-agency";

type SharedService = State<Arc<LeadLifecycleService>>;

/// Router builder exposing the lead and transaction lifecycle endpoints.
pub fn lifecycle_router(service: Arc<LeadLifecycleService>) -> Router {
    Router::new()
        .route(
            "/api/v1/leads",
            post(create_lead_handler).get(list_leads_handler),
        )
        .route("/api/v1/leads/:lead_id", get(get_lead_handler))
        .route("/api/v1/leads/:lead_id/status", post(status_handler))
        .route("/api/v1/leads/:lead_id/assignment", post(assignment_handler))
        .route("/api/v1/leads/:lead_id/approval", post(approval_handler))
        .route("/api/v1/leads/:lead_id/notes", post(note_handler))
        .route(
            "/api/v1/leads/:lead_id/transaction",
            post(open_transaction_handler),
        )
        .route("/api/v1/leads/:lead_id/follow-up", put(follow_up_handler))
        .route(
            "/api/v1/leads/:lead_id/follow-up/complete",
            post(complete_follow_up_handler),
        )
        .route("/api/v1/follow-ups", get(follow_up_agenda_handler))
        .route("/api/v1/follow-ups/dispatch", post(dispatch_handler))
        .route(
            "/api/v1/transactions/:transaction_id",
            get(get_transaction_handler),
        )
        .route(
            "/api/v1/transactions/:transaction_id/payments",
            post(payment_handler),
        )
        .route(
            "/api/v1/transactions/:transaction_id/confirm",
            post(confirm_handler),
        )
        .route(
            "/api/v1/transactions/:transaction_id/status",
            post(transaction_status_handler),
        )
        .route(
            "/api/v1/transactions/:transaction_id/documents",
            get(documents_handler),
        )
        .with_state(service)
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct VersionQuery {
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AgendaQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Identity headers were absent or malformed. Authentication itself happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorHeaderError {
    #[error("missing {0} header")]
    Missing(&'static str),
    #[error("{0}")]
    InvalidRole(String),
}

impl IntoResponse for ActorHeaderError {
    fn into_response(self) -> Response {
        let payload = json!({
            "error": "unauthenticated",
            "message": self.to_string(),
        });
        (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
    }
}

pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ActorHeaderError> {
    let header = |name: &'static str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let id = header(ACTOR_ID_HEADER).ok_or(ActorHeaderError::Missing(ACTOR_ID_HEADER))?;
    let role = header(ACTOR_ROLE_HEADER)
        .ok_or(ActorHeaderError::Missing(ACTOR_ROLE_HEADER))?
        .parse::<Role>()
        .map_err(ActorHeaderError::InvalidRole)?;
    let agency = header(ACTOR_AGENCY_HEADER).map(AgencyId::new);

    Ok(Actor::new(id, role, agency))
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let status = match &self {
            LifecycleError::PermissionDenied(_) | LifecycleError::ScopeViolation(_) => {
                StatusCode::FORBIDDEN
            }
            LifecycleError::InvalidTransition(_) | LifecycleError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LifecycleError::Conflict { .. } => StatusCode::CONFLICT,
            LifecycleError::NotFound { .. } => StatusCode::NOT_FOUND,
            LifecycleError::Repository(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        if status.is_server_error() {
            warn!(kind = self.kind(), error = %self, "lifecycle request failed");
        } else {
            debug!(kind = self.kind(), error = %self, "lifecycle request refused");
        }

        let payload = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(payload)).into_response()
    }
}

fn with_actor<T, F>(headers: &HeaderMap, success: StatusCode, operation: F) -> Response
where
    T: Serialize,
    F: FnOnce(&Actor) -> Result<T, LifecycleError>,
{
    let actor = match actor_from_headers(headers) {
        Ok(actor) => actor,
        Err(err) => return err.into_response(),
    };

    match operation(&actor) {
        Ok(body) => (success, Json(body)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn create_lead_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Json(submission): Json<NewLead>,
) -> Response {
    with_actor(&headers, StatusCode::CREATED, |actor| {
        service.create_lead(actor, submission)
    })
}

pub(crate) async fn list_leads_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Query(query): Query<LeadQuery>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.list_leads(actor, &query)
    })
}

pub(crate) async fn get_lead_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.get_lead(actor, &LeadId::new(lead_id))
    })
}

pub(crate) async fn status_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
    Json(request): Json<StatusUpdate>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.update_lead_status(actor, &LeadId::new(lead_id), request)
    })
}

pub(crate) async fn assignment_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
    Json(request): Json<AssignmentRequest>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.assign_lead(actor, &LeadId::new(lead_id), request)
    })
}

pub(crate) async fn approval_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
    Json(request): Json<ApprovalRequest>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.set_approval(actor, &LeadId::new(lead_id), request)
    })
}

pub(crate) async fn note_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
    Json(request): Json<NoteRequest>,
) -> Response {
    with_actor(&headers, StatusCode::CREATED, |actor| {
        service.add_note(actor, &LeadId::new(lead_id), request)
    })
}

pub(crate) async fn open_transaction_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.create_transaction_from_lead(actor, &LeadId::new(lead_id))
    })
}

pub(crate) async fn follow_up_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
    Json(request): Json<FollowUpRequest>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.set_follow_up(actor, &LeadId::new(lead_id), request)
    })
}

pub(crate) async fn complete_follow_up_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
    Query(version): Query<VersionQuery>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.complete_follow_up(actor, &LeadId::new(lead_id), version.expected_version)
    })
}

pub(crate) async fn follow_up_agenda_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Query(query): Query<AgendaQuery>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.list_follow_ups(actor, query.limit)
    })
}

pub(crate) async fn dispatch_handler(State(service): SharedService, headers: HeaderMap) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.dispatch_due_follow_ups(actor)
    })
}

pub(crate) async fn get_transaction_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(transaction_id): Path<String>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.get_transaction(actor, &TransactionId::new(transaction_id))
    })
}

pub(crate) async fn payment_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(transaction_id): Path<String>,
    Json(request): Json<PaymentRequest>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.record_payment(actor, &TransactionId::new(transaction_id), request)
    })
}

pub(crate) async fn confirm_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(transaction_id): Path<String>,
    Query(version): Query<VersionQuery>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.customer_confirm(
            actor,
            &TransactionId::new(transaction_id),
            version.expected_version,
        )
    })
}

pub(crate) async fn transaction_status_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(transaction_id): Path<String>,
    Json(request): Json<TransactionStatusRequest>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.update_transaction_status(actor, &TransactionId::new(transaction_id), request)
    })
}

pub(crate) async fn documents_handler(
    State(service): SharedService,
    headers: HeaderMap,
    Path(transaction_id): Path<String>,
) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service.transaction_documents(actor, &TransactionId::new(transaction_id))
    })
}
