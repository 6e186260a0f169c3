//! Lead pipeline, agency/agent scoping, follow-ups and the transaction ledger.
//!
//! Each request runs gate -> scope resolver -> state machine or ledger -> dispatcher. The
//! service holds no mutable state of its own; every durable record lives behind the
//! repository traits and is written with an optimistic version check.

pub mod access;
pub mod assignment;
pub mod domain;
pub mod follow_up;
pub mod ledger;
pub mod repository;
pub mod router;
pub mod service;
pub mod status;

#[cfg(test)]
mod tests;

pub use access::{AccessControlGate, AccessDenied, Capability, Resource};
pub use assignment::{Assignment, AssignmentResolver, ScopeViolation};
pub use domain::{
    Actor, Agency, AgencyId, Agent, AgentId, BudgetRange, Document, DocumentId, DocumentOwner,
    EntityRef, Inquiry, Lead, LeadContact, LeadId, LeadNote, LeadPriority, LeadSource,
    LeadStatus, LostReason, NewLead, NewPayment, Payment, PaymentId, PaymentStatus, Property,
    PropertyId, Role, StatusChange, Transaction, TransactionId, TransactionKind,
    TransactionStatus, UserId,
};
pub use follow_up::{FollowUpBucket, FollowUpEntry, FollowUpScheduler};
pub use ledger::{payment_details, PaymentDetails, TransactionLedger, TransactionView};
pub use repository::{
    ConfirmationParty, Directory, DispatchError, DocumentStore, LeadFilter, LeadRepository,
    LifecycleEvent, NotificationDispatcher, PaymentStore, PropertyCatalog, RepositoryError,
    TransactionRepository,
};
pub use router::{actor_from_headers, lifecycle_router, ActorHeaderError};
pub use service::{
    ApprovalRequest, AssignmentRequest, Clock, Collaborators, EntityKind, FollowUpRequest,
    LeadLifecycleService, LeadPage, LeadQuery, LifecycleError, LifecycleOutcome, NoteRequest,
    PaymentRecording, PaymentRequest, StatusTransition, StatusUpdate, SystemClock,
    TransactionStatusRequest,
};
pub use status::{StatusPlan, StatusStateMachine, TransitionError};
