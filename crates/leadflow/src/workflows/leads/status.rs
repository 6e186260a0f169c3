use chrono::{DateTime, Utc};

use super::domain::{
    Actor, Lead, LeadStatus, LostReason, PaymentStatus, StatusChange, TransactionStatus,
};

/// Refused edge in either the lead pipeline or the transaction ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("lead cannot move from {from} to {to}")]
    LeadEdge { from: LeadStatus, to: LeadStatus },
    #[error("lead is {0}; terminal leads accept notes only")]
    Terminal(LeadStatus),
    #[error("a lost reason is required when marking a lead lost")]
    MissingLostReason,
    #[error("unknown lost reason '{0}'")]
    UnknownLostReason(String),
    #[error("a lost reason is only accepted when marking a lead lost (requested {0})")]
    UnexpectedLostReason(LeadStatus),
    #[error("lead has no property to book")]
    BookingWithoutProperty,
    #[error("lead is {0}; transactions are opened for booked leads only")]
    LeadNotBooked(LeadStatus),
    #[error("agency and agent cannot change in one request; assign the agent after the agency change")]
    AgentWithAgencyChange,
    #[error("transaction cannot move from {from} to {to}")]
    TransactionEdge {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("transaction is {0} and no longer accepts changes")]
    TransactionClosed(TransactionStatus),
    #[error("completion requires a completed payment (found {payment:?}) and customer confirmation (confirmed: {customer_confirmed})")]
    CompletionRequirements {
        payment: Option<PaymentStatus>,
        customer_confirmed: bool,
    },
    #[error("payment of {paid} exceeds transaction amount {amount}")]
    PaymentExceedsAmount { amount: u64, paid: u64 },
    #[error("payment currency {found} does not match transaction currency {expected}")]
    CurrencyMismatch { expected: String, found: String },
}

/// Outcome of validating a status request against the current lead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusPlan {
    Unchanged,
    Transition {
        from: LeadStatus,
        to: LeadStatus,
        lost_reason: Option<LostReason>,
    },
}

const PIPELINE: [LeadStatus; 6] = [
    LeadStatus::New,
    LeadStatus::Contacted,
    LeadStatus::Qualified,
    LeadStatus::SiteVisit,
    LeadStatus::Negotiation,
    LeadStatus::Booked,
];

fn stage(status: LeadStatus) -> Option<usize> {
    PIPELINE.iter().position(|candidate| *candidate == status)
}

/// Canonical lead-status graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusStateMachine;

impl StatusStateMachine {
    /// Forward moves may skip stages; backward moves correct by one stage only.
    pub fn allows(&self, from: LeadStatus, to: LeadStatus) -> bool {
        if from.is_terminal() || from == to {
            return false;
        }

        match to {
            LeadStatus::Converted | LeadStatus::Lost => true,
            LeadStatus::Closed => from == LeadStatus::Booked,
            _ => match (stage(from), stage(to)) {
                (Some(current), Some(target)) => target > current || target + 1 == current,
                _ => false,
            },
        }
    }

    pub fn successors(&self, from: LeadStatus) -> Vec<LeadStatus> {
        LeadStatus::ordered()
            .into_iter()
            .filter(|to| self.allows(from, *to))
            .collect()
    }

    pub fn plan(
        &self,
        lead: &Lead,
        to: LeadStatus,
        lost_reason: Option<&str>,
    ) -> Result<StatusPlan, TransitionError> {
        let from = lead.status();
        if from.is_terminal() {
            return Err(TransitionError::Terminal(from));
        }

        let lost_reason = parse_lost_reason(lost_reason)?;
        if to != LeadStatus::Lost && lost_reason.is_some() {
            return Err(TransitionError::UnexpectedLostReason(to));
        }
        if from == to {
            return Ok(StatusPlan::Unchanged);
        }
        if !self.allows(from, to) {
            return Err(TransitionError::LeadEdge { from, to });
        }

        match to {
            LeadStatus::Lost if lost_reason.is_none() => Err(TransitionError::MissingLostReason),
            LeadStatus::Booked if lead.property.is_none() => {
                Err(TransitionError::BookingWithoutProperty)
            }
            _ => Ok(StatusPlan::Transition {
                from,
                to,
                lost_reason,
            }),
        }
    }

    /// Applies a planned transition to a copy of the lead and appends the audit entry.
    pub fn apply(&self, lead: &Lead, plan: &StatusPlan, actor: &Actor, at: DateTime<Utc>) -> Lead {
        let mut next = lead.clone();
        if let StatusPlan::Transition {
            from,
            to,
            lost_reason,
        } = plan
        {
            next.record_status(StatusChange {
                from: *from,
                to: *to,
                actor: actor.id.clone(),
                at,
                lost_reason: *lost_reason,
            });
        }
        next
    }
}

/// Empty input counts as absent; anything else must come from the fixed vocabulary.
pub fn parse_lost_reason(raw: Option<&str>) -> Result<Option<LostReason>, TransitionError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<LostReason>()
            .map(Some)
            .map_err(TransitionError::UnknownLostReason),
    }
}
