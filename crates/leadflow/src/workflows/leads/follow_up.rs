use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{Lead, LeadId, LeadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpBucket {
    Overdue,
    Today,
    Upcoming,
}

impl FollowUpBucket {
    pub const fn label(self) -> &'static str {
        match self {
            FollowUpBucket::Overdue => "overdue",
            FollowUpBucket::Today => "today",
            FollowUpBucket::Upcoming => "upcoming",
        }
    }

    pub const fn is_due(self) -> bool {
        matches!(self, FollowUpBucket::Overdue | FollowUpBucket::Today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowUpEntry {
    pub lead_id: LeadId,
    pub contact_name: String,
    pub status: LeadStatus,
    pub follow_up_at: DateTime<Utc>,
    pub bucket: FollowUpBucket,
}

/// Pure classification of scheduled follow-ups.
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowUpScheduler;

impl FollowUpScheduler {
    /// Past timestamps are overdue even when they fall earlier on the current day.
    pub fn classify(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> FollowUpBucket {
        if at < now {
            FollowUpBucket::Overdue
        } else if at.date_naive() == now.date_naive() {
            FollowUpBucket::Today
        } else {
            FollowUpBucket::Upcoming
        }
    }

    /// Clears the schedule. Status is left untouched.
    pub fn mark_complete(&self, lead: &Lead) -> Lead {
        let mut next = lead.clone();
        next.follow_up_at = None;
        next
    }

    /// Ascending by date, capped at `limit`. Leads without a date are excluded.
    pub fn agenda<'a, I>(&self, leads: I, now: DateTime<Utc>, limit: usize) -> Vec<FollowUpEntry>
    where
        I: IntoIterator<Item = &'a Lead>,
    {
        let mut entries: Vec<FollowUpEntry> = leads
            .into_iter()
            .filter_map(|lead| {
                lead.follow_up_at.map(|at| FollowUpEntry {
                    lead_id: lead.id.clone(),
                    contact_name: lead.contact.full_name(),
                    status: lead.status(),
                    follow_up_at: at,
                    bucket: self.classify(at, now),
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            a.follow_up_at
                .cmp(&b.follow_up_at)
                .then_with(|| a.lead_id.cmp(&b.lead_id))
        });
        entries.truncate(limit);
        entries
    }
}
