use serde::Serialize;

use super::domain::{Actor, Agent, AgencyId, AgentId, Lead, LeadId, Role};

/// The actor is outside the lead's resolved agency/agent scope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeViolation {
    #[error("{role} {actor} is outside the scope of lead {lead}")]
    LeadOutOfScope {
        role: Role,
        actor: String,
        lead: LeadId,
    },
    #[error("{role} {actor} is not an administrator for lead {lead}")]
    NotAdministrator {
        role: Role,
        actor: String,
        lead: LeadId,
    },
    #[error("{role} may only assign within their own agency, not {requested}")]
    ForeignAgency { role: Role, requested: AgencyId },
    #[error("agent {agent} does not belong to agency {agency}")]
    AgentOutsideAgency { agent: AgentId, agency: AgencyId },
    #[error("lead {lead} has no agency; assign an agency before an agent")]
    AgentWithoutAgency { lead: LeadId },
    #[error("only the customer who owns lead {lead} may confirm its transaction")]
    NotLeadOwner { lead: LeadId },
}

/// Current ownership of a lead as seen by an in-scope actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub agency: Option<AgencyId>,
    pub agent: Option<AgentId>,
}

/// Scope and reassignment rules across the super admin / agency / agent hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssignmentResolver;

impl AssignmentResolver {
    /// Whether the actor may see the lead at all. Listings use this to omit leads silently.
    pub fn can_view(&self, lead: &Lead, actor: &Actor) -> bool {
        match actor.role {
            Role::SuperAdmin => true,
            Role::AgencyAdmin | Role::Staff => same_agency(lead.agency(), actor),
            Role::Agent => self.agent_can_view(lead, actor),
            Role::Customer => {
                lead.is_approved
                    && lead
                        .customer
                        .as_ref()
                        .is_some_and(|customer| actor.is_user(customer))
            }
        }
    }

    /// Approval and assignment are both mandatory; either alone hides the lead.
    pub fn agent_can_view(&self, lead: &Lead, actor: &Actor) -> bool {
        lead.is_approved
            && lead
                .assigned_agent()
                .is_some_and(|agent| actor.is_agent(agent))
    }

    pub fn is_administrator(&self, lead: &Lead, actor: &Actor) -> bool {
        match actor.role {
            Role::SuperAdmin => true,
            Role::AgencyAdmin | Role::Staff => same_agency(lead.agency(), actor),
            Role::Agent | Role::Customer => false,
        }
    }

    pub fn resolve(&self, lead: &Lead, actor: &Actor) -> Result<Assignment, ScopeViolation> {
        if !self.can_view(lead, actor) {
            return Err(ScopeViolation::LeadOutOfScope {
                role: actor.role,
                actor: actor.id.to_string(),
                lead: lead.id.clone(),
            });
        }

        Ok(Assignment {
            agency: lead.agency().cloned(),
            agent: lead.assigned_agent().cloned(),
        })
    }

    pub fn require_administrator(&self, lead: &Lead, actor: &Actor) -> Result<(), ScopeViolation> {
        if self.is_administrator(lead, actor) {
            Ok(())
        } else {
            Err(ScopeViolation::NotAdministrator {
                role: actor.role,
                actor: actor.id.to_string(),
                lead: lead.id.clone(),
            })
        }
    }

    pub fn require_owner(&self, lead: &Lead, actor: &Actor) -> Result<(), ScopeViolation> {
        let owns = actor.role == Role::Customer
            && lead
                .customer
                .as_ref()
                .is_some_and(|customer| actor.is_user(customer));
        if owns {
            Ok(())
        } else {
            Err(ScopeViolation::NotLeadOwner {
                lead: lead.id.clone(),
            })
        }
    }

    /// Agencies an actor may route leads to: any for super admins, their own for agency staff.
    pub fn authorize_agency(&self, actor: &Actor, agency: &AgencyId) -> Result<(), ScopeViolation> {
        match actor.role {
            Role::SuperAdmin => Ok(()),
            Role::AgencyAdmin | Role::Staff if actor.agency.as_ref() == Some(agency) => Ok(()),
            role => Err(ScopeViolation::ForeignAgency {
                role,
                requested: agency.clone(),
            }),
        }
    }

    /// Returns the lead owned by `agency`. A changed agency always leaves the agent unset.
    pub fn reassign(&self, lead: &Lead, agency: Option<AgencyId>) -> Lead {
        let mut next = lead.clone();
        next.move_to_agency(agency);
        next
    }

    /// Attaches `agent` after checking membership against the lead agency's roster.
    pub fn assign_agent(
        &self,
        lead: &Lead,
        actor: &Actor,
        agent: &AgentId,
        roster: &[Agent],
    ) -> Result<Lead, ScopeViolation> {
        let agency = lead
            .agency()
            .ok_or_else(|| ScopeViolation::AgentWithoutAgency {
                lead: lead.id.clone(),
            })?;
        self.authorize_agency(actor, agency)?;

        let member = roster
            .iter()
            .any(|candidate| &candidate.id == agent && &candidate.agency == agency);
        if !member {
            return Err(ScopeViolation::AgentOutsideAgency {
                agent: agent.clone(),
                agency: agency.clone(),
            });
        }

        let mut next = lead.clone();
        next.set_agent(Some(agent.clone()));
        Ok(next)
    }
}

fn same_agency(agency: Option<&AgencyId>, actor: &Actor) -> bool {
    match (agency, actor.agency.as_ref()) {
        (Some(lead_agency), Some(actor_agency)) => lead_agency == actor_agency,
        _ => false,
    }
}
