use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::domain::{Actor, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Lead,
    Transaction,
    Property,
}

impl Resource {
    pub const fn label(self) -> &'static str {
        match self {
            Resource::Lead => "lead",
            Resource::Transaction => "transaction",
            Resource::Property => "property",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    View,
    Create,
    Edit,
    Delete,
}

impl Capability {
    pub const fn label(self) -> &'static str {
        match self {
            Capability::View => "view",
            Capability::Create => "create",
            Capability::Edit => "edit",
            Capability::Delete => "delete",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Raised when the role lacks the capability; never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{role} may not {capability} {resource}")]
pub struct AccessDenied {
    pub role: Role,
    pub resource: Resource,
    pub capability: Capability,
}

use Capability::{Create, Delete, Edit, View};

const FULL: &[Capability] = &[View, Create, Edit, Delete];
const MANAGE: &[Capability] = &[View, Create, Edit];
const VIEW_EDIT: &[Capability] = &[View, Edit];
const VIEW_CREATE: &[Capability] = &[View, Create];
const VIEW_ONLY: &[Capability] = &[View];

fn grants(role: Role, resource: Resource) -> &'static [Capability] {
    match (role, resource) {
        (Role::SuperAdmin, _) => FULL,
        (Role::AgencyAdmin, Resource::Transaction) => MANAGE,
        (Role::AgencyAdmin, _) => FULL,
        (Role::Staff, Resource::Property) => VIEW_ONLY,
        (Role::Staff, _) => MANAGE,
        (Role::Agent, Resource::Lead) => VIEW_EDIT,
        (Role::Agent, _) => VIEW_ONLY,
        (Role::Customer, Resource::Lead) => VIEW_CREATE,
        (Role::Customer, Resource::Transaction) => VIEW_EDIT,
        (Role::Customer, Resource::Property) => VIEW_ONLY,
    }
}

/// Single role x resource x action table consulted once per operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessControlGate;

impl AccessControlGate {
    pub fn capabilities(&self, role: Role, resource: Resource) -> BTreeSet<Capability> {
        grants(role, resource).iter().copied().collect()
    }

    pub fn allows(&self, role: Role, resource: Resource, capability: Capability) -> bool {
        grants(role, resource).contains(&capability)
    }

    pub fn require(
        &self,
        actor: &Actor,
        resource: Resource,
        capability: Capability,
    ) -> Result<(), AccessDenied> {
        if self.allows(actor.role, resource, capability) {
            Ok(())
        } else {
            Err(AccessDenied {
                role: actor.role,
                resource,
                capability,
            })
        }
    }
}
