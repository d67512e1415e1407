//! Role to capability table and the authorization gate built on it.

use crate::credential::{Identity, Role};
use crate::error::AdmissionError;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

pub const USERS_READ_SELF: &str = "users:read-self";
pub const USERS_WRITE_SELF: &str = "users:write-self";
pub const USERS_READ_ALL: &str = "users:read-all";
pub const TASKS_READ: &str = "tasks:read";
pub const TASKS_WRITE: &str = "tasks:write";
pub const PROJECTS_READ: &str = "projects:read";
pub const PROJECTS_WRITE: &str = "projects:write";
pub const KNOWLEDGE_READ: &str = "knowledge:read";
pub const KNOWLEDGE_WRITE: &str = "knowledge:write";

const USER_CAPABILITIES: &[&str] = &[
    USERS_READ_SELF,
    USERS_WRITE_SELF,
    TASKS_READ,
    TASKS_WRITE,
    PROJECTS_READ,
    PROJECTS_WRITE,
    KNOWLEDGE_READ,
    KNOWLEDGE_WRITE,
];

const ADMIN_ONLY_CAPABILITIES: &[&str] = &[USERS_READ_ALL];

const VERIFIED_ONLY_CAPABILITIES: &[&str] = &[
    USERS_WRITE_SELF,
    TASKS_WRITE,
    PROJECTS_WRITE,
    KNOWLEDGE_WRITE,
];

static STANDARD: Lazy<CapabilityTable> = Lazy::new(|| {
    CapabilityTable::new()
        .grant(Role::User, USER_CAPABILITIES.iter().copied())
        .grant(Role::Admin, USER_CAPABILITIES.iter().copied())
        .grant(Role::Admin, ADMIN_ONLY_CAPABILITIES.iter().copied())
        .require_verified(VERIFIED_ONLY_CAPABILITIES.iter().copied())
});

/// Result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the operation is allowed.
    pub allowed: bool,
    /// Set when denied.
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Static mapping from role to the operation names it may perform.
///
/// Built once at configuration time and shared read-only across requests.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    grants: HashMap<Role, HashSet<String>>,
    verified_only: HashSet<String>,
}

impl CapabilityTable {
    /// An empty table that denies everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table the platform ships with.
    pub fn standard() -> Self {
        STANDARD.clone()
    }

    /// Add capabilities to a role.
    pub fn grant<I, S>(mut self, role: Role, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .entry(role)
            .or_default()
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Mark capabilities that only verified accounts may use.
    pub fn require_verified<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verified_only
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn allows(&self, role: Role, capability: &str) -> bool {
        self.grants
            .get(&role)
            .is_some_and(|set| set.contains(capability))
    }

    pub fn requires_verified(&self, capability: &str) -> bool {
        self.verified_only.contains(capability)
    }

    /// Decide whether `identity` may use `capability`.
    pub fn decide(&self, identity: &Identity, capability: &str) -> PolicyDecision {
        if !self.allows(identity.role, capability) {
            return PolicyDecision::deny(format!(
                "role '{}' lacks capability '{}'",
                identity.role, capability
            ));
        }
        if !identity.verified && self.requires_verified(capability) {
            return PolicyDecision::deny(format!(
                "capability '{}' requires a verified account",
                capability
            ));
        }
        PolicyDecision::allow()
    }

    /// Authorization gate: `Ok` or `Forbidden`.
    pub fn authorize(&self, identity: &Identity, capability: &str) -> Result<(), AdmissionError> {
        let decision = self.decide(identity, capability);
        if decision.allowed {
            Ok(())
        } else {
            Err(AdmissionError::Forbidden(
                decision.reason.unwrap_or_default(),
            ))
        }
    }
}
