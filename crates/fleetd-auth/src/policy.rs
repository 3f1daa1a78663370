//! Resource-scoped allow/deny policies with priority and conditions (spec
//! §3 `Policy`, §4.E, §8 property 8).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::AuthError;
use crate::model::{Role, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// Conditions currently supported (spec §4.E): role-equals/role-not-equals.
/// Anything else (`Other`) defaults to not-satisfied rather than erroring,
/// per spec — it carries the raw condition payload so an unrecognized
/// condition kind round-trips through storage without being rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Condition {
    RoleEquals(Role),
    RoleNotEquals(Role),
    Other(serde_json::Value),
}

impl Condition {
    fn is_satisfied(&self, user: &User) -> bool {
        match self {
            Self::RoleEquals(role) => user.roles.contains(role),
            Self::RoleNotEquals(role) => !user.roles.contains(role),
            Self::Other(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub resource: String,
    pub actions: Vec<String>,
    pub effect: Effect,
    pub conditions: Vec<Condition>,
    pub priority: i32,
}

impl Policy {
    #[must_use]
    pub fn new(id: impl Into<String>, resource: impl Into<String>, actions: Vec<String>, effect: Effect) -> Self {
        Self { id: id.into(), resource: resource.into(), actions, effect, conditions: Vec::new(), priority: 0 }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    fn matches(&self, resource: &str, action: &str) -> bool {
        self.resource == resource && (self.actions.iter().any(|a| a == action) || self.actions.iter().any(|a| a == "*"))
    }

    fn is_satisfied(&self, user: &User) -> bool {
        self.conditions.iter().all(|c| c.is_satisfied(user))
    }
}

/// Where policies live, analogous to [`crate::rbac::UserRepository`].
#[async_trait::async_trait]
pub trait PolicyRepository: Send + Sync + 'static {
    async fn list_policies(&self) -> Result<Vec<Policy>, AuthError>;
}

#[derive(Default)]
pub struct MemoryPolicyRepository {
    policies: RwLock<Vec<Policy>>,
}

impl MemoryPolicyRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, policy: Policy) {
        self.policies.write().await.push(policy);
    }
}

#[async_trait::async_trait]
impl PolicyRepository for MemoryPolicyRepository {
    async fn list_policies(&self) -> Result<Vec<Policy>, AuthError> {
        Ok(self.policies.read().await.clone())
    }
}

/// `check-policy(user, resource, action)` — any satisfied deny short-circuits
/// to deny; otherwise a satisfied allow grants; absence of an allow is an
/// implicit deny (spec §3, §8 property 8).
pub struct PolicyEvaluator {
    repository: Arc<dyn PolicyRepository>,
}

impl PolicyEvaluator {
    #[must_use]
    pub fn new(repository: Arc<dyn PolicyRepository>) -> Self {
        Self { repository }
    }

    /// # Errors
    ///
    /// Returns [`AuthError::PermissionDenied`] if any matching, satisfied
    /// deny policy applies, or if no matching allow policy applies.
    pub async fn check_policy(&self, user: &User, resource: &str, action: &str) -> Result<(), AuthError> {
        let policies = self.repository.list_policies().await?;
        let matching: Vec<&Policy> = policies.iter().filter(|p| p.matches(resource, action) && p.is_satisfied(user)).collect();

        if matching.iter().any(|p| p.effect == Effect::Deny) {
            return Err(AuthError::PermissionDenied);
        }
        if matching.iter().any(|p| p.effect == Effect::Allow) {
            return Ok(());
        }
        Err(AuthError::PermissionDenied)
    }
}
