//! RBAC permission checks with a cache keyed by `<user-id>:<permission>`
//! (spec §4.E).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::AuthError;
use crate::model::{Permission, User};

/// Where users live. `fleetd-auth` doesn't own user persistence — it's
/// handed a repository, mirroring how `fleetd-storage`'s `KVStore` stays
/// agnostic of what's stored above it.
#[async_trait::async_trait]
pub trait UserRepository: Send + Sync + 'static {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AuthError>;
}

/// In-memory repository, used by tests and the default local-agent setup.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, user: User) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn remove(&self, user_id: &str) {
        self.users.write().await.remove(user_id);
    }
}

#[async_trait::async_trait]
impl UserRepository for MemoryUserRepository {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }
}

/// `check-permission(user-id, perm)` with a read/write-locked cache.
///
/// The cache is invalidated per-user on [`RbacEvaluator::invalidate_user`],
/// which callers must invoke from their user-update/delete path (spec §4.E:
/// "Cache is cleared on user update/delete").
pub struct RbacEvaluator {
    repository: Arc<dyn UserRepository>,
    cache: RwLock<HashMap<String, bool>>,
}

impl RbacEvaluator {
    #[must_use]
    pub fn new(repository: Arc<dyn UserRepository>) -> Self {
        Self { repository, cache: RwLock::new(HashMap::new()) }
    }

    fn cache_key(user_id: &str, permission: &str) -> String {
        format!("{user_id}:{permission}")
    }

    /// `true` iff `permission` is in the user's direct grants or in the
    /// permission set implied by any of the user's roles. Admin implies
    /// every permission (spec §8 property 7).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UserNotFound`] if `user_id` doesn't resolve.
    pub async fn check_permission(&self, user_id: &str, permission: &Permission) -> Result<bool, AuthError> {
        let key = Self::cache_key(user_id, permission);
        if let Some(cached) = self.cache.read().await.get(&key).copied() {
            return Ok(cached);
        }

        let user = self.repository.get_user(user_id).await?.ok_or_else(|| AuthError::UserNotFound(user_id.to_owned()))?;
        let allowed = user.is_admin() || user.effective_permissions().contains(permission);

        self.cache.write().await.insert(key, allowed);
        Ok(allowed)
    }

    /// Clear every cached decision for `user_id`. Call this whenever the
    /// user's roles, direct permissions, or existence changes.
    pub async fn invalidate_user(&self, user_id: &str) {
        let prefix = format!("{user_id}:");
        self.cache.write().await.retain(|key, _| !key.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    async fn repo_with(user: User) -> Arc<MemoryUserRepository> {
        let repo = Arc::new(MemoryUserRepository::new());
        repo.upsert(user).await;
        repo
    }

    #[tokio::test]
    async fn checks_direct_permission() {
        let mut user = User::new("u1", "alice", "a@x.com");
        user.permissions.insert("device:view".to_owned());
        let repo = repo_with(user).await;
        let rbac = RbacEvaluator::new(repo);

        assert!(rbac.check_permission("u1", &"device:view".to_owned()).await.unwrap());
        assert!(!rbac.check_permission("u1", &"device:deploy".to_owned()).await.unwrap());
    }

    #[tokio::test]
    async fn checks_role_implied_permission() {
        let user = User::new("u1", "bob", "b@x.com").with_role(Role::Operator);
        let repo = repo_with(user).await;
        let rbac = RbacEvaluator::new(repo);

        assert!(rbac.check_permission("u1", &"device:deploy".to_owned()).await.unwrap());
    }

    #[tokio::test]
    async fn admin_implies_every_permission() {
        let user = User::new("u1", "root", "r@x.com").with_role(Role::Admin);
        let repo = repo_with(user).await;
        let rbac = RbacEvaluator::new(repo);

        assert!(rbac.check_permission("u1", &"anything:at-all".to_owned()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let repo = Arc::new(MemoryUserRepository::new());
        let rbac = RbacEvaluator::new(repo);
        let err = rbac.check_permission("ghost", &"device:view".to_owned()).await.unwrap_err();
        assert!(matches!(err, AuthError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn invalidate_clears_cached_decisions() {
        let repo = Arc::new(MemoryUserRepository::new());
        repo.upsert(User::new("u1", "alice", "a@x.com")).await;
        let rbac = RbacEvaluator::new(Arc::clone(&repo) as Arc<dyn UserRepository>);

        assert!(!rbac.check_permission("u1", &"device:view".to_owned()).await.unwrap());

        let mut updated = User::new("u1", "alice", "a@x.com");
        updated.permissions.insert("device:view".to_owned());
        repo.upsert(updated).await;

        // Still cached as false until invalidated.
        assert!(!rbac.check_permission("u1", &"device:view".to_owned()).await.unwrap());
        rbac.invalidate_user("u1").await;
        assert!(rbac.check_permission("u1", &"device:view".to_owned()).await.unwrap());
    }
}
