//! Users, roles, and permissions (spec §3 `User`, `Role`).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A string-valued capability grant, e.g. `device:view` (glossary).
pub type Permission = String;

/// Compile-time role catalog. `Custom` covers operator-defined roles whose
/// permission set is supplied out of band (spec §3: "Role → Permission set
/// is a compile-time mapping" — `Custom` is the escape hatch for roles that
/// don't fit the built-in catalog without widening it into a full DSL, which
/// is an explicit Non-goal).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
    Device,
    Service,
    Custom(String),
}

impl Role {
    /// The compile-time permission set for this role. `Admin` is handled as
    /// a special case by callers (implies every permission) rather than
    /// enumerated here, so this set stays finite without tracking every
    /// permission string that's ever minted.
    #[must_use]
    pub fn permissions(&self) -> HashSet<Permission> {
        match self {
            Self::Admin => HashSet::new(),
            Self::Operator => [
                "device:view",
                "device:deploy",
                "device:stop",
                "device:restart",
                "vault:read",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            Self::Viewer => ["device:view", "vault:read"].into_iter().map(str::to_owned).collect(),
            Self::Device => ["device:heartbeat", "device:metrics:report"].into_iter().map(str::to_owned).collect(),
            Self::Service => ["device:view", "device:deploy", "vault:read", "vault:write"].into_iter().map(str::to_owned).collect(),
            Self::Custom(_) => HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub roles: HashSet<Role>,
    pub permissions: HashSet<Permission>,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn new(id: impl Into<String>, username: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            username: username.into(),
            email: email.into(),
            roles: HashSet::new(),
            permissions: HashSet::new(),
            metadata: std::collections::HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    /// The effective permission set: direct grants plus every role-implied
    /// permission (spec §8 property 7).
    #[must_use]
    pub fn effective_permissions(&self) -> HashSet<Permission> {
        let mut all = self.permissions.clone();
        for role in &self.roles {
            all.extend(role.permissions());
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_permissions_union_direct_and_role() {
        let user = User::new("u1", "alice", "a@x.com").with_role(Role::Viewer);
        let mut user = user;
        user.permissions.insert("custom:thing".to_owned());

        let perms = user.effective_permissions();
        assert!(perms.contains("device:view"));
        assert!(perms.contains("custom:thing"));
    }

    #[test]
    fn admin_role_is_detected() {
        let user = User::new("u1", "root", "r@x.com").with_role(Role::Admin);
        assert!(user.is_admin());
    }
}
