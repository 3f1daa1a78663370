//! Credential and on-disk record types (spec §3 `Credential`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of secret a [`Credential`] holds, driving rotation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialType {
    ApiKey,
    Token,
    Certificate,
    PrivateKey,
    Password,
    Secret,
}

impl CredentialType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api-key",
            Self::Token => "token",
            Self::Certificate => "certificate",
            Self::PrivateKey => "private-key",
            Self::Password => "password",
            Self::Secret => "secret",
        }
    }
}

/// A credential with its value in plaintext — the shape callers work with.
/// Never written to disk in this form; see [`CredentialRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub credential_type: CredentialType,
    pub name: String,
    pub value: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    #[must_use]
    pub fn new(id: impl Into<String>, credential_type: CredentialType, name: impl Into<String>, value: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            credential_type,
            name: name.into(),
            value: value.into(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

/// On-disk representation: the credential's value is encrypted independently
/// of the envelope that wraps the whole record (spec §4.D: "the `.cred` file
/// contains the ciphertext of the JSON-encoded Credential — value itself
/// already encrypted inside"). Everything but `encrypted_value` is stored
/// (and logged) in the clear within the record, though the record as a whole
/// is never written to disk except as ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub credential_type: CredentialType,
    pub name: String,
    pub encrypted_value: Vec<u8>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Summary returned by `list` — values are never included (spec §4.D: "list
/// (values omitted)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub id: String,
    pub credential_type: CredentialType,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&CredentialRecord> for CredentialSummary {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            id: record.id.clone(),
            credential_type: record.credential_type,
            name: record.name.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
        }
    }
}

/// `vault.json` metadata (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMetadata {
    pub version: u32,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub salt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_is_expired_checks_against_now() {
        let cred = Credential::new("c1", CredentialType::Token, "n", "v")
            .with_expires_at(Utc::now() - chrono::Duration::seconds(1));
        assert!(cred.is_expired(Utc::now()));
    }

    #[test]
    fn credential_without_expiry_never_expires() {
        let cred = Credential::new("c1", CredentialType::Token, "n", "v");
        assert!(!cred.is_expired(Utc::now()));
    }
}
