//! The credential vault: encrypted-at-rest CRUD, rotation, export/import,
//! and a TTL-bounded plaintext cache (spec §4.D).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetd_resilience::Clock;
use rand::Rng;
use tokio::sync::RwLock;

use crate::audit::{AuditEntry, AuditManager, AuditOutcome};
use crate::crypto::{self, EncryptionKey};
use crate::error::VaultError;
use crate::model::{Credential, CredentialRecord, CredentialSummary, CredentialType, VaultMetadata};

const VAULT_ALGORITHM: &str = "AES-256-GCM+PBKDF2-HMAC-SHA256";
const VAULT_VERSION: u32 = 1;

struct CacheEntry {
    credential: Credential,
    cached_at: Duration,
}

/// Configuration for opening or initializing a vault rooted at a directory.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    pub cache_ttl: Duration,
}

impl VaultConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), cache_ttl: Duration::from_secs(300) }
    }
}

/// Encrypted local credential store.
///
/// Disk layout (spec §6): `<root>/vault.json`, `<root>/credentials/<id>.cred`,
/// `<root>/backup/<id>_<unix-ts>.cred`. All credential files are mode 0600,
/// directories mode 0700.
pub struct Vault {
    root: PathBuf,
    cache_ttl: Duration,
    master_key: EncryptionKey,
    cache: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    audit: AuditManager,
}

impl Vault {
    /// Initialize a brand-new vault at `config.root`: creates the directory
    /// layout, derives the master key from `master_password` with a fresh
    /// per-vault salt, and writes `vault.json`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AlreadyExists`] if `vault.json` is already
    /// present, or [`VaultError::Io`] on filesystem failure.
    pub async fn init(config: VaultConfig, master_password: &[u8], clock: Arc<dyn Clock>) -> Result<Self, VaultError> {
        let meta_path = config.root.join("vault.json");
        if tokio::fs::try_exists(&meta_path).await? {
            return Err(VaultError::AlreadyExists("vault.json".to_owned()));
        }

        create_dir_0700(&config.root).await?;
        create_dir_0700(&config.root.join("credentials")).await?;
        create_dir_0700(&config.root.join("backup")).await?;

        let salt = crypto::generate_salt();
        let master_key = crypto::derive_master_key(master_password, &salt);

        let metadata = VaultMetadata {
            version: VAULT_VERSION,
            algorithm: VAULT_ALGORITHM.to_owned(),
            created_at: Utc::now(),
            salt: hex::encode(salt),
        };
        write_file_0600(&meta_path, &serde_json::to_vec_pretty(&metadata)?).await?;

        Ok(Self {
            root: config.root,
            cache_ttl: config.cache_ttl,
            master_key,
            cache: RwLock::new(HashMap::new()),
            clock,
            audit: AuditManager::new(),
        })
    }

    /// Open an existing vault, re-deriving the master key from its persisted
    /// salt. Does not verify the password — the first `retrieve`/`store`
    /// call against mismatched ciphertext surfaces as [`VaultError::Decryption`].
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotInitialized`] if `vault.json` is missing.
    pub async fn open(config: VaultConfig, master_password: &[u8], clock: Arc<dyn Clock>) -> Result<Self, VaultError> {
        let meta_path = config.root.join("vault.json");
        let bytes = tokio::fs::read(&meta_path)
            .await
            .map_err(|_| VaultError::NotInitialized(config.root.display().to_string()))?;
        let metadata: VaultMetadata = serde_json::from_slice(&bytes)?;
        let salt = hex::decode(&metadata.salt).map_err(|e| VaultError::Decryption(e.to_string()))?;
        let master_key = crypto::derive_master_key(master_password, &salt);

        Ok(Self {
            root: config.root,
            cache_ttl: config.cache_ttl,
            master_key,
            cache: RwLock::new(HashMap::new()),
            clock,
            audit: AuditManager::new(),
        })
    }

    pub fn add_audit_sink(&mut self, sink: Arc<dyn crate::audit::AuditSink>) {
        self.audit.add_sink(sink);
    }

    fn credential_path(&self, id: &str) -> PathBuf {
        self.root.join("credentials").join(format!("{id}.cred"))
    }

    /// Encrypt and persist `credential`, returning the stored value (with the
    /// same plaintext `value` the caller passed in).
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Encryption`] if either encryption layer fails,
    /// or [`VaultError::Io`] if the atomic write fails.
    pub async fn store(&self, credential: Credential) -> Result<Credential, VaultError> {
        let record = self.encode_record(&credential)?;
        self.write_record(&record).await?;

        let mut cache = self.cache.write().await;
        cache.insert(credential.id.clone(), CacheEntry { credential: credential.clone(), cached_at: self.clock.now() });
        drop(cache);

        self.audit.record(AuditEntry::new("vault", "store", &credential.id, AuditOutcome::Allowed)).await;
        Ok(credential)
    }

    /// Retrieve a credential by id.
    ///
    /// A cache hit within `cache_ttl` avoids re-decrypting from disk. A
    /// credential past its own `expires_at` is reported as
    /// [`VaultError::Expired`] and deleted (moved to backup) as a side effect
    /// — distinct from a cache-TTL miss, which is a silent disk re-read.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`], [`VaultError::Expired`], or a decryption
    /// failure.
    pub async fn retrieve(&self, id: &str) -> Result<Credential, VaultError> {
        if let Some(cached) = self.cache_get(id).await {
            if cached.is_expired(self.clock_now_utc()) {
                self.delete(id).await?;
                self.audit.record(AuditEntry::new("vault", "retrieve", id, AuditOutcome::Denied).with_detail("expired")).await;
                return Err(VaultError::Expired(id.to_owned()));
            }
            return Ok(cached);
        }

        let record = self.read_record(id).await?;
        let credential = self.decode_record(&record)?;

        if credential.is_expired(self.clock_now_utc()) {
            self.delete(id).await?;
            self.audit.record(AuditEntry::new("vault", "retrieve", id, AuditOutcome::Denied).with_detail("expired")).await;
            return Err(VaultError::Expired(id.to_owned()));
        }

        let mut cache = self.cache.write().await;
        cache.insert(id.to_owned(), CacheEntry { credential: credential.clone(), cached_at: self.clock.now() });
        drop(cache);

        self.audit.record(AuditEntry::new("vault", "retrieve", id, AuditOutcome::Allowed)).await;
        Ok(credential)
    }

    async fn cache_get(&self, id: &str) -> Option<Credential> {
        let cache = self.cache.read().await;
        let entry = cache.get(id)?;
        if self.clock.now().saturating_sub(entry.cached_at) > self.cache_ttl {
            return None;
        }
        Some(entry.credential.clone())
    }

    fn clock_now_utc(&self) -> chrono::DateTime<Utc> {
        Utc::now()
    }

    /// Delete a credential, moving a copy to `<root>/backup/<id>_<ts>.cred`
    /// before removing the original (spec §4.D / §6).
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] on filesystem failure. Deleting a missing
    /// credential is not an error.
    pub async fn delete(&self, id: &str) -> Result<(), VaultError> {
        let path = self.credential_path(id);
        if tokio::fs::try_exists(&path).await? {
            let backup_path = self.root.join("backup").join(format!("{id}_{}.cred", Utc::now().timestamp()));
            tokio::fs::copy(&path, &backup_path).await?;
            set_mode_0600(&backup_path).await?;
            tokio::fs::remove_file(&path).await?;
        }

        self.cache.write().await.remove(id);
        self.audit.record(AuditEntry::new("vault", "delete", id, AuditOutcome::Allowed)).await;
        Ok(())
    }

    /// List stored credentials, omitting values (spec §4.D).
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the credentials directory can't be read.
    pub async fn list(&self) -> Result<Vec<CredentialSummary>, VaultError> {
        let dir = self.root.join("credentials");
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cred") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let plaintext = crypto::decrypt(&self.master_key, &bytes).map_err(|e| VaultError::Decryption(e.to_string()))?;
            let record: CredentialRecord = serde_json::from_slice(&plaintext)?;
            summaries.push(CredentialSummary::from(&record));
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Regenerate a credential's value in place, following the by-type rules
    /// of spec §4.D.
    ///
    /// # Errors
    ///
    /// [`VaultError::RotationUnsupported`] for types spec §4.D doesn't define
    /// generation rules for (certificate, private-key).
    pub async fn rotate(&self, id: &str) -> Result<Credential, VaultError> {
        let mut credential = self.retrieve(id).await?;
        credential.value = generate_rotated_value(credential.credential_type)?;
        credential.updated_at = Utc::now();
        let stored = self.store(credential).await?;
        self.audit.record(AuditEntry::new("vault", "rotate", id, AuditOutcome::Allowed)).await;
        Ok(stored)
    }

    /// Export every stored credential as a single password-protected bundle,
    /// encrypted with a key derived from `password` under a fixed export
    /// salt (spec §4.D: "a different derived key... fixed export-salt").
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] or [`VaultError::Encryption`] on failure.
    pub async fn export(&self, password: &[u8]) -> Result<Vec<u8>, VaultError> {
        let dir = self.root.join("credentials");
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cred") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let plaintext = crypto::decrypt(&self.master_key, &bytes).map_err(|e| VaultError::Decryption(e.to_string()))?;
            let record: CredentialRecord = serde_json::from_slice(&plaintext)?;
            records.push(record);
        }

        let export_key = crypto::derive_export_key(password);
        let bundle = serde_json::to_vec(&records)?;
        let ciphertext = crypto::encrypt(&export_key, &bundle).map_err(|e| VaultError::Encryption(e.to_string()))?;
        self.audit.record(AuditEntry::new("vault", "export", "*", AuditOutcome::Allowed).with_detail(format!("{} credentials", records.len()))).await;
        Ok(ciphertext)
    }

    /// Import a bundle produced by [`Self::export`] back into this same
    /// vault (spec §4.D's export/import is a backup/restore pair, not a
    /// cross-vault transfer: each credential's `encrypted_value` stays
    /// encrypted under the master key that produced it, so only the vault
    /// that exported a bundle can usefully decrypt what it restores).
    ///
    /// The per-record envelope is re-encrypted under this vault's master
    /// key and written straight to `<root>/credentials/<id>.cred` without
    /// touching `encrypted_value`, so the written file decodes correctly
    /// precisely when `self` is (or shares the master key of) the vault
    /// that exported the bundle.
    ///
    /// # Errors
    ///
    /// [`VaultError::Decryption`] if `password` doesn't match the export
    /// password, or a filesystem error while writing.
    pub async fn import(&self, ciphertext: &[u8], password: &[u8]) -> Result<usize, VaultError> {
        let export_key = crypto::derive_export_key(password);
        let bundle = crypto::decrypt(&export_key, ciphertext).map_err(|e| VaultError::Decryption(e.to_string()))?;
        let records: Vec<CredentialRecord> = serde_json::from_slice(&bundle)?;

        for record in &records {
            self.write_record(record).await?;
            self.cache.write().await.remove(&record.id);
        }

        self.audit.record(AuditEntry::new("vault", "import", "*", AuditOutcome::Allowed).with_detail(format!("{} credentials", records.len()))).await;
        Ok(records.len())
    }

    fn encode_record(&self, credential: &Credential) -> Result<CredentialRecord, VaultError> {
        let encrypted_value = crypto::encrypt(&self.master_key, credential.value.as_bytes()).map_err(|e| VaultError::Encryption(e.to_string()))?;
        Ok(CredentialRecord {
            id: credential.id.clone(),
            credential_type: credential.credential_type,
            name: credential.name.clone(),
            encrypted_value,
            metadata: credential.metadata.clone(),
            created_at: credential.created_at,
            updated_at: credential.updated_at,
            expires_at: credential.expires_at,
        })
    }

    fn decode_record(&self, record: &CredentialRecord) -> Result<Credential, VaultError> {
        let value_bytes = crypto::decrypt(&self.master_key, &record.encrypted_value).map_err(|e| VaultError::Decryption(e.to_string()))?;
        Ok(Credential {
            id: record.id.clone(),
            credential_type: record.credential_type,
            name: record.name.clone(),
            value: String::from_utf8_lossy(&value_bytes).into_owned(),
            metadata: record.metadata.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
        })
    }

    async fn write_record(&self, record: &CredentialRecord) -> Result<(), VaultError> {
        let plaintext = serde_json::to_vec(record)?;
        let ciphertext = crypto::encrypt(&self.master_key, &plaintext).map_err(|e| VaultError::Encryption(e.to_string()))?;
        write_file_0600(&self.credential_path(&record.id), &ciphertext).await
    }

    async fn read_record(&self, id: &str) -> Result<CredentialRecord, VaultError> {
        let path = self.credential_path(id);
        let bytes = tokio::fs::read(&path).await.map_err(|_| VaultError::NotFound(id.to_owned()))?;
        let plaintext = crypto::decrypt(&self.master_key, &bytes).map_err(|e| VaultError::Decryption(e.to_string()))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Regenerate a credential value by type, per spec §4.D's per-type rules.
fn generate_rotated_value(credential_type: CredentialType) -> Result<String, VaultError> {
    match credential_type {
        CredentialType::ApiKey | CredentialType::Token => Ok(random_url_safe(32)),
        CredentialType::Password => Ok(random_password(16)),
        CredentialType::Secret => Ok(random_url_safe(64)),
        CredentialType::Certificate | CredentialType::PrivateKey => {
            Err(VaultError::RotationUnsupported(credential_type.as_str().to_owned()))
        }
    }
}

const URL_SAFE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
const PASSWORD_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

fn random_url_safe(len: usize) -> String {
    random_from_charset(URL_SAFE_CHARS, len)
}

fn random_password(len: usize) -> String {
    random_from_charset(PASSWORD_CHARS, len)
}

fn random_from_charset(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| charset[rng.gen_range(0..charset.len())] as char).collect()
}

#[cfg(unix)]
async fn create_dir_0700(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::create_dir_all(path).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_dir_0700(path: &Path) -> Result<(), VaultError> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

/// Atomic write: write to a sibling temp file then rename (spec §4.D).
async fn write_file_0600(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, bytes).await?;
    set_mode_0600(&tmp_path).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_mode_0600(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode_0600(_path: &Path) -> Result<(), VaultError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_resilience::RealClock;

    async fn open_test_vault() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::new(dir.path().join("vault"));
        let vault = Vault::init(config, b"master-password", Arc::new(RealClock)).await.unwrap();
        (dir, vault)
    }

    #[tokio::test]
    async fn store_then_retrieve_roundtrips_value() {
        let (_dir, vault) = open_test_vault().await;
        let cred = Credential::new("c1", CredentialType::ApiKey, "prod-key", "sk-live-abc123");
        vault.store(cred).await.unwrap();

        let fetched = vault.retrieve("c1").await.unwrap();
        assert_eq!(fetched.value, "sk-live-abc123");
    }

    #[tokio::test]
    async fn retrieve_missing_is_not_found() {
        let (_dir, vault) = open_test_vault().await;
        let err = vault.retrieve("missing").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_moves_to_backup_and_removes_original() {
        let (_dir, vault) = open_test_vault().await;
        vault.store(Credential::new("c1", CredentialType::Secret, "n", "v")).await.unwrap();
        vault.delete("c1").await.unwrap();

        assert!(vault.retrieve("c1").await.is_err());
        let backups: Vec<_> = std::fs::read_dir(vault.root.join("backup")).unwrap().collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn list_omits_values() {
        let (_dir, vault) = open_test_vault().await;
        vault.store(Credential::new("c1", CredentialType::Token, "n1", "v1")).await.unwrap();
        vault.store(Credential::new("c2", CredentialType::Token, "n2", "v2")).await.unwrap();

        let summaries = vault.list().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, "c1");
    }

    #[tokio::test]
    async fn rotate_api_key_changes_value_and_persists() {
        let (_dir, vault) = open_test_vault().await;
        vault.store(Credential::new("c1", CredentialType::ApiKey, "n", "original")).await.unwrap();

        let rotated = vault.rotate("c1").await.unwrap();
        assert_ne!(rotated.value, "original");
        assert_eq!(rotated.value.len(), 32);

        let fetched = vault.retrieve("c1").await.unwrap();
        assert_eq!(fetched.value, rotated.value);
    }

    #[tokio::test]
    async fn rotate_certificate_is_unsupported() {
        let (_dir, vault) = open_test_vault().await;
        vault.store(Credential::new("c1", CredentialType::Certificate, "n", "pem-data")).await.unwrap();
        let err = vault.rotate("c1").await.unwrap_err();
        assert!(matches!(err, VaultError::RotationUnsupported(_)));
    }

    #[tokio::test]
    async fn expired_credential_is_surfaced_and_auto_deleted() {
        let (_dir, vault) = open_test_vault().await;
        let cred = Credential::new("c1", CredentialType::Token, "n", "v").with_expires_at(Utc::now() - chrono::Duration::seconds(1));
        vault.store(cred).await.unwrap();

        let err = vault.retrieve("c1").await.unwrap_err();
        assert!(matches!(err, VaultError::Expired(_)));
        assert!(vault.retrieve("c1").await.is_err());
    }

    #[tokio::test]
    async fn export_then_import_restores_deleted_credential() {
        let (_dir, vault) = open_test_vault().await;
        vault.store(Credential::new("c1", CredentialType::Secret, "n", "top-secret")).await.unwrap();
        let bundle = vault.export(b"export-pw").await.unwrap();

        vault.delete("c1").await.unwrap();
        assert!(vault.retrieve("c1").await.is_err());

        let imported = vault.import(&bundle, b"export-pw").await.unwrap();
        assert_eq!(imported, 1);

        let fetched = vault.retrieve("c1").await.unwrap();
        assert_eq!(fetched.value, "top-secret");
    }

    #[tokio::test]
    async fn import_with_wrong_password_fails() {
        let (_dir, vault) = open_test_vault().await;
        vault.store(Credential::new("c1", CredentialType::Secret, "n", "v")).await.unwrap();
        let bundle = vault.export(b"export-pw").await.unwrap();
        let err = vault.import(&bundle, b"wrong-pw").await.unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));
    }

    #[tokio::test]
    async fn open_existing_vault_reuses_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vault");
        {
            let vault = Vault::init(VaultConfig::new(&root), b"pw", Arc::new(RealClock)).await.unwrap();
            vault.store(Credential::new("c1", CredentialType::Token, "n", "persisted")).await.unwrap();
        }
        let reopened = Vault::open(VaultConfig::new(&root), b"pw", Arc::new(RealClock)).await.unwrap();
        let fetched = reopened.retrieve("c1").await.unwrap();
        assert_eq!(fetched.value, "persisted");
    }
}
