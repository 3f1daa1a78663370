//! Encrypted local credential vault (spec §4.D).
//!
//! Secrets at rest are always AES-256-GCM ciphertext; the master key lives
//! only in process memory, derived from an operator-supplied password via
//! PBKDF2-HMAC-SHA256. A TTL-bounded plaintext cache avoids re-deriving on
//! every read of a hot credential.

pub mod audit;
pub mod crypto;
pub mod error;
pub mod model;
pub mod vault;

pub use crypto::EncryptionKey;
pub use error::VaultError;
pub use model::{Credential, CredentialRecord, CredentialSummary, CredentialType, VaultMetadata};
pub use vault::{Vault, VaultConfig};
