//! Key-value and relational storage abstractions.
//!
//! [`KVStore`] is a pure key-value interface the credential vault's barrier
//! layer wraps; [`RelationalStore`] backs the JWT revocation blacklist.
//! Neither trait knows anything about the data above it — encryption,
//! schema, and business rules live in `fleetd-vault` and `fleetd-auth`.

mod error;
mod kv;
mod relational;

pub use error::StorageError;
pub use kv::{KVStore, MemoryBackend};
pub use relational::{MemoryRelationalStore, RelationalStore};
#[cfg(feature = "postgres-backend")]
pub use relational::PostgresRelationalStore;
