//! API key and tenant models plus the persistence-store repository.

pub mod api_key;
pub mod repository;

pub use api_key::{ApiKey, BlockReason, BlockedKeyRecord, KeyStatus, Tenant};
pub use repository::{ConfigRepository, RepositoryError, SqliteRepository};
