//! Id and token allocation for ring-organized cluster membership.
//!
//! This crate provides:
//! - A store contract with atomic compare-and-swap writes, backed by memory,
//!   PostgreSQL or Redis
//! - An allocation engine that hands out unique ids and ring tokens to nodes
//!   bootstrapping concurrently, with rack-interleaved token placement
//! - A membership index for ordered listing and point lookups, optionally
//!   cached with generation-checked invalidation
//! - A registry facade tying both together with per-call timeouts and
//!   membership events
//!
//! # Example
//!
//! ```rust,ignore
//! use ringkeeper_core::{CreateRequest, Registry, RegistryConfig, PgRegistryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     // Ensure schema exists (safe to call multiple times)
//!     ringkeeper_core::setup(&pool).await?;
//!
//!     let config = RegistryConfig::from_env()?;
//!     let registry = Registry::start(Arc::new(PgRegistryStore::new(pool)), &config);
//!
//!     let instance = registry
//!         .create(CreateRequest {
//!             application: "cass".into(),
//!             datacenter: "us-east".into(),
//!             id: 1,
//!             instance_identifier: "i-0abc".into(),
//!             hostname: "node1.internal".into(),
//!             address: "10.0.0.1".into(),
//!             rack: "1a".into(),
//!             token: None,
//!         })
//!         .await?;
//!     println!("{instance}");
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Consistency
//!
//! The store's `put` is the only synchronization point. Two nodes racing for
//! the same id or the same token cannot both win, whichever process they
//! reached; no lock is held across more than one store round trip.

pub mod allocator;
pub mod config;
mod error;
pub mod index;
pub mod instance;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod token;

pub use allocator::{AllocationEngine, Registration, RegistrationKind};
pub use config::{ConfigError, RegistryConfig, StoreBackend};
pub use error::{Conflict, Error};
pub use index::MembershipIndex;
pub use instance::{CreateRequest, Instance, ParseInstanceError, Version, Versioned};
pub use metrics::METRICS;
pub use registry::{MembershipEvent, Registry};
pub use store::{MemoryRegistryStore, PgRegistryStore, RedisRegistryStore, RegistryStore};
pub use token::{ParseTokenError, Partitioner, Token, TokenPlacement};

use sqlx::PgPool;

/// SQL schema required by the PostgreSQL store (version sequence).
pub const SCHEMA_SEQUENCE_SQL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS ringkeeper_instance_versions"#;

/// SQL schema required by the PostgreSQL store (table creation).
pub const SCHEMA_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ringkeeper_instances (
    application TEXT NOT NULL,
    id BIGINT NOT NULL CHECK (id BETWEEN 0 AND 4294967295),
    datacenter TEXT NOT NULL,
    rack TEXT NOT NULL,
    instance_identifier TEXT NOT NULL,
    hostname TEXT NOT NULL,
    address TEXT NOT NULL,
    token TEXT NOT NULL,
    version BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (application, id)
)"#;

/// SQL schema required by the PostgreSQL store (token uniqueness).
pub const SCHEMA_INDEX_SQL: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_ringkeeper_instances_token
ON ringkeeper_instances(application, datacenter, token)"#;

/// Create the sequence, table and index the PostgreSQL store needs.
///
/// Safe to call multiple times (uses IF NOT EXISTS).
pub async fn setup(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(SCHEMA_SEQUENCE_SQL).execute(pool).await?;
    sqlx::query(SCHEMA_TABLE_SQL).execute(pool).await?;
    sqlx::query(SCHEMA_INDEX_SQL).execute(pool).await?;
    tracing::debug!("Registry schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_matches_store_names() {
        assert!(SCHEMA_SEQUENCE_SQL.contains(store::postgres::VERSION_SEQUENCE));
        assert!(SCHEMA_TABLE_SQL.contains(store::postgres::TABLE));
        assert!(SCHEMA_INDEX_SQL.contains(store::postgres::TOKEN_INDEX));
    }
}
