//! Durable storage contract for membership records.
//!
//! A store holds one record per `(application, id)`. Every mutation goes
//! through [`RegistryStore::put`] or [`RegistryStore::remove`], both atomic:
//! a failed or abandoned call leaves the previous state in place.

mod memory;
pub(crate) mod postgres;
mod redis_store;

pub use memory::MemoryRegistryStore;
pub use postgres::PgRegistryStore;
pub use redis_store::RedisRegistryStore;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::instance::{Instance, Version, Versioned};
use crate::Error;

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Backend label for logs and metrics.
    fn name(&self) -> &'static str;

    /// All live records of `application`, in no particular order.
    async fn list(&self, application: &str) -> Result<Vec<Instance>, Error>;

    /// Keyed read of `(application, id)`.
    async fn fetch(&self, application: &str, id: u32)
        -> Result<Option<Versioned<Instance>>, Error>;

    /// Point lookup. A record registered in another datacenter reads as absent.
    async fn get(
        &self,
        application: &str,
        datacenter: &str,
        id: u32,
    ) -> Result<Option<Versioned<Instance>>, Error> {
        Ok(self
            .fetch(application, id)
            .await?
            .filter(|record| record.value.datacenter == datacenter))
    }

    /// Atomic create-or-replace of `instance`'s key.
    ///
    /// `expected` is the version the caller read, or `None` if the key must
    /// not exist yet. Fails with [`Conflict::Version`](crate::Conflict::Version)
    /// when the stored version differs and with
    /// [`Conflict::Token`](crate::Conflict::Token) when another live record in
    /// the same datacenter holds the token.
    async fn put(&self, instance: &Instance, expected: Option<Version>) -> Result<Version, Error>;

    /// Deletes `(application, id)` and releases its token.
    ///
    /// With `expected: None` the removal is unconditional and removing an
    /// absent key succeeds. With `Some(version)` the record is deleted only
    /// if it is still at that version; otherwise, including when the key is
    /// gone, it fails with [`Conflict::Version`](crate::Conflict::Version)
    /// and nothing changes.
    async fn remove(
        &self,
        application: &str,
        id: u32,
        expected: Option<Version>,
    ) -> Result<(), Error>;
}

/// Runs one store round trip under `timeout`; an expired deadline surfaces
/// as `Unavailable`.
pub(crate) async fn bounded<T, F>(timeout: Duration, op: &'static str, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(op, timeout_ms = timeout.as_millis() as u64, "Operation timed out");
            Err(Error::unavailable(format!(
                "{op} timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let value = bounded(Duration::from_millis(50), "list", async { Ok::<_, Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_bounded_times_out_as_unavailable() {
        let result = bounded(Duration::from_millis(10), "put", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Error>(())
        })
        .await;
        assert!(matches!(result, Err(Error::Unavailable(msg)) if msg.contains("put")));
    }
}
