use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::RegistryStore;
use crate::instance::{Instance, Version, Versioned};
use crate::{Conflict, Error};

#[derive(Default)]
struct State {
    records: HashMap<(String, u32), Versioned<Instance>>,
    last_version: u64,
}

/// In-process store. Every operation takes one mutex, which makes `put` and
/// `remove` trivially atomic.
///
/// Availability and latency can be toggled to exercise timeout and outage
/// handling.
pub struct MemoryRegistryStore {
    state: Mutex<State>,
    available: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryRegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            latency: Mutex::new(None),
        }
    }

    /// Simulate an outage: while unavailable every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Delay every call by `latency` before it touches state.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of live records across all applications.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> Result<(), Error> {
        let latency = *self.latency.lock();
        match latency {
            Some(delay) => tokio::time::sleep(delay).await,
            // let racing callers interleave between round trips
            None => tokio::task::yield_now().await,
        }
        if !self.available.load(Ordering::Acquire) {
            return Err(Error::unavailable("memory store is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, application: &str) -> Result<Vec<Instance>, Error> {
        self.enter().await?;
        let state = self.state.lock();
        Ok(state
            .records
            .values()
            .filter(|record| record.value.application == application)
            .map(|record| record.value.clone())
            .collect())
    }

    async fn fetch(
        &self,
        application: &str,
        id: u32,
    ) -> Result<Option<Versioned<Instance>>, Error> {
        self.enter().await?;
        let state = self.state.lock();
        Ok(state.records.get(&(application.to_string(), id)).cloned())
    }

    async fn put(&self, instance: &Instance, expected: Option<Version>) -> Result<Version, Error> {
        self.enter().await?;
        let mut state = self.state.lock();

        let key = (instance.application.clone(), instance.id);
        let current = state.records.get(&key).map(|record| record.version);
        if current != expected {
            return Err(Conflict::Version { id: instance.id }.into());
        }

        let holder = state.records.values().find(|record| {
            record.value.application == instance.application
                && record.value.datacenter == instance.datacenter
                && record.value.token == instance.token
                && record.value.id != instance.id
        });
        if let Some(holder) = holder {
            return Err(Conflict::Token {
                token: instance.token,
                holder: Some(holder.value.id),
            }
            .into());
        }

        state.last_version += 1;
        let version = Version(state.last_version);
        state
            .records
            .insert(key, Versioned::new(instance.clone(), version));
        Ok(version)
    }

    async fn remove(
        &self,
        application: &str,
        id: u32,
        expected: Option<Version>,
    ) -> Result<(), Error> {
        self.enter().await?;
        let mut state = self.state.lock();

        let key = (application.to_string(), id);
        if let Some(expected) = expected {
            let current = state.records.get(&key).map(|record| record.version);
            if current != Some(expected) {
                return Err(Conflict::Version { id }.into());
            }
        }
        state.records.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;
    use chrono::Utc;

    fn instance(id: u32, token: i128) -> Instance {
        Instance {
            application: "cass".into(),
            datacenter: "us-east".into(),
            rack: "1a".into(),
            id,
            instance_identifier: format!("i-{id}"),
            hostname: format!("h{id}"),
            address: format!("10.0.0.{id}"),
            token: Token::new(token),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_absent_then_fetch() {
        let store = MemoryRegistryStore::new();
        let version = store.put(&instance(1, 100), None).await.unwrap();

        let record = store.fetch("cass", 1).await.unwrap().unwrap();
        assert_eq!(record.version, version);
        assert_eq!(record.value.token, Token::new(100));
    }

    #[tokio::test]
    async fn test_put_rejects_stale_version() {
        let store = MemoryRegistryStore::new();
        let first = store.put(&instance(1, 100), None).await.unwrap();
        store.put(&instance(1, 100), Some(first)).await.unwrap();

        let err = store.put(&instance(1, 100), Some(first)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(Conflict::Version { id: 1 })));

        let err = store.put(&instance(1, 100), None).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(Conflict::Version { id: 1 })));
    }

    #[tokio::test]
    async fn test_put_rejects_token_held_in_same_datacenter() {
        let store = MemoryRegistryStore::new();
        store.put(&instance(1, 100), None).await.unwrap();

        let err = store.put(&instance(2, 100), None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict(Conflict::Token { holder: Some(1), .. })
        ));
        assert!(store.fetch("cass", 2).await.unwrap().is_none());

        let mut other_dc = instance(2, 100);
        other_dc.datacenter = "us-west".into();
        store.put(&other_dc, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_releases_token() {
        let store = MemoryRegistryStore::new();
        store.put(&instance(1, 100), None).await.unwrap();

        store.remove("cass", 1, None).await.unwrap();
        store.remove("cass", 1, None).await.unwrap();
        assert!(store.is_empty());

        store.put(&instance(2, 100), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_conditional_remove_keeps_newer_record() {
        let store = MemoryRegistryStore::new();
        let first = store.put(&instance(1, 100), None).await.unwrap();
        let second = store.put(&instance(1, 100), Some(first)).await.unwrap();

        let err = store.remove("cass", 1, Some(first)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(Conflict::Version { id: 1 })));
        assert_eq!(store.fetch("cass", 1).await.unwrap().unwrap().version, second);

        store.remove("cass", 1, Some(second)).await.unwrap();
        assert!(store.is_empty());

        let err = store.remove("cass", 1, Some(second)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(Conflict::Version { id: 1 })));
    }

    #[tokio::test]
    async fn test_versions_are_not_reused_after_delete() {
        let store = MemoryRegistryStore::new();
        let first = store.put(&instance(1, 100), None).await.unwrap();
        store.remove("cass", 1, Some(first)).await.unwrap();
        let second = store.put(&instance(1, 100), None).await.unwrap();
        assert!(second > first);

        let err = store.put(&instance(1, 100), Some(first)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(Conflict::Version { .. })));
    }

    #[tokio::test]
    async fn test_get_filters_by_datacenter() {
        let store = MemoryRegistryStore::new();
        store.put(&instance(1, 100), None).await.unwrap();

        assert!(store.get("cass", "us-east", 1).await.unwrap().is_some());
        assert!(store.get("cass", "us-west", 1).await.unwrap().is_none());
        assert!(store.get("other", "us-east", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_application() {
        let store = MemoryRegistryStore::new();
        store.put(&instance(1, 100), None).await.unwrap();
        store.put(&instance(2, 200), None).await.unwrap();
        let mut foreign = instance(3, 300);
        foreign.application = "other".into();
        store.put(&foreign, None).await.unwrap();

        assert_eq!(store.list("cass").await.unwrap().len(), 2);
        assert_eq!(store.list("other").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable_and_unchanged() {
        let store = MemoryRegistryStore::new();
        store.set_available(false);

        let err = store.put(&instance(1, 100), None).await.unwrap_err();
        assert!(err.is_transient());

        store.set_available(true);
        assert!(store.is_empty());
    }
}
