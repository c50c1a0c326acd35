use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::allocator::{AllocationEngine, Registration, RegistrationKind};
use crate::config::RegistryConfig;
use crate::index::MembershipIndex;
use crate::instance::{CreateRequest, Instance};
use crate::metrics::METRICS;
use crate::store::{bounded, RegistryStore};
use crate::Error;

/// Membership change event.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(Instance),
    Replaced { previous: Instance, current: Instance },
    Left(Instance),
}

/// Entry point for callers: allocation on the write side, the membership
/// index on the read side.
///
/// Every call runs under the configured call timeout. A successful mutation
/// invalidates the index before the call returns, then publishes a
/// [`MembershipEvent`].
pub struct Registry {
    engine: AllocationEngine,
    index: Arc<MembershipIndex>,
    store_name: &'static str,
    call_timeout: Duration,
    cancel_token: CancellationToken,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl Registry {
    /// Wire up the engine and index over `store`.
    ///
    /// Starts the background index refresher when caching and a refresh
    /// interval are both configured, so it must be called from within a
    /// Tokio runtime.
    pub fn start(store: Arc<dyn RegistryStore>, config: &RegistryConfig) -> Self {
        let store_name = store.name();
        let engine = AllocationEngine::new(Arc::clone(&store), config);
        let index = Arc::new(MembershipIndex::new(store, config));
        let cancel_token = CancellationToken::new();

        let task_handle = match config.refresh_interval {
            Some(interval) if index.is_cached() => {
                Some(index.spawn_refresh(interval, cancel_token.clone()))
            }
            _ => None,
        };

        // 64 is plenty for bursts of joins during a rolling bootstrap
        let (event_tx, _) = broadcast::channel(64);

        tracing::info!(
            store = store_name,
            application = %config.application,
            datacenter = %config.datacenter,
            partitioner = %config.partitioner,
            index_cache = index.is_cached(),
            "Registry started"
        );

        Self {
            engine,
            index,
            store_name,
            call_timeout: config.call_timeout,
            cancel_token,
            task_handle: Mutex::new(task_handle),
            event_tx,
        }
    }

    pub fn store_name(&self) -> &'static str {
        self.store_name
    }

    pub fn index(&self) -> &MembershipIndex {
        &self.index
    }

    /// Register a node and return its durable record.
    pub async fn create(&self, request: CreateRequest) -> Result<Instance, Error> {
        Ok(self.register(request).await?.instance)
    }

    pub async fn register(&self, request: CreateRequest) -> Result<Registration, Error> {
        let application = request.application.clone();
        let result = bounded(self.call_timeout, "register", self.engine.register(request)).await;

        match &result {
            Ok(registration) => self.registered(&application, registration),
            Err(e) => self.failed_mutation(&application, e),
        }
        result
    }

    /// Remove `(application, id)`; fails with `NotFound` if it is absent.
    pub async fn delete(&self, application: &str, id: u32) -> Result<Instance, Error> {
        let result = bounded(
            self.call_timeout,
            "delete",
            self.engine.delete(application, id),
        )
        .await;

        match &result {
            Ok(removed) => {
                self.index.invalidate(application);
                METRICS.inc_deleted();
                let _ = self.event_tx.send(MembershipEvent::Left(removed.clone()));
            }
            Err(e) => self.failed_mutation(application, e),
        }
        result
    }

    pub async fn list_ordered(&self, application: &str) -> Result<Vec<Instance>, Error> {
        bounded(self.call_timeout, "list", self.index.list_ordered(application))
            .await
            .inspect_err(|e| METRICS.record_error(e))
    }

    pub async fn lookup(
        &self,
        application: &str,
        datacenter: &str,
        id: u32,
    ) -> Result<Instance, Error> {
        bounded(
            self.call_timeout,
            "lookup",
            self.index.lookup(application, datacenter, id),
        )
        .await
        .inspect_err(|e| METRICS.record_error(e))
    }

    /// Subscribe to membership change events.
    ///
    /// Events are sent after the index has been invalidated, so a subscriber
    /// reading the index on receipt sees the change.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the background refresher and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::debug!(store = self.store_name, "Registry shut down");
    }

    fn registered(&self, application: &str, registration: &Registration) {
        let event = match &registration.kind {
            RegistrationKind::Unchanged => {
                METRICS.inc_unchanged();
                return;
            }
            RegistrationKind::Created => {
                METRICS.inc_created();
                MembershipEvent::Joined(registration.instance.clone())
            }
            RegistrationKind::Replaced { previous } => {
                METRICS.inc_replaced();
                MembershipEvent::Replaced {
                    previous: previous.clone(),
                    current: registration.instance.clone(),
                }
            }
        };
        self.index.invalidate(application);
        let _ = self.event_tx.send(event);
    }

    fn failed_mutation(&self, application: &str, err: &Error) {
        METRICS.record_error(err);
        // a timed-out call may still have committed
        if err.is_transient() {
            self.index.invalidate(application);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRegistryStore;
    use tokio::sync::broadcast::error::TryRecvError;

    fn config() -> RegistryConfig {
        RegistryConfig {
            application: "cass".into(),
            datacenter: "us-east".into(),
            backoff: Duration::from_millis(1),
            refresh_interval: None,
            ..RegistryConfig::default()
        }
    }

    fn request(id: u32, identifier: &str) -> CreateRequest {
        CreateRequest {
            application: "cass".into(),
            datacenter: "us-east".into(),
            id,
            instance_identifier: identifier.into(),
            hostname: format!("{identifier}.internal"),
            address: format!("10.0.0.{id}"),
            rack: "1a".into(),
            token: None,
        }
    }

    #[test]
    fn test_membership_event_variants() {
        let instance = request(1, "i-1").to_instance(crate::Token::new(5));
        let joined = MembershipEvent::Joined(instance.clone());
        assert_eq!(joined, MembershipEvent::Joined(instance.clone()));
        assert_ne!(joined, MembershipEvent::Left(instance));
    }

    #[tokio::test]
    async fn test_create_is_visible_to_reads_and_announced() {
        let registry = Registry::start(Arc::new(MemoryRegistryStore::new()), &config());
        let mut events = registry.subscribe();
        assert!(registry.list_ordered("cass").await.unwrap().is_empty());

        let created = registry.create(request(1, "i-1")).await.unwrap();

        let listed = registry.list_ordered("cass").await.unwrap();
        assert_eq!(listed, vec![created.clone()]);
        assert_eq!(
            registry.lookup("cass", "us-east", 1).await.unwrap().token,
            created.token
        );
        assert_eq!(events.try_recv().unwrap(), MembershipEvent::Joined(created));
    }

    #[tokio::test]
    async fn test_replacement_and_delete_events() {
        let registry = Registry::start(Arc::new(MemoryRegistryStore::new()), &config());
        let original = registry.create(request(1, "i-old")).await.unwrap();
        let mut events = registry.subscribe();

        registry.create(request(1, "i-old")).await.unwrap();
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        let current = registry.create(request(1, "i-new")).await.unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            MembershipEvent::Replaced {
                previous: original,
                current: current.clone()
            }
        );
        assert_eq!(
            registry.lookup("cass", "us-east", 1).await.unwrap().instance_identifier,
            "i-new"
        );

        let removed = registry.delete("cass", 1).await.unwrap();
        assert_eq!(removed, current);
        assert_eq!(events.try_recv().unwrap(), MembershipEvent::Left(current));
        assert!(matches!(
            registry.lookup("cass", "us-east", 1).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_of_absent_id_is_not_found() {
        let registry = Registry::start(Arc::new(MemoryRegistryStore::new()), &config());
        let err = registry.delete("cass", 99).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { id: 99, .. }));
    }

    #[tokio::test]
    async fn test_call_timeout_surfaces_unavailable() {
        let store = Arc::new(MemoryRegistryStore::new());
        let registry = Registry::start(
            store.clone(),
            &RegistryConfig {
                store_timeout: Duration::from_secs(5),
                call_timeout: Duration::from_millis(30),
                ..config()
            },
        );
        store.set_latency(Some(Duration::from_millis(300)));

        let err = registry.create(request(1, "i-1")).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(msg) if msg.contains("register")));

        let err = registry.list_ordered("cass").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_shutdown_stops_refresher() {
        let registry = Registry::start(
            Arc::new(MemoryRegistryStore::new()),
            &RegistryConfig {
                refresh_interval: Some(Duration::from_millis(10)),
                ..config()
            },
        );
        assert!(registry.task_handle.lock().is_some());

        tokio::time::timeout(Duration::from_secs(1), registry.shutdown())
            .await
            .expect("shutdown should not hang");
        assert!(registry.task_handle.lock().is_none());
    }
}
