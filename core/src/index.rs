use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::instance::{Instance, Versioned};
use crate::metrics::METRICS;
use crate::store::{bounded, RegistryStore};
use crate::Error;

#[derive(Clone, Default)]
struct CacheEntry {
    /// Bumped by every invalidation. A load only installs its snapshot if the
    /// generation it started under is still current.
    generation: u64,
    snapshot: Option<Arc<Vec<Instance>>>,
}

type Snapshots = HashMap<String, CacheEntry>;

/// Read side of the registry: ordered enumeration and point lookups.
///
/// Holds nothing authoritative. With caching enabled it keeps one snapshot
/// per application, sorted by id, swapped in atomically so readers never
/// block. Writers call [`invalidate`](Self::invalidate) after a successful
/// mutation; any load that was already in flight when that happened is
/// discarded instead of installed, so a caller always reads its own writes.
pub struct MembershipIndex {
    store: Arc<dyn RegistryStore>,
    cache: Option<ArcSwap<Snapshots>>,
    store_timeout: Duration,
}

impl MembershipIndex {
    pub fn new(store: Arc<dyn RegistryStore>, config: &RegistryConfig) -> Self {
        Self {
            store,
            cache: config
                .index_cache
                .then(|| ArcSwap::from_pointee(Snapshots::new())),
            store_timeout: config.store_timeout,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// Every record of `application`, ordered by id ascending.
    pub async fn list_ordered(&self, application: &str) -> Result<Vec<Instance>, Error> {
        Ok(self.snapshot(application).await?.as_ref().clone())
    }

    /// The record registered under `id` in `datacenter`.
    pub async fn lookup(
        &self,
        application: &str,
        datacenter: &str,
        id: u32,
    ) -> Result<Instance, Error> {
        if self.cache.is_none() {
            return bounded(
                self.store_timeout,
                "get",
                self.store.get(application, datacenter, id),
            )
            .await?
            .map(Versioned::into_inner)
            .ok_or_else(|| Error::not_found(application, id));
        }

        let snapshot = self.snapshot(application).await?;
        snapshot
            .binary_search_by_key(&id, |i| i.id)
            .ok()
            .map(|pos| &snapshot[pos])
            .filter(|i| i.datacenter == datacenter)
            .cloned()
            .ok_or_else(|| Error::not_found(application, id))
    }

    /// Drop the cached snapshot of `application` and fence off loads that
    /// started before this call.
    pub fn invalidate(&self, application: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        cache.rcu(|current| {
            let mut next = Snapshots::clone(current);
            let generation = current.get(application).map_or(0, |e| e.generation) + 1;
            next.insert(
                application.to_string(),
                CacheEntry {
                    generation,
                    snapshot: None,
                },
            );
            next
        });
    }

    /// Reload `application` from the store, replacing any cached snapshot.
    /// Returns the number of records loaded.
    pub async fn rebuild(&self, application: &str) -> Result<usize, Error> {
        let generation = self.generation(application);
        let snapshot = Arc::new(self.load(application).await?);
        let count = snapshot.len();
        self.install(application, generation, snapshot);
        Ok(count)
    }

    /// Applications the cache knows about.
    pub fn cached_applications(&self) -> Vec<String> {
        match &self.cache {
            Some(cache) => {
                let mut apps: Vec<String> = cache.load().keys().cloned().collect();
                apps.sort();
                apps
            }
            None => Vec::new(),
        }
    }

    /// Periodically rebuild every cached application so writes made by
    /// other registry processes become visible.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            let mut refresh_timer = tokio::time::interval(interval);
            refresh_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Index refresher shutting down");
                        break;
                    }

                    _ = refresh_timer.tick() => {
                        match index.refresh_all().await {
                            Ok(applications) => {
                                consecutive_failures = 0;
                                tracing::trace!(applications, "Index refreshed");
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
                                tracing::error!(
                                    failures = consecutive_failures,
                                    backoff_ms,
                                    "Index refresh failed: {}, backing off",
                                    e
                                );
                                tokio::select! {
                                    _ = cancel_token.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    async fn refresh_all(&self) -> Result<usize, Error> {
        let applications = self.cached_applications();
        for application in &applications {
            self.rebuild(application).await?;
            METRICS.inc_index_rebuild();
        }
        Ok(applications.len())
    }

    async fn snapshot(&self, application: &str) -> Result<Arc<Vec<Instance>>, Error> {
        let Some(cache) = &self.cache else {
            return Ok(Arc::new(self.load(application).await?));
        };

        let generation = match cache.load().get(application) {
            Some(CacheEntry {
                snapshot: Some(snapshot),
                ..
            }) => {
                METRICS.inc_index_hit();
                return Ok(Arc::clone(snapshot));
            }
            Some(entry) => entry.generation,
            None => 0,
        };

        METRICS.inc_index_miss();
        let snapshot = Arc::new(self.load(application).await?);
        self.install(application, generation, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn generation(&self, application: &str) -> u64 {
        self.cache
            .as_ref()
            .and_then(|cache| cache.load().get(application).map(|e| e.generation))
            .unwrap_or(0)
    }

    fn install(&self, application: &str, generation: u64, snapshot: Arc<Vec<Instance>>) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        let mut installed = false;
        cache.rcu(|current| {
            let mut next = Snapshots::clone(current);
            installed = current.get(application).map_or(0, |e| e.generation) == generation;
            if installed {
                next.insert(
                    application.to_string(),
                    CacheEntry {
                        generation,
                        snapshot: Some(Arc::clone(&snapshot)),
                    },
                );
            }
            next
        });
        if !installed {
            tracing::debug!(application, "Discarded snapshot loaded before invalidation");
        }
        installed
    }

    async fn load(&self, application: &str) -> Result<Vec<Instance>, Error> {
        let mut instances =
            bounded(self.store_timeout, "list", self.store.list(application)).await?;
        instances.sort_by_key(|i| i.id);
        Ok(instances)
    }
}
