use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RegistryConfig;
use crate::instance::{CreateRequest, Instance, Version, Versioned};
use crate::metrics::METRICS;
use crate::store::{bounded, RegistryStore};
use crate::token::{rack_order, Token, TokenPlacement};
use crate::{Conflict, Error};

/// How a `register` call changed the membership.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationKind {
    /// A new record was written with a freshly claimed token.
    Created,
    /// A different host took over the id, keeping its token.
    Replaced { previous: Instance },
    /// The host was already registered under the id; nothing was written.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub instance: Instance,
    pub kind: RegistrationKind,
}

impl Registration {
    fn new(instance: Instance, kind: RegistrationKind) -> Self {
        Self { instance, kind }
    }
}

/// Assigns ids and tokens to joining nodes.
///
/// The engine holds no locks of its own. Every decision is committed through
/// the store's compare-and-swap `put`, which also enforces token uniqueness,
/// so any number of engines (in this process or others) can race on the same
/// application safely.
pub struct AllocationEngine {
    store: Arc<dyn RegistryStore>,
    placement: TokenPlacement,
    racks: Vec<String>,
    max_attempts: u32,
    backoff: Duration,
    store_timeout: Duration,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn RegistryStore>, config: &RegistryConfig) -> Self {
        Self {
            store,
            placement: TokenPlacement::new(config.partitioner, config.nodes_per_rack),
            racks: config.racks.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
            store_timeout: config.store_timeout,
        }
    }

    pub fn placement(&self) -> &TokenPlacement {
        &self.placement
    }

    /// Register a node and return its durable record.
    pub async fn create(&self, request: CreateRequest) -> Result<Instance, Error> {
        Ok(self.register(request).await?.instance)
    }

    /// Like [`create`](Self::create), also reporting whether the record was
    /// created, taken over from another host, or already in place.
    pub async fn register(&self, request: CreateRequest) -> Result<Registration, Error> {
        self.validate(&request)?;

        match self.fetch(&request.application, request.id).await? {
            Some(current) if current.value.instance_identifier == request.instance_identifier => {
                tracing::debug!(
                    application = %request.application,
                    id = request.id,
                    "Instance already registered"
                );
                Ok(Registration::new(current.into_inner(), RegistrationKind::Unchanged))
            }
            Some(current) if request.token.is_some() => Err(Conflict::DuplicateId {
                id: request.id,
                instance_identifier: current.value.instance_identifier,
            }
            .into()),
            Some(current) => self.replace(current, &request).await,
            None => match request.token {
                Some(token) => self.claim(&request, token).await,
                None => self.allocate(&request).await,
            },
        }
    }

    /// Remove `(application, id)` and return the record that was removed.
    ///
    /// The removal is conditional on the version that was read. If another
    /// writer replaced the record in between, the call fails with
    /// [`Conflict::Version`] and the newer record stays; if it was removed in
    /// between, the call fails with `NotFound`.
    pub async fn delete(&self, application: &str, id: u32) -> Result<Instance, Error> {
        let current = self
            .fetch(application, id)
            .await?
            .ok_or_else(|| Error::not_found(application, id))?;

        let removal = bounded(
            self.store_timeout,
            "remove",
            self.store.remove(application, id, Some(current.version)),
        )
        .await;

        match removal {
            Ok(()) => {
                tracing::debug!(application, id, token = %current.value.token, "Instance removed");
                Ok(current.into_inner())
            }
            Err(Error::Conflict(Conflict::Version { .. })) => {
                match self.fetch(application, id).await? {
                    Some(newer) => {
                        tracing::debug!(
                            application,
                            id,
                            instance_identifier = %newer.value.instance_identifier,
                            "Instance changed before removal"
                        );
                        Err(Conflict::Version { id }.into())
                    }
                    None => Err(Error::not_found(application, id)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn validate(&self, request: &CreateRequest) -> Result<(), Error> {
        let fields = [
            ("application", &request.application),
            ("datacenter", &request.datacenter),
            ("instance identifier", &request.instance_identifier),
            ("hostname", &request.hostname),
            ("address", &request.address),
            ("rack", &request.rack),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(Error::invalid(format!("{name} must not be empty")));
            }
        }

        if let Some(token) = request.token {
            let partitioner = self.placement.partitioner();
            if !partitioner.contains(token) {
                return Err(Error::invalid(format!(
                    "token {token} is outside the {partitioner} range"
                )));
            }
        }
        Ok(())
    }

    async fn replace(
        &self,
        current: Versioned<Instance>,
        request: &CreateRequest,
    ) -> Result<Registration, Error> {
        let next = current.value.replaced_by(request);
        match self.put(&next, Some(current.version)).await {
            Ok(_) => {
                tracing::debug!(
                    application = %next.application,
                    id = next.id,
                    token = %next.token,
                    "Instance replaced"
                );
                Ok(Registration::new(
                    next,
                    RegistrationKind::Replaced {
                        previous: current.into_inner(),
                    },
                ))
            }
            Err(Error::Conflict(Conflict::Version { .. })) => self.reconcile(request).await,
            Err(e) => Err(e),
        }
    }

    async fn claim(&self, request: &CreateRequest, token: Token) -> Result<Registration, Error> {
        let instance = request.to_instance(token);
        match self.put(&instance, None).await {
            Ok(_) => Ok(Registration::new(instance, RegistrationKind::Created)),
            Err(Error::Conflict(Conflict::Version { .. })) => self.reconcile(request).await,
            Err(e) => Err(e),
        }
    }

    async fn allocate(&self, request: &CreateRequest) -> Result<Registration, Error> {
        let live = bounded(
            self.store_timeout,
            "list",
            self.store.list(&request.application),
        )
        .await?;
        let peers: Vec<&Instance> = live
            .iter()
            .filter(|i| i.datacenter == request.datacenter)
            .collect();

        let racks = rack_order(
            &self.racks,
            peers.iter().map(|i| i.rack.as_str()),
            &request.rack,
        );
        let rack_index = racks
            .iter()
            .position(|r| *r == request.rack)
            .unwrap_or_default();
        let mut taken: HashSet<Token> = peers.iter().map(|i| i.token).collect();

        for attempt in 0..self.max_attempts {
            let candidate = self.placement.candidate(
                &request.datacenter,
                request.id,
                rack_index,
                racks.len(),
                attempt,
            );
            if taken.contains(&candidate) {
                tracing::debug!(id = request.id, attempt, "Candidate token already taken");
                continue;
            }

            let instance = request.to_instance(candidate);
            match self.put(&instance, None).await {
                Ok(_) => {
                    tracing::debug!(
                        application = %instance.application,
                        id = instance.id,
                        token = %instance.token,
                        attempt,
                        "Instance created"
                    );
                    return Ok(Registration::new(instance, RegistrationKind::Created));
                }
                Err(Error::Conflict(Conflict::Token { .. })) => {
                    METRICS.inc_token_retry();
                    taken.insert(candidate);
                    let delay = self.backoff_delay(attempt);
                    tracing::debug!(
                        id = request.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Token claimed concurrently, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(Error::Conflict(Conflict::Version { .. })) => {
                    return self.reconcile(request).await
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            application = %request.application,
            id = request.id,
            attempts = self.max_attempts,
            "Token allocation exhausted"
        );
        Err(Error::AllocationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Another writer won the id between our read and our write. Read once
    /// more and report what is there now.
    async fn reconcile(&self, request: &CreateRequest) -> Result<Registration, Error> {
        match self.fetch(&request.application, request.id).await? {
            Some(current) if current.value.instance_identifier == request.instance_identifier => {
                Ok(Registration::new(current.into_inner(), RegistrationKind::Unchanged))
            }
            Some(current) => Err(Conflict::DuplicateId {
                id: request.id,
                instance_identifier: current.value.instance_identifier,
            }
            .into()),
            None => Err(Conflict::Version { id: request.id }.into()),
        }
    }

    /// Randomized exponential backoff: uniform in `[0, backoff × 2^attempt]`,
    /// the exponent capped at 6.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let cap = self.backoff.as_millis() as u64 * 2u64.pow(attempt.min(6));
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
    }

    async fn fetch(
        &self,
        application: &str,
        id: u32,
    ) -> Result<Option<Versioned<Instance>>, Error> {
        bounded(self.store_timeout, "fetch", self.store.fetch(application, id)).await
    }

    async fn put(&self, instance: &Instance, expected: Option<Version>) -> Result<Version, Error> {
        bounded(self.store_timeout, "put", self.store.put(instance, expected)).await
    }
}
