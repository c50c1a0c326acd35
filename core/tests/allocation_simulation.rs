//! Concurrent bootstrap simulation against the in-memory store.
//!
//! These tests verify that racing registrations never hand out the same id
//! or token twice, and that the ordered view stays consistent afterwards.
//!
//! Run with: cargo test -p ringkeeper-core --test allocation_simulation

use ringkeeper_core::{
    Conflict, CreateRequest, Error, MemoryRegistryStore, Registry, RegistryConfig,
    RegistrationKind,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn config() -> RegistryConfig {
    RegistryConfig {
        application: "cass".into(),
        datacenter: "us-east".into(),
        racks: vec!["1a".into(), "1b".into(), "1c".into()],
        nodes_per_rack: 4,
        backoff: Duration::from_millis(1),
        refresh_interval: None,
        ..RegistryConfig::default()
    }
}

fn request(id: u32, identifier: &str) -> CreateRequest {
    let racks = ["1a", "1b", "1c"];
    CreateRequest {
        application: "cass".into(),
        datacenter: "us-east".into(),
        id,
        instance_identifier: identifier.into(),
        hostname: format!("node{id}.internal"),
        address: format!("10.0.{}.{}", id / 250, id % 250),
        rack: racks[id as usize % racks.len()].into(),
        token: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bootstrap_assigns_distinct_tokens() {
    let registry = Arc::new(Registry::start(
        Arc::new(MemoryRegistryStore::new()),
        &config(),
    ));

    let mut tasks = Vec::new();
    for id in 0..24 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.create(request(id, &format!("i-{id}"))).await
        }));
    }

    let mut tokens = HashSet::new();
    for task in tasks {
        let instance = task.await.unwrap().expect("every distinct id should register");
        assert!(tokens.insert(instance.token), "token {} handed out twice", instance.token);
    }
    assert_eq!(tokens.len(), 24);

    let listed = registry.list_ordered("cass").await.unwrap();
    let ids: Vec<u32> = listed.iter().map(|i| i.id).collect();
    assert_eq!(ids, (0..24).collect::<Vec<_>>());

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_id_race_has_single_winner() {
    let registry = Arc::new(Registry::start(
        Arc::new(MemoryRegistryStore::new()),
        &config(),
    ));

    let mut tasks = Vec::new();
    for host in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            let mut req = request(5, &format!("i-host{host}"));
            // explicit claims never turn into replacements
            req.token = Some(ringkeeper_core::Token::new(1_000 + host));
            registry.create(req).await
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(instance) => winners.push(instance),
            Err(Error::Conflict(Conflict::DuplicateId { id: 5, .. })) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = registry.lookup("cass", "us-east", 5).await.unwrap();
    assert_eq!(stored, winners[0]);
}

#[tokio::test]
async fn test_replacement_after_node_loss() {
    let registry = Registry::start(Arc::new(MemoryRegistryStore::new()), &config());
    let mut events = registry.subscribe();

    let original = registry.create(request(3, "i-lost")).await.unwrap();
    let replacement = registry.register(request(3, "i-fresh")).await.unwrap();

    assert!(matches!(replacement.kind, RegistrationKind::Replaced { .. }));
    assert_eq!(replacement.instance.token, original.token);
    assert_eq!(replacement.instance.rack, original.rack);
    assert_eq!(events.recv().await.unwrap(), ringkeeper_core::MembershipEvent::Joined(original));
    assert!(matches!(
        events.recv().await.unwrap(),
        ringkeeper_core::MembershipEvent::Replaced { .. }
    ));
    assert_eq!(registry.list_ordered("cass").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_frees_id_for_new_token() {
    let registry = Registry::start(Arc::new(MemoryRegistryStore::new()), &config());

    let first = registry.create(request(1, "i-1")).await.unwrap();
    registry.delete("cass", 1).await.unwrap();
    assert!(matches!(
        registry.lookup("cass", "us-east", 1).await,
        Err(Error::NotFound { id: 1, .. })
    ));

    let again = registry.create(request(1, "i-2")).await.unwrap();
    assert_eq!(again.token, first.token);
    assert_eq!(again.instance_identifier, "i-2");
}

#[tokio::test]
async fn test_racks_interleave_around_the_ring() {
    let registry = Registry::start(Arc::new(MemoryRegistryStore::new()), &config());
    for id in 0..6 {
        registry.create(request(id, &format!("i-{id}"))).await.unwrap();
    }

    let mut ring = registry.list_ordered("cass").await.unwrap();
    ring.sort_by_key(|i| i.token);
    let racks: Vec<&str> = ring.iter().map(|i| i.rack.as_str()).collect();
    for pair in racks.windows(2) {
        assert_ne!(pair[0], pair[1], "adjacent tokens share a rack: {racks:?}");
    }
}
