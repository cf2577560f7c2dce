//
// connection_registry_test.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::Arc;
use std::time::Duration;

use krserver::connection_registry::{ConnectionRegistry, RelayHandle, RelayState, SessionKey};
use tokio::time::timeout;

fn handle(kernel_id: &str, session_id: &str) -> Arc<RelayHandle> {
    Arc::new(RelayHandle::new(SessionKey::new(kernel_id, session_id)))
}

/// Stand in for a relay: close as soon as asked to.
fn close_on_request(handle: Arc<RelayHandle>) {
    tokio::spawn(async move {
        handle.close_requested().await;
        handle.set_state(RelayState::Closing);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.mark_closed();
    });
}

#[test]
fn test_session_key_display() {
    assert_eq!(SessionKey::new("k1", "s1").to_string(), "k1:s1");
}

#[tokio::test]
async fn test_register_and_unregister() {
    let registry = ConnectionRegistry::new();
    let relay = handle("k1", "s1");
    registry.register(&relay).await;
    assert_eq!(registry.len(), 1);
    assert_eq!(
        registry.get(&relay.key).unwrap().connection_id,
        relay.connection_id
    );

    assert!(registry.unregister(&relay));
    assert!(registry.is_empty());
    assert!(!registry.unregister(&relay));
}

#[tokio::test]
async fn test_distinct_sessions_coexist() {
    let registry = ConnectionRegistry::new();
    let first = handle("k1", "s1");
    let second = handle("k1", "s2");
    let third = handle("k2", "s1");
    for relay in [&first, &second, &third] {
        registry.register(relay).await;
    }
    assert_eq!(registry.len(), 3);
    assert!(!first.is_close_requested());
}

#[tokio::test]
async fn test_replacement_waits_for_stale_connection() {
    let registry = ConnectionRegistry::new();
    let stale = handle("k1", "s1");
    registry.register(&stale).await;
    close_on_request(stale.clone());

    let fresh = handle("k1", "s1");
    timeout(Duration::from_secs(5), registry.register(&fresh))
        .await
        .expect("replacement never completed");

    assert!(stale.is_close_requested());
    assert!(stale.is_closed());
    assert_eq!(stale.state(), RelayState::Closed);
    assert_eq!(
        registry.get(&fresh.key).unwrap().connection_id,
        fresh.connection_id
    );

    // The stale relay's late cleanup must not evict its replacement
    assert!(!registry.unregister(&stale));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_simultaneous_replacements_end_with_one_winner() {
    let registry = Arc::new(ConnectionRegistry::new());
    let original = handle("k1", "s1");
    registry.register(&original).await;
    close_on_request(original.clone());

    let contenders: Vec<Arc<RelayHandle>> = (0..4).map(|_| handle("k1", "s1")).collect();
    let tasks: Vec<_> = contenders
        .iter()
        .map(|relay| {
            close_on_request(relay.clone());
            let registry = registry.clone();
            let relay = relay.clone();
            tokio::spawn(async move { registry.register(&relay).await })
        })
        .collect();
    for task in tasks {
        timeout(Duration::from_secs(5), task)
            .await
            .expect("registration hung")
            .unwrap();
    }

    let live: Vec<_> = contenders.iter().filter(|relay| !relay.is_closed()).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(
        registry.get(&original.key).unwrap().connection_id,
        live[0].connection_id
    );
    assert!(original.is_closed());
}

#[tokio::test]
async fn test_dropped_handles_are_not_counted() {
    let registry = ConnectionRegistry::new();
    {
        let relay = handle("k1", "s1");
        registry.register(&relay).await;
    }
    assert_eq!(registry.len(), 0);
    assert!(registry.get(&SessionKey::new("k1", "s1")).is_none());

    // Registering over a dropped handle doesn't wait on anything
    let relay = handle("k1", "s1");
    timeout(Duration::from_secs(1), registry.register(&relay))
        .await
        .expect("registration blocked on a dead relay");
}

#[tokio::test]
async fn test_close_kernel_connections() {
    let registry = ConnectionRegistry::new();
    let a = handle("k1", "s1");
    let b = handle("k1", "s2");
    let c = handle("k2", "s1");
    for relay in [&a, &b, &c] {
        registry.register(relay).await;
    }

    assert_eq!(registry.close_kernel_connections("k1"), 2);
    assert!(a.is_close_requested());
    assert!(b.is_close_requested());
    assert!(!c.is_close_requested());
    assert_eq!(registry.close_kernel_connections("k3"), 0);
}

#[tokio::test]
async fn test_request_close_is_idempotent() {
    let relay = handle("k1", "s1");
    relay.request_close();
    relay.request_close();
    timeout(Duration::from_secs(1), relay.close_requested())
        .await
        .expect("close request was lost");
    assert!(!relay.is_closed());

    relay.mark_closed();
    relay.mark_closed();
    timeout(Duration::from_secs(1), relay.wait_closed())
        .await
        .expect("close was lost");
}
