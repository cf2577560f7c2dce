//
// culler_test.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

#[path = "common/mod.rs"]
mod common;

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use common::FakeSupervisor;
use krserver::config::CullConfig;
use krserver::culler::IdleCuller;
use krserver::supervisor::KernelSupervisor;
use krshared::kernel_model::ExecutionState;

fn culler(idle_timeout_minutes: u64) -> IdleCuller {
    IdleCuller::new(CullConfig {
        idle_timeout_minutes,
        ..CullConfig::default()
    })
}

#[test]
fn test_disabled_culler_culls_nothing() {
    let supervisor = FakeSupervisor::new();
    let kernel = supervisor.add_kernel("k1");
    let now = Utc::now();
    kernel.record_activity(now - chrono::Duration::days(7));
    assert!(!culler(0).is_cullable(&kernel, now));
}

#[test]
fn test_idle_threshold_is_exclusive() {
    let supervisor = FakeSupervisor::new();
    let kernel = supervisor.add_kernel("k1");
    let culler = culler(5);
    let now = Utc::now();

    kernel.record_activity(now - chrono::Duration::minutes(5));
    assert!(!culler.is_cullable(&kernel, now));

    kernel.record_activity(now - chrono::Duration::minutes(5) - chrono::Duration::seconds(1));
    assert!(culler.is_cullable(&kernel, now));
}

#[test]
fn test_cull_decision_around_timeout() {
    let supervisor = FakeSupervisor::new();
    let kernel = supervisor.add_kernel("k1");
    let culler = culler(30);
    let now = Utc::now();

    kernel.record_activity(now - chrono::Duration::minutes(29));
    assert!(!culler.is_cullable(&kernel, now));

    kernel.record_activity(now - chrono::Duration::minutes(31));
    assert!(culler.is_cullable(&kernel, now));
}

#[test]
fn test_kernels_without_activity_are_kept() {
    let supervisor = FakeSupervisor::new();
    let kernel = supervisor.add_kernel("k1");
    assert!(kernel.last_activity().is_none());
    assert!(!culler(1).is_cullable(&kernel, Utc::now()));
}

#[test]
fn test_busy_and_connected_kernels() {
    let supervisor = FakeSupervisor::new();
    let kernel = supervisor.add_kernel("k1");
    let now = Utc::now();
    kernel.record_activity(now - chrono::Duration::hours(1));
    kernel.set_execution_state(ExecutionState::Busy, "test");
    kernel.connection_opened();

    // By default both protect a kernel
    let culler = culler(10);
    assert!(!culler.is_cullable(&kernel, now));
    kernel.set_execution_state(ExecutionState::Idle, "test");
    assert!(!culler.is_cullable(&kernel, now));
    kernel.connection_closed();
    assert!(culler.is_cullable(&kernel, now));

    kernel.set_execution_state(ExecutionState::Busy, "test");
    kernel.connection_opened();
    let cull_anything = IdleCuller::new(CullConfig {
        idle_timeout_minutes: 10,
        cull_busy: true,
        cull_connected: true,
        ..CullConfig::default()
    });
    assert!(cull_anything.is_cullable(&kernel, now));

    let cull_busy_only = IdleCuller::new(CullConfig {
        idle_timeout_minutes: 10,
        cull_busy: true,
        ..CullConfig::default()
    });
    assert!(!cull_busy_only.is_cullable(&kernel, now));
    kernel.connection_closed();
    assert!(cull_busy_only.is_cullable(&kernel, now));
}

#[tokio::test]
async fn test_poll_once_shuts_down_idle_kernels() {
    let supervisor = FakeSupervisor::new();
    let now = Utc::now();
    let idle = supervisor.add_kernel("idle");
    idle.record_activity(now - chrono::Duration::minutes(30));
    let active = supervisor.add_kernel("active");
    active.record_activity(now);

    let culled = culler(10).poll_once(supervisor.as_ref(), now).await;
    assert_eq!(culled, vec![String::from("idle")]);
    assert_eq!(*supervisor.shutdowns.lock().unwrap(), vec![String::from("idle")]);
    assert!(supervisor.get_kernel("idle").is_none());
    assert!(supervisor.get_kernel("active").is_some());
}

#[tokio::test]
async fn test_periodic_culling() {
    let supervisor = FakeSupervisor::new();
    let kernel = supervisor.add_kernel("k1");
    kernel.record_activity(Utc::now() - chrono::Duration::minutes(10));

    let culler = Arc::new(IdleCuller::new(CullConfig {
        idle_timeout_minutes: 1,
        interval: Duration::from_millis(50),
        ..CullConfig::default()
    }));
    let dyn_supervisor: Arc<dyn KernelSupervisor> = supervisor.clone();
    let weak: Weak<dyn KernelSupervisor> = Arc::downgrade(&dyn_supervisor);
    assert!(culler.ensure_started(weak.clone()));
    assert!(!culler.ensure_started(weak));

    let culled = tokio::time::timeout(Duration::from_secs(5), async {
        while supervisor.shutdowns.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(culled.is_ok(), "idle kernel was never culled");
    assert!(supervisor.get_kernel("k1").is_none());
}

#[tokio::test]
async fn test_disabled_culler_never_starts() {
    let supervisor: Arc<dyn KernelSupervisor> = FakeSupervisor::new();
    let culler = Arc::new(culler(0));
    assert!(!culler.ensure_started(Arc::downgrade(&supervisor)));
}
