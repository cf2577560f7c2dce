//
// kernel_record_test.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use krserver::kernel_record::KernelRecord;
use krserver::signal::OnceSignal;
use krserver::supervisor::{RestartCallback, RestartEvent};
use krshared::jupyter_message::{JupyterMessage, JupyterMessageHeader};
use krshared::kernel_model::ExecutionState;
use serde_json::{json, Value};
use tokio::sync::oneshot;

fn record() -> KernelRecord {
    KernelRecord::new(String::from("k1"), String::from("python3"))
}

fn status(state: &str) -> JupyterMessage {
    JupyterMessage::new(
        JupyterMessageHeader::new(uuid::Uuid::new_v4().to_string(), "status", "kernel"),
        json!({ "execution_state": state }),
    )
}

#[test]
fn test_iopub_status_updates_state() {
    let kernel = record();
    assert_eq!(kernel.execution_state(), ExecutionState::Starting);
    assert!(kernel.last_activity().is_none());

    kernel.observe_iopub(&status("busy"));
    assert_eq!(kernel.execution_state(), ExecutionState::Busy);
    assert!(kernel.last_activity().is_some());

    kernel.observe_iopub(&status("idle"));
    assert_eq!(kernel.execution_state(), ExecutionState::Idle);

    // Unknown states and other message types leave the state alone
    kernel.observe_iopub(&status("pondering"));
    let stream = JupyterMessage::new(
        JupyterMessageHeader::new(String::from("m"), "stream", "kernel"),
        json!({ "name": "stdout", "text": "busy" }),
    );
    kernel.observe_iopub(&stream);
    assert_eq!(kernel.execution_state(), ExecutionState::Idle);
}

#[test]
fn test_dead_is_terminal() {
    let kernel = record();
    kernel.set_execution_state(ExecutionState::Dead, "test");
    kernel.observe_iopub(&status("idle"));
    kernel.set_execution_state(ExecutionState::Restarting, "test");
    assert_eq!(kernel.execution_state(), ExecutionState::Dead);
}

#[test]
fn test_connection_counting() {
    let kernel = record();
    assert_eq!(kernel.connection_opened(), 1);
    assert_eq!(kernel.connection_opened(), 2);
    assert_eq!(kernel.connection_closed(), 1);
    assert_eq!(kernel.connection_closed(), 0);
    assert_eq!(kernel.connection_closed(), 0);
}

#[test]
fn test_model_json() {
    let kernel = record();
    kernel.set_execution_state(ExecutionState::Idle, "test");
    kernel.connection_opened();
    let model = serde_json::to_value(kernel.to_model()).unwrap();
    assert_eq!(model["id"], "k1");
    assert_eq!(model["name"], "python3");
    assert_eq!(model["execution_state"], "idle");
    assert_eq!(model["connections"], 1);
    assert!(model["last_activity"].is_null());
}

#[test]
fn test_restart_callbacks() {
    let kernel = record();
    let restarts = Arc::new(AtomicUsize::new(0));
    let counter = restarts.clone();
    let callback: RestartCallback = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    kernel.add_restart_callback(RestartEvent::Restarted, callback.clone());

    kernel.fire_restart_event(RestartEvent::Restarted);
    kernel.fire_restart_event(RestartEvent::Dead);
    assert_eq!(restarts.load(Ordering::SeqCst), 1);

    // Removal needs the same callback; a lookalike does nothing
    let lookalike: RestartCallback = Arc::new(|_| {});
    kernel.remove_restart_callback(RestartEvent::Restarted, &lookalike);
    kernel.fire_restart_event(RestartEvent::Restarted);
    assert_eq!(restarts.load(Ordering::SeqCst), 2);

    kernel.remove_restart_callback(RestartEvent::Restarted, &callback);
    kernel.fire_restart_event(RestartEvent::Restarted);
    assert_eq!(restarts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_kernel_info_requests_are_shared_while_pending() {
    let kernel = record();
    let requests = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel::<Value>();

    let counter = requests.clone();
    let first = kernel.kernel_info(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { rx.await.unwrap_or_else(|_| json!({})) }.boxed()
    });
    let counter = requests.clone();
    let second = kernel.kernel_info(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { json!({ "protocol_version": "wrong" }) }.boxed()
    });

    tx.send(json!({ "protocol_version": "5.3" })).unwrap();
    assert_eq!(first.await["protocol_version"], "5.3");
    assert_eq!(second.await["protocol_version"], "5.3");
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    // Once answered, the next caller asks again
    let counter = requests.clone();
    let third = kernel.kernel_info(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { json!({ "protocol_version": "5.4" }) }.boxed()
    });
    assert_eq!(third.await["protocol_version"], "5.4");
    assert_eq!(requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_signal_wakes_every_waiter() {
    let signal = Arc::new(OnceSignal::new());
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(signal.fire());
    assert!(!signal.fire());
    for waiter in waiters {
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter never woke")
            .unwrap();
    }

    // Late waiters return at once
    tokio::time::timeout(Duration::from_secs(1), signal.wait())
        .await
        .expect("late waiter blocked");
    assert!(signal.is_fired());
}
