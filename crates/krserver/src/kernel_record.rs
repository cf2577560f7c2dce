//
// kernel_record.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use krshared::jupyter_message::{JupyterChannel, JupyterMessage};
use krshared::kernel_model::{ExecutionState, KernelModel, StatusContent};
use serde_json::Value;

use crate::supervisor::{RestartCallback, RestartEvent};

/// A kernel_info request shared by every relay waiting on it.
pub type PendingKernelInfo = Shared<BoxFuture<'static, Value>>;

/// The observable state of a kernel, shared between its supervisor, its
/// relays, and the culler.
pub struct KernelRecord {
    /// The kernel ID
    pub id: String,

    /// The name of the kernel spec the kernel was started from
    pub name: String,

    state: Mutex<RecordState>,
    restart_callbacks: Mutex<Vec<(RestartEvent, RestartCallback)>>,
    pending_info: Mutex<Option<PendingKernelInfo>>,
}

#[derive(Debug)]
struct RecordState {
    last_activity: Option<DateTime<Utc>>,
    execution_state: ExecutionState,
    connections: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KernelRecord {
    pub fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            state: Mutex::new(RecordState {
                last_activity: None,
                execution_state: ExecutionState::Starting,
                connections: 0,
            }),
            restart_callbacks: Mutex::new(Vec::new()),
            pending_info: Mutex::new(None),
        }
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).last_activity
    }

    pub fn execution_state(&self) -> ExecutionState {
        lock(&self.state).execution_state
    }

    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }

    pub fn record_activity(&self, at: DateTime<Utc>) {
        lock(&self.state).last_activity = Some(at);
    }

    /// Set the kernel's execution state. `dead` is terminal; once there, the
    /// state no longer changes.
    pub fn set_execution_state(&self, execution_state: ExecutionState, reason: &str) {
        let mut state = lock(&self.state);
        if state.execution_state == execution_state {
            return;
        }
        if state.execution_state == ExecutionState::Dead {
            log::trace!(
                "[kernel {}] ignoring '{}' for dead kernel ({})",
                self.id,
                execution_state,
                reason
            );
            return;
        }
        log::debug!(
            "[kernel {}] state '{}' => '{}' ({})",
            self.id,
            state.execution_state,
            execution_state,
            reason
        );
        state.execution_state = execution_state;
    }

    /// Update activity and execution state from a message the kernel
    /// published on iopub.
    pub fn observe_iopub(&self, msg: &JupyterMessage) {
        self.record_activity(Utc::now());
        if msg.header.msg_type != "status" {
            return;
        }
        let Ok(status) = serde_json::from_value::<StatusContent>(msg.content.clone()) else {
            log::warn!(
                "[kernel {}] Ignoring malformed status message {}",
                self.id,
                msg.header.msg_id
            );
            return;
        };
        match status.execution_state.parse::<ExecutionState>() {
            Ok(execution_state) => self.set_execution_state(
                execution_state,
                &format!("{} status", JupyterChannel::IOPub),
            ),
            Err(err) => log::debug!("[kernel {}] {}", self.id, err),
        }
    }

    pub fn connection_opened(&self) -> usize {
        let mut state = lock(&self.state);
        state.connections += 1;
        state.connections
    }

    pub fn connection_closed(&self) -> usize {
        let mut state = lock(&self.state);
        state.connections = state.connections.saturating_sub(1);
        state.connections
    }

    pub fn to_model(&self) -> KernelModel {
        let state = lock(&self.state);
        KernelModel {
            id: self.id.clone(),
            name: self.name.clone(),
            last_activity: state.last_activity,
            execution_state: state.execution_state,
            connections: state.connections,
        }
    }

    pub fn add_restart_callback(&self, event: RestartEvent, callback: RestartCallback) {
        lock(&self.restart_callbacks).push((event, callback));
    }

    pub fn remove_restart_callback(&self, event: RestartEvent, callback: &RestartCallback) {
        lock(&self.restart_callbacks).retain(|(e, cb)| !(*e == event && Arc::ptr_eq(cb, callback)));
    }

    /// Invoke every callback registered for `event`.
    pub fn fire_restart_event(&self, event: RestartEvent) {
        // Clone the list so callbacks can add or remove callbacks themselves.
        let callbacks: Vec<RestartCallback> = lock(&self.restart_callbacks)
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, cb)| cb.clone())
            .collect();
        log::debug!(
            "[kernel {}] {:?}: notifying {} callback(s)",
            self.id,
            event,
            callbacks.len()
        );
        for callback in callbacks {
            callback(event);
        }
    }

    /// Return the in-flight kernel_info request, or start one with `request`
    /// if none is in flight. Everyone who asks while a request is pending gets
    /// the same result.
    pub fn kernel_info<F>(&self, request: F) -> PendingKernelInfo
    where
        F: FnOnce() -> BoxFuture<'static, Value>,
    {
        let mut pending = lock(&self.pending_info);
        if let Some(info) = pending.as_ref() {
            if info.peek().is_none() {
                log::debug!("[kernel {}] Joining pending kernel_info request", self.id);
                return info.clone();
            }
        }
        let info = request().shared();
        *pending = Some(info.clone());
        info
    }
}

impl std::fmt::Debug for KernelRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &*lock(&self.state))
            .finish()
    }
}
