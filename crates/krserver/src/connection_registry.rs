//
// connection_registry.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Tracks the live websocket relay for each (kernel, client session) pair so
//! that a reconnecting client replaces its stale connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::signal::OnceSignal;

/// Identifies one client session's connection to one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub kernel_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(kernel_id: &str, session_id: &str) -> Self {
        Self {
            kernel_id: kernel_id.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kernel_id, self.session_id)
    }
}

/// Lifecycle phases of a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// The registry's handle on a relay: enough to ask it to close and to wait
/// until it has.
#[derive(Debug)]
pub struct RelayHandle {
    /// Unique ID of this connection, for logging
    pub connection_id: String,
    pub key: SessionKey,
    state: Mutex<RelayState>,
    close_requested: OnceSignal,
    closed: OnceSignal,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayHandle {
    pub fn new(key: SessionKey) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            key,
            state: Mutex::new(RelayState::Connecting),
            close_requested: OnceSignal::new(),
            closed: OnceSignal::new(),
        }
    }

    pub fn state(&self) -> RelayState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: RelayState) {
        let mut current = lock(&self.state);
        if *current != state {
            log::debug!(
                "[relay {}] {:?} => {:?}",
                self.connection_id,
                *current,
                state
            );
            *current = state;
        }
    }

    /// Ask the relay to close. Idempotent.
    pub fn request_close(&self) {
        if self.close_requested.fire() {
            log::debug!("[relay {}] Close requested", self.connection_id);
        }
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.is_fired()
    }

    /// Resolves once [`RelayHandle::request_close`] has been called.
    pub async fn close_requested(&self) {
        self.close_requested.wait().await
    }

    /// Mark the relay as fully closed, waking anyone in
    /// [`RelayHandle::wait_closed`].
    pub fn mark_closed(&self) {
        self.set_state(RelayState::Closed);
        self.closed.fire();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    pub async fn wait_closed(&self) {
        self.closed.wait().await
    }
}

/// Maps each session key to its live relay.
///
/// Registrations for the same key are serialized by a per-key gate, so a
/// replacement never observes a half-registered connection. The map itself is
/// only ever locked briefly and never across an await, which lets a stale
/// relay unregister itself while its replacement waits for it to close.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<SessionKey, Weak<RelayHandle>>>,
    gates: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the live relay for its key. If another relay is
    /// registered under the key, it is asked to close and this waits until it
    /// has finished closing before taking its place.
    pub async fn register(&self, handle: &Arc<RelayHandle>) {
        let gate = {
            let mut gates = lock(&self.gates);
            gates
                .entry(handle.key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        {
            let _guard = gate.lock().await;
            let stale = lock(&self.entries)
                .get(&handle.key)
                .and_then(Weak::upgrade)
                .filter(|existing| !Arc::ptr_eq(existing, handle));

            if let Some(stale) = stale {
                log::info!(
                    "[relay {}] Replacing stale connection {} for {}",
                    handle.connection_id,
                    stale.connection_id,
                    handle.key
                );
                stale.request_close();
                stale.wait_closed().await;
            }

            lock(&self.entries).insert(handle.key.clone(), Arc::downgrade(handle));
        }

        // Drop the gate if nobody else is queued on it. Anyone who wants it
        // must clone it out of the map under this same lock.
        let mut gates = lock(&self.gates);
        if Arc::strong_count(&gate) == 2 {
            gates.remove(&handle.key);
        }
    }

    /// Remove `handle` from the registry, but only if it is still the
    /// registered relay for its key. Returns whether an entry was removed.
    pub fn unregister(&self, handle: &RelayHandle) -> bool {
        let mut entries = lock(&self.entries);
        let is_current = entries
            .get(&handle.key)
            .map(|existing| std::ptr::eq(existing.as_ptr(), handle))
            .unwrap_or(false);
        if is_current {
            entries.remove(&handle.key);
        }
        is_current
    }

    /// The live relay registered under `key`, if any.
    pub fn get(&self, key: &SessionKey) -> Option<Arc<RelayHandle>> {
        lock(&self.entries).get(key).and_then(Weak::upgrade)
    }

    /// Number of live registered relays.
    pub fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every relay connected to `kernel_id` to close.
    pub fn close_kernel_connections(&self, kernel_id: &str) -> usize {
        let handles: Vec<Arc<RelayHandle>> = lock(&self.entries)
            .iter()
            .filter(|(key, _)| key.kernel_id == kernel_id)
            .filter_map(|(_, entry)| entry.upgrade())
            .collect();
        for handle in &handles {
            handle.request_close();
        }
        handles.len()
    }
}
