//
// signal.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::atomic::{AtomicBool, Ordering};

use event_listener::Event;

/// A signal that fires at most once and can be awaited by any number of
/// waiters, before or after it fires.
#[derive(Debug, Default)]
pub struct OnceSignal {
    fired: AtomicBool,
    event: Event,
}

impl OnceSignal {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            event: Event::new(),
        }
    }

    /// Fire the signal. Returns `true` if this call fired it and `false` if it
    /// had already fired.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.event.notify(usize::MAX);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait for the signal to fire; returns immediately if it already has.
    pub async fn wait(&self) {
        loop {
            if self.is_fired() {
                return;
            }
            let listener = self.event.listen();
            // Re-check after registering so a fire between the first check
            // and `listen()` is not missed.
            if self.is_fired() {
                return;
            }
            listener.await;
        }
    }
}
