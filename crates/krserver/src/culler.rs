//
// culler.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Shuts down kernels that have been idle for too long.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use krshared::kernel_model::ExecutionState;

use crate::config::CullConfig;
use crate::kernel_record::KernelRecord;
use crate::supervisor::KernelSupervisor;

pub struct IdleCuller {
    config: CullConfig,
    started: AtomicBool,
}

impl IdleCuller {
    pub fn new(config: CullConfig) -> Self {
        if config.enabled() {
            log::info!(
                "Culling kernels idle for more than {} minute(s), checking every {:?}",
                config.idle_timeout_minutes,
                config.interval
            );
        }
        Self {
            config,
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CullConfig {
        &self.config
    }

    /// Whether `kernel` should be culled at `now`.
    pub fn is_cullable(&self, kernel: &KernelRecord, now: DateTime<Utc>) -> bool {
        if !self.config.enabled() {
            return false;
        }
        // Kernels that have never reported in are left alone.
        let Some(last_activity) = kernel.last_activity() else {
            return false;
        };
        let timeout = chrono::Duration::minutes(self.config.idle_timeout_minutes as i64);
        let idle = now.signed_duration_since(last_activity);
        if idle <= timeout {
            return false;
        }
        if !self.config.cull_busy && kernel.execution_state() == ExecutionState::Busy {
            log::debug!("[kernel {}] Idle but busy; not culling", kernel.id);
            return false;
        }
        if !self.config.cull_connected && kernel.connections() > 0 {
            log::debug!("[kernel {}] Idle but connected; not culling", kernel.id);
            return false;
        }
        true
    }

    /// Check every kernel once and shut down the idle ones. Returns the IDs of
    /// the kernels that were shut down.
    pub async fn poll_once(
        &self,
        supervisor: &dyn KernelSupervisor,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut culled = Vec::new();
        for kernel in supervisor.list_kernels() {
            if !self.is_cullable(&kernel, now) {
                continue;
            }
            let idle = kernel
                .last_activity()
                .map(|at| now.signed_duration_since(at))
                .unwrap_or_else(chrono::Duration::zero);
            log::warn!(
                "[kernel {}] Culling '{}' kernel after {}s of inactivity ({} connection(s))",
                kernel.id,
                kernel.execution_state(),
                idle.num_seconds(),
                kernel.connections()
            );
            match supervisor.shutdown_kernel(&kernel.id).await {
                Ok(()) => culled.push(kernel.id.clone()),
                Err(err) => log::error!("[kernel {}] Failed to cull kernel: {}", kernel.id, err),
            }
        }
        culled
    }

    /// Start the periodic check, unless culling is disabled or the check is
    /// already running. The task ends once the supervisor is dropped.
    pub fn ensure_started(self: &Arc<Self>, supervisor: Weak<dyn KernelSupervisor>) -> bool {
        if !self.config.enabled() {
            return false;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let culler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(culler.config.interval);
            // The first tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    log::debug!("Kernel supervisor gone; stopping idle culler");
                    break;
                };
                culler.poll_once(supervisor.as_ref(), Utc::now()).await;
            }
        });
        log::debug!("Started idle culler");
        true
    }
}
