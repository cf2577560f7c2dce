//
// config.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Runtime configuration for the relay, the rate limiter, and the culler.

use std::path::PathBuf;
use std::time::Duration;

/// Limits on iopub traffic forwarded to a single websocket client.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum messages per second; `None` is unlimited
    pub msg_rate_limit: Option<f64>,

    /// Maximum bytes per second; `None` is unlimited
    pub data_rate_limit: Option<f64>,

    /// The window over which rates are computed
    pub window: Duration,
}

impl RateLimitConfig {
    /// Build a configuration from raw values, where a limit of zero (or less)
    /// means unlimited.
    pub fn new(msg_rate_limit: f64, data_rate_limit: f64, window_secs: f64) -> Self {
        let limit = |value: f64| if value > 0.0 { Some(value) } else { None };
        let window = if window_secs > 0.0 {
            Duration::from_secs_f64(window_secs)
        } else {
            log::warn!(
                "Ignoring non-positive rate limit window {}; using 1.0s",
                window_secs
            );
            Duration::from_secs(1)
        };
        Self {
            msg_rate_limit: limit(msg_rate_limit),
            data_rate_limit: limit(data_rate_limit),
            window,
        }
    }

    /// A configuration that never throttles.
    pub fn unlimited() -> Self {
        Self {
            msg_rate_limit: None,
            data_rate_limit: None,
            window: Duration::from_secs(1),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(1000.0, 1_000_000.0, 1.0)
    }
}

/// Settings for each websocket relay connection.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub rate_limit: RateLimitConfig,

    /// How long to wait for a kernel_info_reply before carrying on without one
    pub kernel_info_timeout: Duration,

    /// How often to ping the client; `None` disables keepalive pings
    pub ping_interval: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            kernel_info_timeout: Duration::from_secs(10),
            ping_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Settings for idle kernel culling.
#[derive(Debug, Clone)]
pub struct CullConfig {
    /// Minutes of inactivity after which a kernel is shut down; 0 disables
    /// culling
    pub idle_timeout_minutes: u64,

    /// How often to look for idle kernels
    pub interval: Duration,

    /// Whether kernels reporting `busy` may be culled
    pub cull_busy: bool,

    /// Whether kernels with open websocket connections may be culled
    pub cull_connected: bool,
}

impl CullConfig {
    pub fn enabled(&self) -> bool {
        self.idle_timeout_minutes > 0
    }
}

impl Default for CullConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 0,
            interval: Duration::from_secs(300),
            cull_busy: false,
            cull_connected: false,
        }
    }
}

/// Everything the server needs to know at startup.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub relay: RelayConfig,
    pub cull: CullConfig,

    /// The directory holding `<name>/kernel.json` kernel specs
    pub kernel_dir: Option<PathBuf>,

    /// The kernel spec used when a start request names none
    pub default_kernel: Option<String>,

    /// The IP address kernels bind to
    pub kernel_ip: String,

    /// The authentication token, or `None` if authentication is disabled
    pub token: Option<String>,
}
