//
// rate_limiter.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Throttling of iopub output sent to a websocket client.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::RateLimitConfig;

/// Message types that are always delivered and never counted.
pub const EXEMPT_MSG_TYPES: [&str; 3] = ["status", "comm_open", "execute_input"];

/// What to do with an iopub message.
#[derive(Debug, Clone, PartialEq)]
pub enum RateVerdict {
    /// Send the message to the client
    Deliver,

    /// Drop the message. `notices` holds the text of any throttle notices
    /// that should be shown to the user in its place (at most one per limit,
    /// and only when that limit is first exceeded).
    Suppress { notices: Vec<String> },
}

/// A sliding-window limiter over the iopub messages sent to one client.
#[derive(Debug)]
pub struct IopubRateLimiter {
    config: RateLimitConfig,

    /// Expiry time and size of each counted message, oldest first
    window: VecDeque<(Instant, usize)>,

    msg_count: usize,
    byte_count: usize,

    msg_limit_exceeded: bool,
    data_limit_exceeded: bool,
}

impl IopubRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            msg_count: 0,
            byte_count: 0,
            msg_limit_exceeded: false,
            data_limit_exceeded: false,
        }
    }

    /// Number of messages currently counted in the window.
    pub fn msg_count(&self) -> usize {
        self.msg_count
    }

    /// Number of bytes currently counted in the window.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// Whether either limit is currently exceeded.
    pub fn is_throttled(&self) -> bool {
        self.msg_limit_exceeded || self.data_limit_exceeded
    }

    /// Decide whether an iopub message of type `msg_type` and serialized size
    /// `size` (in bytes), arriving at `now`, should be delivered.
    pub fn check(&mut self, msg_type: &str, size: usize, now: Instant) -> RateVerdict {
        if EXEMPT_MSG_TYPES.contains(&msg_type) {
            return RateVerdict::Deliver;
        }

        self.evict(now);
        self.window.push_back((now + self.config.window, size));
        self.msg_count += 1;
        self.byte_count += size;

        let window_secs = self.config.window.as_secs_f64();
        let mut notices = Vec::new();

        if let Some(limit) = self.config.msg_rate_limit {
            let rate = self.msg_count as f64 / window_secs;
            if rate > limit {
                if !self.msg_limit_exceeded {
                    self.msg_limit_exceeded = true;
                    log::warn!(
                        "iopub message rate exceeded ({:.1} msgs/sec > {} msgs/sec)",
                        rate,
                        limit
                    );
                    notices.push(msg_rate_notice(limit, window_secs));
                }
            } else if self.msg_limit_exceeded {
                self.msg_limit_exceeded = false;
                self.log_resumed_if_clear();
            }
        }

        if let Some(limit) = self.config.data_rate_limit {
            let rate = self.byte_count as f64 / window_secs;
            if rate > limit {
                if !self.data_limit_exceeded {
                    self.data_limit_exceeded = true;
                    log::warn!(
                        "iopub data rate exceeded ({:.0} bytes/sec > {} bytes/sec)",
                        rate,
                        limit
                    );
                    notices.push(data_rate_notice(limit, window_secs));
                }
            } else if self.data_limit_exceeded {
                self.data_limit_exceeded = false;
                self.log_resumed_if_clear();
            }
        }

        if self.is_throttled() {
            RateVerdict::Suppress { notices }
        } else {
            RateVerdict::Deliver
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(expiry, size)) = self.window.front() {
            if expiry > now {
                break;
            }
            self.window.pop_front();
            self.msg_count -= 1;
            self.byte_count -= size;
        }
    }

    fn log_resumed_if_clear(&self) {
        if !self.is_throttled() {
            log::warn!("iopub messages resumed");
        }
    }
}

fn msg_rate_notice(limit: f64, window_secs: f64) -> String {
    format!(
        "IOPub message rate exceeded.\n\
         The server will temporarily stop sending output\n\
         to the client in order to avoid crashing it.\n\
         To change this limit, set the config variable\n\
         `--iopub-msg-rate-limit`.\n\
         \n\
         Current values:\n\
         iopub_msg_rate_limit={} (msgs/sec)\n\
         rate_limit_window={} (secs)\n",
        limit, window_secs
    )
}

fn data_rate_notice(limit: f64, window_secs: f64) -> String {
    format!(
        "IOPub data rate exceeded.\n\
         The server will temporarily stop sending output\n\
         to the client in order to avoid crashing it.\n\
         To change this limit, set the config variable\n\
         `--iopub-data-rate-limit`.\n\
         \n\
         Current values:\n\
         iopub_data_rate_limit={} (bytes/sec)\n\
         rate_limit_window={} (secs)\n",
        limit, window_secs
    )
}
