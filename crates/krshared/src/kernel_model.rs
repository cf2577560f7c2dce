//
// kernel_model.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The execution states a kernel can be observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// The kernel process has been launched but has not reported in yet
    Starting,
    /// The kernel is idle
    Idle,
    /// The kernel is busy
    Busy,
    /// The kernel is being restarted
    Restarting,
    /// The kernel is gone for good
    Dead,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Starting => "starting",
            ExecutionState::Idle => "idle",
            ExecutionState::Busy => "busy",
            ExecutionState::Restarting => "restarting",
            ExecutionState::Dead => "dead",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ExecutionState::Starting),
            "idle" => Ok(ExecutionState::Idle),
            "busy" => Ok(ExecutionState::Busy),
            "restarting" => Ok(ExecutionState::Restarting),
            "dead" => Ok(ExecutionState::Dead),
            other => Err(format!("unknown execution state '{}'", other)),
        }
    }
}

/// The content of an iopub `status` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusContent {
    /// The state reported by the kernel. Kept as a string since kernels may
    /// report states this server does not model.
    pub execution_state: String,
}

/// A kernel as described by the REST API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelModel {
    /// The kernel ID
    pub id: String,

    /// The name of the kernel spec the kernel was started from
    pub name: String,

    /// When the kernel last produced or received a message
    #[serde(default, with = "crate::iso_date")]
    pub last_activity: Option<DateTime<Utc>>,

    /// The current execution state
    pub execution_state: ExecutionState,

    /// The number of websocket connections to the kernel
    pub connections: usize,
}
