//
// error.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;

use hyper::StatusCode;
use krshared::jupyter_message::JupyterChannel;
use log::error;
use serde::Serialize;

#[derive(Debug)]
pub enum KRError {
    KernelNotFound(String),
    KernelSpecNotFound(String),
    KernelStartFailed(String, anyhow::Error),
    ChannelConnectFailed(String, JupyterChannel, anyhow::Error),
    ChannelClosed(String, JupyterChannel),
    ShutdownFailed(String, anyhow::Error),
    RestartFailed(String, anyhow::Error),
    InterruptFailed(String, anyhow::Error),
    Unauthorized,
    BadRequest(String),
}

/// The JSON body returned by the REST API when a request fails.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl fmt::Display for KRError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error KR-{}: ", self.code())?;
        match self {
            KRError::KernelNotFound(kernel_id) => {
                write!(f, "Kernel {} does not exist", kernel_id)
            }
            KRError::KernelSpecNotFound(name) => {
                write!(f, "No such kernel spec: {}", name)
            }
            KRError::KernelStartFailed(name, err) => {
                write!(f, "Failed to start a '{}' kernel: {}", name, err)
            }
            KRError::ChannelConnectFailed(kernel_id, channel, err) => {
                write!(
                    f,
                    "Failed to connect to the {} channel of kernel {}: {}",
                    channel, kernel_id, err
                )
            }
            KRError::ChannelClosed(kernel_id, channel) => {
                write!(f, "The {} channel of kernel {} is closed", channel, kernel_id)
            }
            KRError::ShutdownFailed(kernel_id, err) => {
                write!(f, "Failed to shut down kernel {}: {}", kernel_id, err)
            }
            KRError::RestartFailed(kernel_id, err) => {
                write!(f, "Failed to restart kernel {}: {}", kernel_id, err)
            }
            KRError::InterruptFailed(kernel_id, err) => {
                write!(f, "Failed to interrupt kernel {}: {}", kernel_id, err)
            }
            KRError::Unauthorized => {
                write!(f, "Missing or invalid authentication token")
            }
            KRError::BadRequest(details) => {
                write!(f, "Bad request: {}", details)
            }
        }
    }
}

impl std::error::Error for KRError {}

impl KRError {
    fn code(&self) -> u8 {
        match self {
            KRError::KernelNotFound(_) => 1,
            KRError::KernelSpecNotFound(_) => 2,
            KRError::KernelStartFailed(_, _) => 3,
            KRError::ChannelConnectFailed(_, _, _) => 4,
            KRError::ChannelClosed(_, _) => 5,
            KRError::ShutdownFailed(_, _) => 6,
            KRError::RestartFailed(_, _) => 7,
            KRError::InterruptFailed(_, _) => 8,
            KRError::Unauthorized => 9,
            KRError::BadRequest(_) => 10,
        }
    }

    /// The HTTP status that best describes this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            KRError::KernelNotFound(_) | KRError::KernelSpecNotFound(_) => StatusCode::NOT_FOUND,
            KRError::Unauthorized => StatusCode::FORBIDDEN,
            KRError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self, reason: Option<String>) -> ErrorBody {
        ErrorBody {
            code: format!("KR-{}", self.code()),
            message: self.to_string(),
            reason,
        }
    }

    pub fn log(&self) {
        error!("{}", self);
    }
}
