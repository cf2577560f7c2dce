//
// kernel_info.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The language a kernel implements, as described in its kernel info.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct LanguageInfo {
    #[serde(default)]
    pub name: String,
    pub version: Option<String>,
    pub file_extension: Option<String>,
}

/// The parts of a `kernel_info_reply` the server cares about. Everything but
/// the protocol version is optional since kernels differ in how much of the
/// reply they fill in.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KernelInfoReply {
    pub protocol_version: String,
    pub implementation: Option<String>,
    pub language_info: Option<LanguageInfo>,
    pub banner: Option<String>,
}

impl KernelInfoReply {
    /// Read the reply out of a `kernel_info_reply` message's content. Returns
    /// `None` when the content carries no protocol version.
    pub fn from_content(content: &Value) -> Option<Self> {
        serde_json::from_value(content.clone()).ok()
    }

    /// The name of the kernel's language, or `"unknown"`.
    pub fn language(&self) -> &str {
        self.language_info
            .as_ref()
            .map(|info| info.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or("unknown")
    }
}
