//
// parent_header.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The Jupyter protocol represents a missing parent header as an empty object
//! rather than `null`; map that to `Option::None` and back.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::jupyter_message::JupyterMessageHeader;

pub fn serialize<S>(header: &Option<JupyterMessageHeader>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match header {
        Some(header) => header.serialize(serializer),
        None => Map::new().serialize(serializer),
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<JupyterMessageHeader>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(None),
        Value::Object(ref map) if map.is_empty() => Ok(None),
        value => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
