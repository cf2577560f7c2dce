//
// kernel_connection.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// What the server needs to sign and verify messages exchanged with one
/// kernel.
#[derive(Debug, Clone)]
pub struct KernelConnection {
    /// The ID of the kernel
    pub kernel_id: String,

    /// The HMAC key used to sign messages, or `None` if messages are unsigned
    pub hmac_key: Option<Hmac<Sha256>>,
}

impl KernelConnection {
    /// Create a connection for a kernel using `key` as its signing key. An
    /// empty key disables signing, as in the Jupyter protocol.
    pub fn new(kernel_id: &str, key: &str) -> Result<Self, anyhow::Error> {
        let hmac_key = if key.is_empty() {
            None
        } else {
            Some(Hmac::<Sha256>::new_from_slice(key.as_bytes())?)
        };
        Ok(Self {
            kernel_id: kernel_id.to_string(),
            hmac_key,
        })
    }

    /// Compute the hex-encoded signature over a message's parts.
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.hmac_key {
            Some(key) => {
                let mut mac = key.clone();
                for part in parts {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
            None => String::new(),
        }
    }

    /// Check a hex-encoded signature over a message's parts.
    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<(), anyhow::Error> {
        let Some(key) = &self.hmac_key else {
            return Ok(());
        };
        let expected = hex::decode(signature)
            .map_err(|err| anyhow::anyhow!("Malformed message signature: {}", err))?;
        let mut mac = key.clone();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&expected)
            .map_err(|_| anyhow::anyhow!("Invalid message signature"))
    }
}
