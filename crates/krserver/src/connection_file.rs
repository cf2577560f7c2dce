//
// connection_file.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use krshared::jupyter_message::JupyterChannel;
use serde::{Deserialize, Serialize};

/// Ports handed out to kernels that are running or starting.
pub type ReservedPorts = Arc<RwLock<Vec<u16>>>;

/// The contents of a Jupyter connection file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionFile {
    pub control_port: u16,
    pub shell_port: u16,
    pub stdin_port: u16,
    pub iopub_port: u16,
    pub hb_port: u16,
    pub transport: String,
    pub signature_scheme: String,
    pub ip: String,
    pub key: String,
}

impl ConnectionFile {
    /// Parse a connection file.
    pub fn from_file<P: AsRef<Path>>(connection_file: P) -> Result<Self, anyhow::Error> {
        let file = File::open(connection_file)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_file<P: AsRef<Path>>(&self, connection_file: P) -> Result<(), anyhow::Error> {
        let file = File::create(connection_file)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Find a free port that is not in the reserved list, and reserve it.
    fn find_port(name: &str, reserved_ports: &ReservedPorts) -> Result<u16, anyhow::Error> {
        // Picking a reserved port is unlikely since the range is large; if it
        // keeps happening, something is wrong.
        for attempt in 1..=10 {
            let candidate = portpicker::pick_unused_port().ok_or_else(|| {
                anyhow::anyhow!(
                    "Failed to pick {} port; no free ports available or port range exhausted",
                    name
                )
            })?;

            let mut reserved = reserved_ports
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if reserved.contains(&candidate) {
                log::trace!(
                    "Port {} is reserved; trying again (attempt {})",
                    candidate,
                    attempt
                );
                continue;
            }
            reserved.push(candidate);
            log::trace!(
                "Picked {} port: {} ({} ports reserved)",
                name,
                candidate,
                reserved.len()
            );
            return Ok(candidate);
        }
        Err(anyhow::anyhow!(
            "Failed to pick unreserved {} port after 10 tries",
            name
        ))
    }

    /// Generate a connection file with fresh ports and a random signing key.
    ///
    /// # Arguments
    ///
    /// * `ip` - The IP address the kernel binds to
    /// * `reserved_ports` - Ports that must not be used, generally because
    /// another kernel holds them or is about to.
    pub fn generate(ip: String, reserved_ports: &ReservedPorts) -> Result<Self, anyhow::Error> {
        use rand::Rng;

        let key_bytes = rand::thread_rng().gen::<[u8; 16]>();
        let key = hex::encode(key_bytes);

        Ok(Self {
            control_port: Self::find_port("control", reserved_ports)?,
            shell_port: Self::find_port("shell", reserved_ports)?,
            stdin_port: Self::find_port("stdin", reserved_ports)?,
            iopub_port: Self::find_port("iopub", reserved_ports)?,
            hb_port: Self::find_port("heartbeat", reserved_ports)?,
            transport: "tcp".to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            ip,
            key,
        })
    }

    /// Return this file's ports to the pool.
    pub fn release_ports(&self, reserved_ports: &ReservedPorts) {
        let ports = [
            self.control_port,
            self.shell_port,
            self.stdin_port,
            self.iopub_port,
            self.hb_port,
        ];
        reserved_ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|port| !ports.contains(port));
    }

    pub fn port(&self, channel: JupyterChannel) -> u16 {
        match channel {
            JupyterChannel::Shell => self.shell_port,
            JupyterChannel::Control => self.control_port,
            JupyterChannel::Stdin => self.stdin_port,
            JupyterChannel::IOPub => self.iopub_port,
        }
    }

    /// The address a client uses to reach `channel`.
    ///
    /// Example: shell on port `32` => `"tcp://127.0.0.1:32"`
    pub fn endpoint(&self, channel: JupyterChannel) -> String {
        format!("{}://{}:{}", self.transport, self.ip, self.port(channel))
    }
}
