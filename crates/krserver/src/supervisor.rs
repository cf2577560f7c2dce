//
// supervisor.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The seam between websocket relays and whatever owns the kernels.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use krshared::jupyter_message::{JupyterChannel, JupyterMessage};
use krshared::kernel_model::KernelModel;

use crate::error::KRError;
use crate::kernel_record::KernelRecord;

/// Lifecycle events a relay can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartEvent {
    /// The kernel was restarted (automatically or on request)
    Restarted,

    /// The kernel died and will not be restarted
    Dead,
}

/// A callback invoked when a kernel emits a [`RestartEvent`]. Callbacks are
/// identified by pointer, so removal needs the same `Arc`.
pub type RestartCallback = Arc<dyn Fn(RestartEvent) + Send + Sync>;

/// The relay's end of a bidirectional message stream on one kernel channel.
///
/// Dropping the stream closes it; the kernel side sees the closure and stops
/// forwarding.
#[derive(Debug)]
pub struct ChannelStream {
    channel: JupyterChannel,
    to_kernel: Sender<JupyterMessage>,
    from_kernel: Receiver<JupyterMessage>,
}

/// The kernel's end of a [`ChannelStream`].
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    pub channel: JupyterChannel,
    pub from_client: Receiver<JupyterMessage>,
    pub to_client: Sender<JupyterMessage>,
}

impl ChannelStream {
    /// Create a connected stream and endpoint.
    pub fn pair(channel: JupyterChannel) -> (ChannelStream, ChannelEndpoint) {
        let (to_kernel, from_client) = async_channel::unbounded();
        let (to_client, from_kernel) = async_channel::unbounded();
        (
            ChannelStream {
                channel,
                to_kernel,
                from_kernel,
            },
            ChannelEndpoint {
                channel,
                from_client,
                to_client,
            },
        )
    }

    pub fn channel(&self) -> JupyterChannel {
        self.channel
    }

    /// Send a message toward the kernel.
    pub async fn send(
        &self,
        msg: JupyterMessage,
    ) -> Result<(), async_channel::SendError<JupyterMessage>> {
        self.to_kernel.send(msg).await
    }

    /// Receive the next message from the kernel; `None` once the stream is
    /// closed and drained.
    pub async fn recv(&self) -> Option<JupyterMessage> {
        self.from_kernel.recv().await.ok()
    }

    /// Close both directions of the stream.
    pub fn close(&self) {
        self.to_kernel.close();
        self.from_kernel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.to_kernel.is_closed() || self.from_kernel.is_closed()
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChannelEndpoint {
    /// Close both directions, ending the relay's stream.
    pub fn close(&self) {
        self.from_client.close();
        self.to_client.close();
    }

    pub fn is_closed(&self) -> bool {
        self.from_client.is_closed() || self.to_client.is_closed()
    }
}

/// Owns kernels and their lifecycles.
///
/// The relay only needs the lookup, channel, callback, and shutdown methods;
/// the rest back the REST API.
#[async_trait]
pub trait KernelSupervisor: Send + Sync {
    /// Look up a kernel's record.
    fn get_kernel(&self, kernel_id: &str) -> Option<Arc<KernelRecord>>;

    /// List all tracked kernels.
    fn list_kernels(&self) -> Vec<Arc<KernelRecord>>;

    /// Open a stream on one of a kernel's channels. When `identity` is given
    /// it is used as the routing identity on the kernel side.
    async fn connect_channel(
        &self,
        kernel_id: &str,
        channel: JupyterChannel,
        identity: Option<&str>,
    ) -> Result<ChannelStream, KRError>;

    /// Start a kernel from the named kernel spec (or the default one).
    async fn start_kernel(&self, name: Option<&str>) -> Result<KernelModel, KRError>;

    /// Shut a kernel down and stop tracking it.
    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), KRError>;

    /// Restart a kernel in place, keeping its ID and connection details.
    async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel, KRError>;

    /// Interrupt whatever the kernel is doing.
    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), KRError>;

    /// Register a callback for a kernel lifecycle event.
    fn add_restart_callback(
        &self,
        kernel_id: &str,
        event: RestartEvent,
        callback: RestartCallback,
    ) {
        match self.get_kernel(kernel_id) {
            Some(kernel) => kernel.add_restart_callback(event, callback),
            None => log::debug!(
                "[kernel {}] Not registering {:?} callback; no such kernel",
                kernel_id,
                event
            ),
        }
    }

    /// Remove a callback previously added with
    /// [`KernelSupervisor::add_restart_callback`].
    fn remove_restart_callback(
        &self,
        kernel_id: &str,
        event: RestartEvent,
        callback: &RestartCallback,
    ) {
        if let Some(kernel) = self.get_kernel(kernel_id) {
            kernel.remove_restart_callback(event, callback);
        }
    }
}
