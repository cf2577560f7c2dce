//
// kernel_relay.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Relays Jupyter messages between one websocket client and one kernel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, SinkExt, StreamExt};
use krshared::jupyter_message::{
    JupyterChannel, JupyterMessage, JupyterMessageHeader, PROTOCOL_VERSION,
};
use krshared::kernel_info::KernelInfoReply;
use krshared::kernel_model::ExecutionState;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::RelayConfig;
use crate::connection_registry::{ConnectionRegistry, RelayHandle, RelayState, SessionKey};
use crate::error::KRError;
use crate::kernel_record::KernelRecord;
use crate::rate_limiter::{IopubRateLimiter, RateVerdict};
use crate::supervisor::{ChannelStream, KernelSupervisor, RestartCallback, RestartEvent};
use crate::ws_codec::{self, WsFrame};

/// How long to wait for the client to accept our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How many pings the client may fall behind on before we give up on it.
const MAX_MISSED_PONGS: u64 = 3;

/// A websocket connection between one client session and one kernel.
pub struct KernelRelay {
    kernel_id: String,
    session_id: String,
    handle: Arc<RelayHandle>,
    supervisor: Arc<dyn KernelSupervisor>,
    registry: Arc<ConnectionRegistry>,
    config: RelayConfig,
}

/// The three kernel channels a relay forwards.
struct RelayStreams {
    shell: ChannelStream,
    iopub: ChannelStream,
    stdin: ChannelStream,
}

/// What the handshake produced.
struct Handshake {
    kernel: Arc<KernelRecord>,
    streams: RelayStreams,
    adapt_version: Option<String>,
}

impl KernelRelay {
    pub fn new(
        kernel_id: String,
        session_id: String,
        supervisor: Arc<dyn KernelSupervisor>,
        registry: Arc<ConnectionRegistry>,
        config: RelayConfig,
    ) -> Self {
        let handle = Arc::new(RelayHandle::new(SessionKey::new(&kernel_id, &session_id)));
        Self {
            kernel_id,
            session_id,
            handle,
            supervisor,
            registry,
            config,
        }
    }

    /// The handle other parties use to close this relay or wait for it.
    pub fn handle(&self) -> Arc<RelayHandle> {
        self.handle.clone()
    }

    /// Run the relay over an established websocket until either side goes
    /// away, the kernel dies, or the relay is asked to close.
    pub async fn serve<S>(self, mut ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let relay_id = self.handle.connection_id.clone();
        log::info!(
            "[relay {}] Connecting session {} to kernel {}",
            relay_id,
            self.session_id,
            self.kernel_id
        );

        self.registry.register(&self.handle).await;
        self.handle.set_state(RelayState::Handshaking);

        // Restart and death notices arrive via callbacks on arbitrary
        // threads; funnel them into the select loop. They are registered
        // before the handshake so a kernel dying meanwhile is not missed.
        let (event_tx, event_rx) = async_channel::unbounded::<RestartEvent>();
        let callback: RestartCallback = Arc::new(move |event| {
            let _ = event_tx.try_send(event);
        });
        for event in [RestartEvent::Restarted, RestartEvent::Dead] {
            self.supervisor
                .add_restart_callback(&self.kernel_id, event, callback.clone());
        }

        let handshake = select! {
            handshake = self.handshake() => Some(handshake),
            _ = self.handle.close_requested() => None,
        };
        let Handshake {
            kernel,
            streams,
            adapt_version,
        } = match handshake {
            Some(Ok(handshake)) => handshake,
            Some(Err(err)) => {
                log::error!("[relay {}] Handshake failed: {}", relay_id, err);
                self.remove_callbacks(&callback);
                self.finish(&mut ws).await;
                return;
            }
            None => {
                log::info!("[relay {}] Closed during handshake", relay_id);
                self.remove_callbacks(&callback);
                self.finish(&mut ws).await;
                return;
            }
        };

        let mut session = RelaySession {
            relay_id: relay_id.clone(),
            session_id: self.session_id.clone(),
            handle: self.handle.clone(),
            streams,
            limiter: IopubRateLimiter::new(self.config.rate_limit.clone()),
            adapt_version,
            ping_interval: self.config.ping_interval,
        };

        let pending: Vec<RestartEvent> = std::iter::from_fn(|| event_rx.try_recv().ok()).collect();
        if pending.contains(&RestartEvent::Dead) {
            log::warn!("[relay {}] Kernel died during handshake", relay_id);
            session.announce(&mut ws, RestartEvent::Dead).await;
        } else {
            let connections = kernel.connection_opened();
            log::debug!(
                "[relay {}] Kernel {} now has {} connection(s)",
                relay_id,
                self.kernel_id,
                connections
            );

            self.handle.set_state(RelayState::Active);
            for event in pending {
                session.announce(&mut ws, event).await;
            }
            session.run(&mut ws, &event_rx).await;
            kernel.connection_closed();
        }

        self.handle.set_state(RelayState::Closing);
        self.remove_callbacks(&callback);
        session.streams.close();
        self.finish(&mut ws).await;
    }

    fn remove_callbacks(&self, callback: &RestartCallback) {
        for event in [RestartEvent::Restarted, RestartEvent::Dead] {
            self.supervisor
                .remove_restart_callback(&self.kernel_id, event, callback);
        }
    }

    /// Open the kernel streams and learn the kernel's protocol version.
    async fn handshake(&self) -> Result<Handshake, KRError> {
        let kernel = self
            .supervisor
            .get_kernel(&self.kernel_id)
            .ok_or_else(|| KRError::KernelNotFound(self.kernel_id.clone()))?;

        let identity = Some(self.session_id.as_str());
        let streams = RelayStreams {
            shell: self
                .supervisor
                .connect_channel(&self.kernel_id, JupyterChannel::Shell, identity)
                .await?,
            iopub: self
                .supervisor
                .connect_channel(&self.kernel_id, JupyterChannel::IOPub, identity)
                .await?,
            stdin: self
                .supervisor
                .connect_channel(&self.kernel_id, JupyterChannel::Stdin, identity)
                .await?,
        };

        let info = self.request_kernel_info(&kernel).await;
        let adapt_version = match KernelInfoReply::from_content(&info) {
            Some(reply) if reply.protocol_version != PROTOCOL_VERSION => {
                log::info!(
                    "[relay {}] Kernel {} speaks protocol {}; adapting messages from {}",
                    self.handle.connection_id,
                    self.kernel_id,
                    reply.protocol_version,
                    PROTOCOL_VERSION
                );
                Some(reply.protocol_version)
            }
            Some(_) => None,
            None => {
                log::warn!(
                    "[relay {}] No usable kernel info from kernel {}; assuming protocol {}",
                    self.handle.connection_id,
                    self.kernel_id,
                    PROTOCOL_VERSION
                );
                None
            }
        };

        Ok(Handshake {
            kernel,
            streams,
            adapt_version,
        })
    }

    /// Ask the kernel for its info, joining any request already in flight.
    /// Yields an empty object if the kernel does not answer in time.
    async fn request_kernel_info(&self, kernel: &KernelRecord) -> Value {
        let supervisor = self.supervisor.clone();
        let kernel_id = self.kernel_id.clone();
        let session_id = self.session_id.clone();
        let timeout = self.config.kernel_info_timeout;
        let pending = kernel.kernel_info(move || {
            async move {
                let request = fetch_kernel_info(supervisor.as_ref(), &kernel_id, &session_id);
                match tokio::time::timeout(timeout, request).await {
                    Ok(Ok(content)) => content,
                    Ok(Err(err)) => {
                        log::warn!("[kernel {}] kernel_info request failed: {}", kernel_id, err);
                        json!({})
                    }
                    Err(_) => {
                        log::warn!(
                            "[kernel {}] Timed out after {:?} waiting for kernel_info_reply",
                            kernel_id,
                            timeout
                        );
                        json!({})
                    }
                }
            }
            .boxed()
        });
        pending.await
    }

    async fn finish<S>(&self, ws: &mut WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.handle.set_state(RelayState::Closing);
        self.registry.unregister(&self.handle);
        match tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::debug!(
                "[relay {}] Websocket already gone: {}",
                self.handle.connection_id,
                err
            ),
            Err(_) => log::debug!(
                "[relay {}] Timed out closing websocket",
                self.handle.connection_id
            ),
        }
        self.handle.mark_closed();
        log::info!(
            "[relay {}] Disconnected session {} from kernel {}",
            self.handle.connection_id,
            self.session_id,
            self.kernel_id
        );
    }
}

/// Send a kernel_info_request on a dedicated shell stream and wait for the
/// reply's content.
async fn fetch_kernel_info(
    supervisor: &dyn KernelSupervisor,
    kernel_id: &str,
    session_id: &str,
) -> Result<Value, KRError> {
    let stream = supervisor
        .connect_channel(kernel_id, JupyterChannel::Shell, None)
        .await?;
    let request = JupyterMessage::new(
        JupyterMessageHeader::new(new_msg_id(), "kernel_info_request", session_id),
        json!({}),
    );
    let request_id = request.header.msg_id.clone();
    stream
        .send(request)
        .await
        .map_err(|_| KRError::ChannelClosed(kernel_id.to_string(), JupyterChannel::Shell))?;

    while let Some(reply) = stream.recv().await {
        let answers_request = reply
            .parent_header
            .as_ref()
            .map(|parent| parent.msg_id == request_id)
            .unwrap_or(true);
        if reply.header.msg_type == "kernel_info_reply" && answers_request {
            return Ok(reply.content);
        }
        log::trace!(
            "[kernel {}] Ignoring {} while waiting for kernel_info_reply",
            kernel_id,
            reply.header.msg_type
        );
    }
    Err(KRError::ChannelClosed(
        kernel_id.to_string(),
        JupyterChannel::Shell,
    ))
}

fn new_msg_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl RelayStreams {
    fn close(&self) {
        self.shell.close();
        self.iopub.close();
        self.stdin.close();
    }
}

/// The active phase of a relay.
struct RelaySession {
    relay_id: String,
    session_id: String,
    handle: Arc<RelayHandle>,
    streams: RelayStreams,
    limiter: IopubRateLimiter,
    adapt_version: Option<String>,
    ping_interval: Option<Duration>,
}

impl RelaySession {
    async fn run<S>(
        &mut self,
        ws: &mut WebSocketStream<S>,
        events: &async_channel::Receiver<RestartEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let pinging = self.ping_interval.is_some();
        let mut tick =
            tokio::time::interval(self.ping_interval.unwrap_or(Duration::from_secs(3600)));
        let mut ping_outbound: u64 = 0;
        let mut pong_inbound: u64 = 0;
        let handle = self.handle.clone();
        let relay_id = self.relay_id.clone();

        loop {
            select! {
                from_socket = ws.next() => {
                    let message = match from_socket {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            log::error!("[relay {}] Failed to read data from websocket: {}", relay_id, e);
                            break;
                        }
                        None => {
                            log::info!("[relay {}] No data from websocket; closing", relay_id);
                            break;
                        }
                    };
                    match message {
                        Message::Text(data) => {
                            self.handle_client_frame(WsFrame::Text(data)).await;
                        },
                        Message::Binary(data) => {
                            self.handle_client_frame(WsFrame::Binary(data)).await;
                        },
                        Message::Ping(data) => {
                            // Tungstenite answers pings itself
                            log::trace!("[relay {}] Got ping from websocket ({} bytes)", relay_id, data.len());
                        },
                        Message::Pong(data) => {
                            let Ok(counter) = <[u8; 8]>::try_from(data.as_slice()) else {
                                log::warn!("[relay {}] Got pong with invalid data size ({} bytes); ignoring", relay_id, data.len());
                                continue;
                            };
                            let last_pong = pong_inbound;
                            pong_inbound = u64::from_be_bytes(counter);
                            if pong_inbound != last_pong + 1 {
                                log::warn!("[relay {}] Got pong {} from websocket; expected {}", relay_id, pong_inbound, last_pong + 1);
                            }
                        },
                        Message::Frame(_) => {},
                        Message::Close(_) => {
                            log::info!("[relay {}] Websocket closed by client", relay_id);
                            break;
                        },
                    }
                },
                msg = self.streams.shell.recv() => {
                    if !self.forward_from_kernel(ws, JupyterChannel::Shell, msg).await {
                        self.flush_events(ws, events).await;
                        break;
                    }
                },
                msg = self.streams.iopub.recv() => {
                    if !self.forward_from_kernel(ws, JupyterChannel::IOPub, msg).await {
                        self.flush_events(ws, events).await;
                        break;
                    }
                },
                msg = self.streams.stdin.recv() => {
                    if !self.forward_from_kernel(ws, JupyterChannel::Stdin, msg).await {
                        self.flush_events(ws, events).await;
                        break;
                    }
                },
                event = events.recv() => {
                    let Ok(event) = event else {
                        log::debug!("[relay {}] Kernel event source gone; closing", relay_id);
                        break;
                    };
                    if !self.announce(ws, event).await {
                        break;
                    }
                },
                _ = handle.close_requested() => {
                    log::info!("[relay {}] Closing on request", relay_id);
                    break;
                },
                _ = tick.tick(), if pinging => {
                    let diff = ping_outbound.saturating_sub(pong_inbound);
                    if diff > MAX_MISSED_PONGS {
                        log::warn!("[relay {}] Lost connection with client; websocket pong counter is behind by {} pings", relay_id, diff);
                        break;
                    }
                    ping_outbound += 1;
                    let ping_data = ping_outbound.to_be_bytes().to_vec();
                    if let Err(e) = ws.send(Message::Ping(ping_data)).await {
                        log::error!("[relay {}] Failed to send ping to websocket: {}", relay_id, e);
                        break;
                    }
                }
            }
        }
    }

    /// Tell the client about a kernel lifecycle event. Returns `false` if the
    /// relay should close.
    async fn announce<S>(&mut self, ws: &mut WebSocketStream<S>, event: RestartEvent) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match event {
            RestartEvent::Restarted => {
                log::info!("[relay {}] Kernel restarted", self.relay_id);
                let status = self.status_message(ExecutionState::Restarting);
                self.write(ws, JupyterChannel::IOPub, status).await;
                true
            }
            RestartEvent::Dead => {
                log::warn!("[relay {}] Kernel died; closing", self.relay_id);
                let status = self.status_message(ExecutionState::Dead);
                self.write(ws, JupyterChannel::IOPub, status).await;
                false
            }
        }
    }

    /// Deliver lifecycle events already queued when a kernel stream ends; a
    /// restart ends the streams right after announcing itself.
    async fn flush_events<S>(
        &mut self,
        ws: &mut WebSocketStream<S>,
        events: &async_channel::Receiver<RestartEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Ok(event) = events.try_recv() {
            if !self.announce(ws, event).await {
                break;
            }
        }
    }

    /// Route a frame from the client to the kernel channel it names.
    async fn handle_client_frame(&mut self, frame: WsFrame) {
        let mut msg = match ws_codec::deserialize(frame) {
            Ok(msg) => msg,
            Err(err) => {
                log::error!(
                    "[relay {}] Dropping undecodable client message: {}",
                    self.relay_id,
                    err
                );
                return;
            }
        };

        let channel = match msg.known_channel() {
            None => {
                log::warn!(
                    "[relay {}] No channel specified on message {}; assuming shell",
                    self.relay_id,
                    msg.header.msg_id
                );
                JupyterChannel::Shell
            }
            Some(Ok(channel)) => channel,
            Some(Err(err)) => {
                log::warn!(
                    "[relay {}] Dropping message {}: {}",
                    self.relay_id,
                    msg.header.msg_id,
                    err
                );
                return;
            }
        };

        let stream = match channel {
            JupyterChannel::Shell => &self.streams.shell,
            JupyterChannel::Stdin => &self.streams.stdin,
            JupyterChannel::IOPub | JupyterChannel::Control => {
                log::warn!(
                    "[relay {}] Dropping message {}: clients cannot send on {}",
                    self.relay_id,
                    msg.header.msg_id,
                    channel
                );
                return;
            }
        };

        if let Some(version) = &self.adapt_version {
            msg.header.version = version.clone();
        }
        msg.channel = None;

        log::debug!(
            "[relay {}] Client sent {} ({}) on {}",
            self.relay_id,
            msg.header.msg_type,
            msg.header.msg_id,
            channel
        );
        if stream.send(msg).await.is_err() {
            log::warn!(
                "[relay {}] Kernel {} stream is closed; dropping message",
                self.relay_id,
                channel
            );
        }
    }

    /// Forward a message from a kernel stream to the client. Returns `false`
    /// if the stream has ended and the relay should close.
    async fn forward_from_kernel<S>(
        &mut self,
        ws: &mut WebSocketStream<S>,
        channel: JupyterChannel,
        msg: Option<JupyterMessage>,
    ) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(msg) = msg else {
            log::info!(
                "[relay {}] Kernel {} stream ended; closing",
                self.relay_id,
                channel
            );
            return false;
        };

        let frame = match ws_codec::serialize(&msg, channel) {
            Ok(frame) => frame,
            Err(err) => {
                log::error!(
                    "[relay {}] Failed to encode {} message {}: {}",
                    self.relay_id,
                    channel,
                    msg.header.msg_id,
                    err
                );
                return true;
            }
        };

        if channel == JupyterChannel::IOPub {
            let verdict = self
                .limiter
                .check(&msg.header.msg_type, frame.len(), Instant::now());
            if let RateVerdict::Suppress { notices } = verdict {
                for notice in notices {
                    let stderr = self.stderr_message(notice, msg.parent_header.clone());
                    self.write(ws, JupyterChannel::IOPub, stderr).await;
                }
                log::trace!(
                    "[relay {}] Suppressed iopub {} ({} bytes)",
                    self.relay_id,
                    msg.header.msg_type,
                    frame.len()
                );
                return true;
            }
        }

        self.write_frame(ws, frame).await;
        true
    }

    /// Encode and send a message the relay itself produced.
    async fn write<S>(
        &mut self,
        ws: &mut WebSocketStream<S>,
        channel: JupyterChannel,
        msg: JupyterMessage,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match ws_codec::serialize(&msg, channel) {
            Ok(frame) => self.write_frame(ws, frame).await,
            Err(err) => log::error!(
                "[relay {}] Failed to encode {}: {}",
                self.relay_id,
                msg.header.msg_type,
                err
            ),
        }
    }

    async fn write_frame<S>(&mut self, ws: &mut WebSocketStream<S>, frame: WsFrame)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // A client that has gone away is noticed by the read side; writes to
        // it are simply dropped.
        if let Err(err) = ws.send(frame.into()).await {
            log::debug!(
                "[relay {}] Dropping message for closed websocket: {}",
                self.relay_id,
                err
            );
        }
    }

    fn status_message(&self, state: ExecutionState) -> JupyterMessage {
        JupyterMessage::new(
            JupyterMessageHeader::new(new_msg_id(), "status", &self.session_id),
            json!({ "execution_state": state.as_str() }),
        )
    }

    fn stderr_message(&self, text: String, parent: Option<JupyterMessageHeader>) -> JupyterMessage {
        let mut msg = JupyterMessage::new(
            JupyterMessageHeader::new(new_msg_id(), "stream", &self.session_id),
            json!({ "name": "stderr", "text": text }),
        );
        msg.parent_header = parent;
        msg
    }
}
