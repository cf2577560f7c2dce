//
// mod.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use krserver::config::{RateLimitConfig, RelayConfig};
use krserver::connection_registry::{ConnectionRegistry, RelayHandle, RelayState};
use krserver::error::KRError;
use krserver::kernel_record::KernelRecord;
use krserver::kernel_relay::KernelRelay;
use krserver::supervisor::{ChannelEndpoint, ChannelStream, KernelSupervisor, RestartEvent};
use krshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use krshared::kernel_model::{ExecutionState, KernelModel};
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type TestSocket = WebSocketStream<DuplexStream>;

/// How long tests wait for something that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(5);

/// A channel opened on the fake supervisor.
#[derive(Clone)]
pub struct OpenedChannel {
    pub kernel_id: String,
    pub channel: JupyterChannel,
    pub identity: Option<String>,
    pub endpoint: ChannelEndpoint,
}

/// A supervisor whose kernels are nothing but in-memory channel endpoints.
///
/// Shell streams opened without an identity answer `kernel_info_request`
/// with the configured content; every other stream is recorded so the test
/// can play the kernel's part on it.
pub struct FakeSupervisor {
    kernels: Mutex<HashMap<String, Arc<KernelRecord>>>,
    opened: Mutex<Vec<OpenedChannel>>,
    kernel_info: Mutex<Option<Value>>,
    kernel_info_delay: Mutex<Duration>,
    pub kernel_info_requests: AtomicUsize,
    pub shutdowns: Mutex<Vec<String>>,
    pub interrupts: Mutex<Vec<String>>,
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kernels: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            kernel_info: Mutex::new(Some(kernel_info_content("5.3"))),
            kernel_info_delay: Mutex::new(Duration::ZERO),
            kernel_info_requests: AtomicUsize::new(0),
            shutdowns: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
        })
    }

    /// Track a kernel with the given ID and return its record.
    pub fn add_kernel(&self, kernel_id: &str) -> Arc<KernelRecord> {
        let record = Arc::new(KernelRecord::new(kernel_id.to_string(), "fake".to_string()));
        record.set_execution_state(ExecutionState::Idle, "test");
        self.kernels
            .lock()
            .unwrap()
            .insert(kernel_id.to_string(), record.clone());
        record
    }

    /// Set what the kernel answers to `kernel_info_request`; `None` leaves
    /// requests unanswered.
    pub fn set_kernel_info(&self, content: Option<Value>) {
        *self.kernel_info.lock().unwrap() = content;
    }

    pub fn set_kernel_info_delay(&self, delay: Duration) {
        *self.kernel_info_delay.lock().unwrap() = delay;
    }

    /// Wait for the relay for `session_id` to open `channel` on `kernel_id`,
    /// and return the kernel's end of it.
    pub async fn endpoint(
        &self,
        kernel_id: &str,
        session_id: &str,
        channel: JupyterChannel,
    ) -> ChannelEndpoint {
        let found = timeout(WAIT, async {
            loop {
                let found = self
                    .opened
                    .lock()
                    .unwrap()
                    .iter()
                    .rev()
                    .find(|opened| {
                        opened.kernel_id == kernel_id
                            && opened.channel == channel
                            && opened.identity.as_deref() == Some(session_id)
                    })
                    .map(|opened| opened.endpoint.clone());
                if let Some(endpoint) = found {
                    return endpoint;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        found.expect("relay never opened the channel")
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn answer_kernel_info(&self, endpoint: ChannelEndpoint) {
        let content = self.kernel_info.lock().unwrap().clone();
        let delay = *self.kernel_info_delay.lock().unwrap();
        self.kernel_info_requests.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            while let Ok(request) = endpoint.from_client.recv().await {
                if request.header.msg_type != "kernel_info_request" {
                    continue;
                }
                let Some(content) = content.clone() else {
                    continue;
                };
                tokio::time::sleep(delay).await;
                let mut reply = kernel_message("kernel_info_reply", content);
                reply.parent_header = Some(request.header.clone());
                let _ = endpoint.to_client.send(reply).await;
            }
        });
    }
}

#[async_trait]
impl KernelSupervisor for FakeSupervisor {
    fn get_kernel(&self, kernel_id: &str) -> Option<Arc<KernelRecord>> {
        self.kernels.lock().unwrap().get(kernel_id).cloned()
    }

    fn list_kernels(&self) -> Vec<Arc<KernelRecord>> {
        self.kernels.lock().unwrap().values().cloned().collect()
    }

    async fn connect_channel(
        &self,
        kernel_id: &str,
        channel: JupyterChannel,
        identity: Option<&str>,
    ) -> Result<ChannelStream, KRError> {
        if self.get_kernel(kernel_id).is_none() {
            return Err(KRError::KernelNotFound(kernel_id.to_string()));
        }
        let (stream, endpoint) = ChannelStream::pair(channel);
        if identity.is_none() && channel == JupyterChannel::Shell {
            self.answer_kernel_info(endpoint);
        } else {
            self.opened.lock().unwrap().push(OpenedChannel {
                kernel_id: kernel_id.to_string(),
                channel,
                identity: identity.map(str::to_string),
                endpoint,
            });
        }
        Ok(stream)
    }

    async fn start_kernel(&self, name: Option<&str>) -> Result<KernelModel, KRError> {
        if name.is_some_and(|name| name != "fake") {
            return Err(KRError::KernelSpecNotFound(name.unwrap_or_default().to_string()));
        }
        let record = self.add_kernel(&uuid::Uuid::new_v4().to_string());
        Ok(record.to_model())
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), KRError> {
        let record = self
            .kernels
            .lock()
            .unwrap()
            .remove(kernel_id)
            .ok_or_else(|| KRError::KernelNotFound(kernel_id.to_string()))?;
        record.set_execution_state(ExecutionState::Dead, "shutdown");
        self.shutdowns.lock().unwrap().push(kernel_id.to_string());
        Ok(())
    }

    async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel, KRError> {
        let record = self
            .get_kernel(kernel_id)
            .ok_or_else(|| KRError::KernelNotFound(kernel_id.to_string()))?;
        record.fire_restart_event(RestartEvent::Restarted);
        Ok(record.to_model())
    }

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), KRError> {
        if self.get_kernel(kernel_id).is_none() {
            return Err(KRError::KernelNotFound(kernel_id.to_string()));
        }
        self.interrupts.lock().unwrap().push(kernel_id.to_string());
        Ok(())
    }
}

pub fn kernel_info_content(protocol_version: &str) -> Value {
    json!({
        "status": "ok",
        "protocol_version": protocol_version,
        "implementation": "fake",
        "language_info": { "name": "python" },
        "banner": "",
        "help_links": []
    })
}

/// A message as a kernel would publish it.
pub fn kernel_message(msg_type: &str, content: Value) -> JupyterMessage {
    JupyterMessage::new(
        JupyterMessageHeader::new(uuid::Uuid::new_v4().to_string(), msg_type, "kernel-session"),
        content,
    )
}

/// The JSON a client would send for a message on `channel`.
pub fn client_message(msg_type: &str, channel: Option<&str>, content: Value) -> Value {
    let mut msg = json!({
        "header": {
            "msg_id": uuid::Uuid::new_v4().to_string(),
            "msg_type": msg_type,
            "session": "client-session",
            "username": "test",
            "date": "2025-01-01T00:00:00Z",
            "version": "5.3"
        },
        "parent_header": {},
        "metadata": {},
        "content": content
    });
    if let Some(channel) = channel {
        msg["channel"] = json!(channel);
    }
    msg
}

/// Relay settings with no keepalive pings and no rate limits.
pub fn relay_config() -> RelayConfig {
    RelayConfig {
        rate_limit: RateLimitConfig::unlimited(),
        kernel_info_timeout: Duration::from_secs(2),
        ping_interval: None,
    }
}

/// Two ends of an in-memory websocket.
pub async fn socket_pair() -> (TestSocket, TestSocket) {
    let (server, client) = tokio::io::duplex(1 << 20);
    let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
    (server, client)
}

pub struct RunningRelay {
    pub client: TestSocket,
    pub handle: Arc<RelayHandle>,
    pub task: JoinHandle<()>,
}

/// Start a relay for `session_id` on `kernel_id` and return the client end of
/// its websocket.
pub async fn start_relay(
    supervisor: Arc<FakeSupervisor>,
    registry: Arc<ConnectionRegistry>,
    kernel_id: &str,
    session_id: &str,
    config: RelayConfig,
) -> RunningRelay {
    let (server, client) = socket_pair().await;
    let relay = KernelRelay::new(
        kernel_id.to_string(),
        session_id.to_string(),
        supervisor,
        registry,
        config,
    );
    let handle = relay.handle();
    let task = tokio::spawn(relay.serve(server));
    RunningRelay {
        client,
        handle,
        task,
    }
}

/// Wait until the relay reaches `state`.
pub async fn wait_for_state(handle: &RelayHandle, state: RelayState) {
    let reached = timeout(WAIT, async {
        while handle.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "relay stuck in {:?}, expected {:?}", handle.state(), state);
}

/// Send a JSON message from the client.
pub async fn send_json(client: &mut TestSocket, msg: &Value) {
    client
        .send(Message::Text(msg.to_string()))
        .await
        .expect("failed to send client message");
}

/// Read the next data frame the relay sends to the client.
pub async fn next_frame(client: &mut TestSocket) -> Message {
    loop {
        let msg = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("websocket closed")
            .expect("websocket error");
        match msg {
            Message::Text(_) | Message::Binary(_) | Message::Close(_) => return msg,
            _ => continue,
        }
    }
}

/// Read the next text frame as JSON.
pub async fn next_json(client: &mut TestSocket) -> Value {
    match next_frame(client).await {
        Message::Text(text) => serde_json::from_str(&text).expect("relay sent invalid JSON"),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

/// Wait for the relay to close the websocket.
pub async fn expect_closed(client: &mut TestSocket) {
    let closed = timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "websocket was not closed");
}

/// Receive the next message the relay forwards to the kernel on `endpoint`.
pub async fn kernel_receives(endpoint: &ChannelEndpoint) -> JupyterMessage {
    timeout(WAIT, endpoint.from_client.recv())
        .await
        .expect("timed out waiting for the kernel to receive a message")
        .expect("stream closed")
}
