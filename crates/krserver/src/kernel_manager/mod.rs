//
// mod.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Starts, restarts, and stops kernel processes, and connects to them over
//! ZeroMQ.

mod activity;
mod channel_bridge;
mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use krshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use krshared::kernel_info::KernelInfoReply;
use krshared::kernel_model::{ExecutionState, KernelModel};
use serde_json::{json, Value};

use crate::config::ServerConfig;
use crate::connection_file::{ConnectionFile, ReservedPorts};
use crate::culler::IdleCuller;
use crate::error::KRError;
use crate::kernel_connection::KernelConnection;
use crate::kernel_record::KernelRecord;
use crate::kernel_spec::{KernelSpec, KernelSpecStore};
use crate::signal::OnceSignal;
use crate::supervisor::{ChannelStream, KernelSupervisor, RestartEvent};

use process::KernelProcess;

/// How long a kernel gets to exit on its own after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for a reply on the control channel.
const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a new kernel has to answer its first kernel_info_request.
const KERNEL_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a kernel socket to accept a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How many times in a row a crashing kernel is restarted before it is
/// declared dead.
const RESTART_LIMIT: u32 = 5;

/// A kernel that runs at least this long before exiting has its restart
/// count reset.
const STABLE_RUNTIME: Duration = Duration::from_secs(10);

/// A kernel process exit: kernel ID, launch generation, and exit code.
type ProcessExit = (String, u64, Option<i32>);

/// A kernel process and everything needed to talk to it.
struct ManagedKernel {
    record: Arc<KernelRecord>,
    spec: KernelSpec,
    connection_file: ConnectionFile,
    connection_path: PathBuf,
    connection: KernelConnection,

    /// Session ID used on messages the server itself sends the kernel
    session: String,

    process: tokio::sync::Mutex<Option<KernelProcess>>,

    /// Serializes restart, shutdown, and crash handling
    lifecycle: tokio::sync::Mutex<()>,

    /// Incremented on every launch so exits of replaced processes are ignored
    generation: AtomicU64,
    launched_at: Mutex<Instant>,
    auto_restarts: AtomicU32,
    stopping: AtomicBool,
    restarting: AtomicBool,

    /// Fires when the current process is replaced or shut down. Ends the
    /// bridges and activity watcher connected to that process, since ZeroMQ
    /// sockets here do not reconnect to a relaunched kernel.
    current_run: Mutex<Arc<OnceSignal>>,
}

impl ManagedKernel {
    fn new(
        record: Arc<KernelRecord>,
        spec: KernelSpec,
        connection_file: ConnectionFile,
        connection_path: PathBuf,
        connection: KernelConnection,
    ) -> Self {
        Self {
            record,
            spec,
            connection_file,
            connection_path,
            connection,
            session: uuid::Uuid::new_v4().to_string(),
            process: tokio::sync::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            launched_at: Mutex::new(Instant::now()),
            auto_restarts: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            current_run: Mutex::new(Arc::new(OnceSignal::new())),
        }
    }

    /// The stop signal of the current process.
    fn run_stopped(&self) -> Arc<OnceSignal> {
        self.current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Retire everything attached to the previous process and start watching
    /// the iopub socket of the one about to run. Returns the new process's
    /// stop signal.
    fn begin_run(&self) -> Arc<OnceSignal> {
        let stopped = Arc::new(OnceSignal::new());
        let previous = std::mem::replace(
            &mut *self
                .current_run
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            stopped.clone(),
        );
        previous.fire();
        activity::watch(
            self.record.clone(),
            self.connection_file.endpoint(JupyterChannel::IOPub),
            self.connection.clone(),
            stopped.clone(),
        );
        stopped
    }
}

/// Supervises kernels started from local kernel specs and reached over
/// ZeroMQ.
pub struct ZmqKernelManager {
    this: Weak<ZmqKernelManager>,
    kernels: RwLock<HashMap<String, Arc<ManagedKernel>>>,
    specs: KernelSpecStore,
    kernel_ip: String,
    runtime_dir: PathBuf,
    reserved_ports: ReservedPorts,
    culler: Arc<IdleCuller>,
    exits: async_channel::Sender<ProcessExit>,
}

impl ZmqKernelManager {
    /// Create a manager for kernels started from `specs`. Must be called
    /// from within a Tokio runtime.
    pub fn new(specs: KernelSpecStore, config: &ServerConfig) -> Result<Arc<Self>, anyhow::Error> {
        let runtime_dir = std::env::temp_dir().join("krserver");
        std::fs::create_dir_all(&runtime_dir)?;
        let kernel_ip = if config.kernel_ip.is_empty() {
            String::from("127.0.0.1")
        } else {
            config.kernel_ip.clone()
        };
        let (exits, exit_rx) = async_channel::unbounded();
        let manager = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            kernels: RwLock::new(HashMap::new()),
            specs,
            kernel_ip,
            runtime_dir,
            reserved_ports: Arc::new(RwLock::new(Vec::new())),
            culler: Arc::new(IdleCuller::new(config.cull.clone())),
            exits,
        });
        tokio::spawn(Self::watch_exits(Arc::downgrade(&manager), exit_rx));
        Ok(manager)
    }

    /// Dispatch process exits to [`ZmqKernelManager::handle_exit`] until the
    /// manager is dropped.
    async fn watch_exits(manager: Weak<Self>, exits: async_channel::Receiver<ProcessExit>) {
        while let Ok((kernel_id, generation, code)) = exits.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            tokio::spawn(manager.handle_exit(kernel_id, generation, code));
        }
        log::debug!("Kernel exit watcher stopped");
    }

    pub fn kernel_spec_names(&self) -> Vec<String> {
        self.specs.names()
    }

    fn kernel(&self, kernel_id: &str) -> Option<Arc<ManagedKernel>> {
        self.kernels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kernel_id)
            .cloned()
    }

    /// Start (or restart) the kernel's process.
    async fn launch(&self, kernel: &Arc<ManagedKernel>) -> Result<(), anyhow::Error> {
        let generation = kernel.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let argv = kernel.spec.resolve_argv(&kernel.connection_path);
        kernel.begin_run();
        let kernel_id = kernel.record.id.clone();
        let exits = self.exits.clone();
        let on_exit = move |code: Option<i32>| {
            let _ = exits.try_send((kernel_id, generation, code));
        };
        let process = KernelProcess::spawn(&kernel.record.id, &argv, &kernel.spec.env, on_exit)?;
        log::info!(
            "[kernel {}] Started kernel process (pid {:?})",
            kernel.record.id,
            process.pid
        );
        *kernel.process.lock().await = Some(process);
        *kernel
            .launched_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        Ok(())
    }

    /// React to a kernel process exiting. Exits that nobody asked for are
    /// answered with a restart, up to a limit.
    async fn handle_exit(self: Arc<Self>, kernel_id: String, generation: u64, code: Option<i32>) {
        let Some(kernel) = self.kernel(&kernel_id) else {
            return;
        };
        let _lifecycle = kernel.lifecycle.lock().await;
        if kernel.generation.load(Ordering::SeqCst) != generation
            || kernel.stopping.load(Ordering::SeqCst)
            || kernel.restarting.load(Ordering::SeqCst)
        {
            return;
        }

        let runtime = kernel
            .launched_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if runtime >= STABLE_RUNTIME {
            kernel.auto_restarts.store(0, Ordering::SeqCst);
        }
        let attempt = kernel.auto_restarts.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!(
            "[kernel {}] Kernel exited unexpectedly (code {:?}) after {:?}",
            kernel_id,
            code,
            runtime
        );

        if attempt > RESTART_LIMIT {
            log::error!(
                "[kernel {}] Kernel died {} times in a row; giving up",
                kernel_id,
                attempt - 1
            );
            self.declare_dead(&kernel, "restart limit reached");
            return;
        }

        log::info!(
            "[kernel {}] Restarting kernel (attempt {} of {})",
            kernel_id,
            attempt,
            RESTART_LIMIT
        );
        kernel
            .record
            .set_execution_state(ExecutionState::Restarting, "automatic restart");
        kernel.record.fire_restart_event(RestartEvent::Restarted);
        if let Err(err) = self.launch(&kernel).await {
            log::error!("[kernel {}] Failed to restart kernel: {}", kernel_id, err);
            self.declare_dead(&kernel, "restart failed");
        }
    }

    fn declare_dead(&self, kernel: &ManagedKernel, reason: &str) {
        kernel.run_stopped().fire();
        kernel
            .record
            .set_execution_state(ExecutionState::Dead, reason);
        kernel.record.fire_restart_event(RestartEvent::Dead);
    }

    /// Ask the kernel to shut down over the control channel and wait for its
    /// process to exit, killing it if it doesn't.
    async fn stop_process(&self, kernel: &ManagedKernel, restart: bool) {
        let Some(process) = kernel.process.lock().await.take() else {
            return;
        };
        if process.has_exited() {
            return;
        }

        let request = self
            .request_reply(
                kernel,
                JupyterChannel::Control,
                "shutdown_request",
                json!({ "restart": restart }),
                CONTROL_REPLY_TIMEOUT,
            )
            .await;
        if let Err(err) = request {
            log::warn!(
                "[kernel {}] Shutdown request failed: {}",
                kernel.record.id,
                err
            );
        }

        if !process.wait_timeout(SHUTDOWN_GRACE).await {
            log::warn!(
                "[kernel {}] Kernel did not exit within {:?}; killing it",
                kernel.record.id,
                SHUTDOWN_GRACE
            );
            process.kill();
            process.wait().await;
        }
    }

    /// Send a request on a dedicated stream and wait up to `wait` for its
    /// reply. A missing reply is not an error; some kernels never send one.
    async fn request_reply(
        &self,
        kernel: &ManagedKernel,
        channel: JupyterChannel,
        msg_type: &str,
        content: Value,
        wait: Duration,
    ) -> Result<Option<JupyterMessage>, anyhow::Error> {
        let reply_type = msg_type.replace("_request", "_reply");
        let stream = self.open_stream(kernel, channel, None).await?;
        let request = JupyterMessage::new(
            JupyterMessageHeader::new(
                uuid::Uuid::new_v4().to_string(),
                msg_type,
                &kernel.session,
            ),
            content,
        );
        let request_id = request.header.msg_id.clone();
        stream
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("control channel closed"))?;

        let reply = tokio::time::timeout(wait, async {
            while let Some(reply) = stream.recv().await {
                let answers = reply
                    .parent_header
                    .as_ref()
                    .map(|parent| parent.msg_id == request_id)
                    .unwrap_or(false);
                if answers && reply.header.msg_type == reply_type {
                    return Some(reply);
                }
            }
            None
        })
        .await
        .unwrap_or_else(|_| {
            log::debug!(
                "[kernel {}] No {} within {:?}",
                kernel.record.id,
                reply_type,
                wait
            );
            None
        });
        Ok(reply)
    }

    async fn open_stream(
        &self,
        kernel: &ManagedKernel,
        channel: JupyterChannel,
        identity: Option<&str>,
    ) -> Result<ChannelStream, anyhow::Error> {
        let connect = channel_bridge::connect(
            &kernel.connection_file,
            channel,
            identity,
            kernel.connection.clone(),
            kernel.run_stopped(),
        );
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "timed out after {:?} connecting to {}",
                CONNECT_TIMEOUT,
                kernel.connection_file.endpoint(channel)
            )),
        }
    }

    /// Wait for a newly started kernel to answer a kernel_info_request. A
    /// kernel that stays silent is still handed out; it may just be slow.
    async fn wait_for_ready(&self, kernel: &ManagedKernel) {
        let reply = self
            .request_reply(
                kernel,
                JupyterChannel::Shell,
                "kernel_info_request",
                json!({}),
                KERNEL_READY_TIMEOUT,
            )
            .await;
        match reply {
            Ok(Some(reply)) => {
                match KernelInfoReply::from_content(&reply.content) {
                    Some(info) => log::info!(
                        "[kernel {}] Kernel is ready ({}, protocol {})",
                        kernel.record.id,
                        info.language(),
                        info.protocol_version
                    ),
                    None => log::info!("[kernel {}] Kernel is ready", kernel.record.id),
                }
            }
            Ok(None) => log::warn!(
                "[kernel {}] No kernel_info_reply within {:?}",
                kernel.record.id,
                KERNEL_READY_TIMEOUT
            ),
            Err(err) => log::warn!(
                "[kernel {}] Could not ask kernel for its info: {}",
                kernel.record.id,
                err
            ),
        }
    }

    /// Remove the kernel's connection file and return its ports.
    fn release(&self, kernel: &ManagedKernel) {
        kernel.connection_file.release_ports(&self.reserved_ports);
        if let Err(err) = std::fs::remove_file(&kernel.connection_path) {
            log::debug!(
                "[kernel {}] Could not remove {}: {}",
                kernel.record.id,
                kernel.connection_path.display(),
                err
            );
        }
    }

    /// Shut down every kernel; used when the server exits.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self
            .kernels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for id in ids {
            if let Err(err) = self.shutdown_kernel(&id).await {
                err.log();
            }
        }
    }
}

#[async_trait]
impl KernelSupervisor for ZmqKernelManager {
    fn get_kernel(&self, kernel_id: &str) -> Option<Arc<KernelRecord>> {
        self.kernel(kernel_id).map(|kernel| kernel.record.clone())
    }

    fn list_kernels(&self) -> Vec<Arc<KernelRecord>> {
        self.kernels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|kernel| kernel.record.clone())
            .collect()
    }

    async fn connect_channel(
        &self,
        kernel_id: &str,
        channel: JupyterChannel,
        identity: Option<&str>,
    ) -> Result<ChannelStream, KRError> {
        let kernel = self
            .kernel(kernel_id)
            .ok_or_else(|| KRError::KernelNotFound(kernel_id.to_string()))?;
        self.open_stream(&kernel, channel, identity)
            .await
            .map_err(|err| KRError::ChannelConnectFailed(kernel_id.to_string(), channel, err))
    }

    async fn start_kernel(&self, name: Option<&str>) -> Result<KernelModel, KRError> {
        let name = name
            .map(str::to_string)
            .or_else(|| self.specs.default_name())
            .ok_or_else(|| {
                KRError::BadRequest(String::from(
                    "No kernel name given and no default kernel spec",
                ))
            })?;
        let spec = self
            .specs
            .get(&name)
            .cloned()
            .ok_or_else(|| KRError::KernelSpecNotFound(name.clone()))?;

        let kernel_id = uuid::Uuid::new_v4().to_string();
        let connection_file = ConnectionFile::generate(self.kernel_ip.clone(), &self.reserved_ports)
            .map_err(|err| KRError::KernelStartFailed(name.clone(), err))?;
        let connection_path = self.runtime_dir.join(format!("kernel-{}.json", kernel_id));
        let connection = KernelConnection::new(&kernel_id, &connection_file.key)
            .map_err(|err| KRError::KernelStartFailed(name.clone(), err))?;

        let kernel = Arc::new(ManagedKernel::new(
            Arc::new(KernelRecord::new(kernel_id.clone(), name.clone())),
            spec,
            connection_file,
            connection_path,
            connection,
        ));

        let launched = match kernel.connection_file.to_file(&kernel.connection_path) {
            Ok(()) => self.launch(&kernel).await,
            Err(err) => Err(err),
        };
        if let Err(err) = launched {
            kernel.run_stopped().fire();
            self.release(&kernel);
            return Err(KRError::KernelStartFailed(name, err));
        }

        self.kernels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kernel_id.clone(), kernel.clone());
        log::info!("[kernel {}] Started '{}' kernel", kernel_id, name);
        self.wait_for_ready(&kernel).await;

        let supervisor: Weak<dyn KernelSupervisor> = self.this.clone();
        self.culler.ensure_started(supervisor);

        Ok(kernel.record.to_model())
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), KRError> {
        let kernel = self
            .kernel(kernel_id)
            .ok_or_else(|| KRError::KernelNotFound(kernel_id.to_string()))?;
        let _lifecycle = kernel.lifecycle.lock().await;
        if kernel.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("[kernel {}] Shutting down kernel", kernel_id);

        self.stop_process(&kernel, false).await;
        kernel.run_stopped().fire();
        kernel
            .record
            .set_execution_state(ExecutionState::Dead, "shut down");
        self.kernels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kernel_id);
        self.release(&kernel);
        Ok(())
    }

    async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel, KRError> {
        let kernel = self
            .kernel(kernel_id)
            .ok_or_else(|| KRError::KernelNotFound(kernel_id.to_string()))?;
        let _lifecycle = kernel.lifecycle.lock().await;
        if kernel.record.execution_state() == ExecutionState::Dead {
            return Err(KRError::RestartFailed(
                kernel_id.to_string(),
                anyhow::anyhow!("kernel is dead"),
            ));
        }

        log::info!("[kernel {}] Restarting kernel on request", kernel_id);
        kernel.restarting.store(true, Ordering::SeqCst);
        kernel
            .record
            .set_execution_state(ExecutionState::Restarting, "restart requested");
        self.stop_process(&kernel, true).await;
        // Relays hear about the restart before their streams to the old
        // process end
        kernel.record.fire_restart_event(RestartEvent::Restarted);
        let launched = self.launch(&kernel).await;
        kernel.restarting.store(false, Ordering::SeqCst);

        match launched {
            Ok(()) => {
                kernel.auto_restarts.store(0, Ordering::SeqCst);
                Ok(kernel.record.to_model())
            }
            Err(err) => {
                self.declare_dead(&kernel, "restart failed");
                Err(KRError::RestartFailed(kernel_id.to_string(), err))
            }
        }
    }

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), KRError> {
        let kernel = self
            .kernel(kernel_id)
            .ok_or_else(|| KRError::KernelNotFound(kernel_id.to_string()))?;
        if let Some(mode) = &kernel.spec.interrupt_mode {
            if mode != "message" {
                log::debug!(
                    "[kernel {}] Interrupt mode '{}' unsupported; interrupting by message",
                    kernel_id,
                    mode
                );
            }
        }
        let reply = self
            .request_reply(
                &kernel,
                JupyterChannel::Control,
                "interrupt_request",
                json!({}),
                CONTROL_REPLY_TIMEOUT,
            )
            .await
            .map_err(|err| KRError::InterruptFailed(kernel_id.to_string(), err))?;
        if reply.is_none() {
            log::warn!("[kernel {}] Kernel did not acknowledge interrupt", kernel_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_message::WireMessage;
    use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

    const WAIT: Duration = Duration::from_secs(10);

    fn managed_kernel() -> ManagedKernel {
        let reserved = ReservedPorts::default();
        let connection_file = ConnectionFile::generate("127.0.0.1".to_string(), &reserved).unwrap();
        let connection = KernelConnection::new("k1", &connection_file.key).unwrap();
        let spec = KernelSpec {
            argv: vec!["kernel".to_string()],
            display_name: "Test".to_string(),
            language: "test".to_string(),
            env: HashMap::new(),
            interrupt_mode: None,
        };
        ManagedKernel::new(
            Arc::new(KernelRecord::new("k1".to_string(), "test".to_string())),
            spec,
            connection_file,
            PathBuf::from("kernel-k1.json"),
            connection,
        )
    }

    /// Bind a publisher standing in for the kernel's iopub socket. The port
    /// may take a moment to free up after a previous publisher closes.
    async fn bind_publisher(address: &str) -> PubSocket {
        let bound = tokio::time::timeout(WAIT, async {
            loop {
                let mut publisher = PubSocket::new();
                match publisher.bind(address).await {
                    Ok(_) => return publisher,
                    Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        })
        .await;
        bound.expect("could not bind publisher")
    }

    fn status(connection: &KernelConnection, execution_state: &str) -> ZmqMessage {
        let header =
            JupyterMessageHeader::new(uuid::Uuid::new_v4().to_string(), "status", "kernel");
        let msg = JupyterMessage::new(header, json!({ "execution_state": execution_state }));
        WireMessage::from_jupyter(msg, connection)
            .and_then(ZmqMessage::try_from)
            .unwrap()
    }

    /// Keep publishing a status until `done` holds. Subscribers miss whatever
    /// is published before their subscription lands.
    async fn publish_until<F>(
        publisher: &mut PubSocket,
        connection: &KernelConnection,
        execution_state: &str,
        done: F,
    ) where
        F: Fn() -> bool,
    {
        let published = tokio::time::timeout(WAIT, async {
            while !done() {
                let _ = publisher.send(status(connection, execution_state)).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(published.is_ok(), "'{}' status never observed", execution_state);
    }

    /// Keep publishing a status until it comes out of `stream`.
    async fn publish_until_received(
        publisher: &mut PubSocket,
        connection: &KernelConnection,
        execution_state: &str,
        stream: &ChannelStream,
    ) -> JupyterMessage {
        let received = tokio::time::timeout(WAIT, async {
            loop {
                let _ = publisher.send(status(connection, execution_state)).await;
                let next = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await;
                if let Ok(Some(msg)) = next {
                    return msg;
                }
            }
        })
        .await;
        received.expect("bridge delivered nothing")
    }

    #[tokio::test]
    async fn test_activity_tracking_survives_relaunch() {
        let kernel = managed_kernel();
        let address = kernel.connection_file.endpoint(JupyterChannel::IOPub);

        let first_run = kernel.begin_run();
        let mut publisher = bind_publisher(&address).await;
        publish_until(&mut publisher, &kernel.connection, "busy", || {
            kernel.record.execution_state() == ExecutionState::Busy
        })
        .await;
        let first_seen = kernel.record.last_activity().unwrap();

        // Relaunch on the same port
        publisher.close().await;
        let second_run = kernel.begin_run();
        assert!(first_run.is_fired());
        assert!(!second_run.is_fired());

        let mut publisher = bind_publisher(&address).await;
        publish_until(&mut publisher, &kernel.connection, "idle", || {
            kernel.record.execution_state() == ExecutionState::Idle
        })
        .await;
        assert!(kernel.record.last_activity().unwrap() >= first_seen);

        second_run.fire();
    }

    #[tokio::test]
    async fn test_relaunch_ends_old_bridges_and_new_ones_deliver() {
        let kernel = managed_kernel();
        let address = kernel.connection_file.endpoint(JupyterChannel::IOPub);

        let first_run = kernel.begin_run();
        let mut publisher = bind_publisher(&address).await;
        let old_stream = channel_bridge::connect(
            &kernel.connection_file,
            JupyterChannel::IOPub,
            Some("s1"),
            kernel.connection.clone(),
            kernel.run_stopped(),
        )
        .await
        .unwrap();
        let msg = publish_until_received(&mut publisher, &kernel.connection, "busy", &old_stream)
            .await;
        assert_eq!(msg.content["execution_state"], "busy");

        publisher.close().await;
        let second_run = kernel.begin_run();
        assert!(first_run.is_fired());

        // The bridge to the replaced process ends instead of going quiet
        let ended = tokio::time::timeout(WAIT, async {
            while old_stream.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "bridge to the old process stayed open");

        let mut publisher = bind_publisher(&address).await;
        let new_stream = channel_bridge::connect(
            &kernel.connection_file,
            JupyterChannel::IOPub,
            Some("s1"),
            kernel.connection.clone(),
            kernel.run_stopped(),
        )
        .await
        .unwrap();
        let msg = publish_until_received(&mut publisher, &kernel.connection, "idle", &new_stream)
            .await;
        assert_eq!(msg.content["execution_state"], "idle");

        second_run.fire();
        let ended = tokio::time::timeout(WAIT, async {
            while new_stream.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
    }
}
