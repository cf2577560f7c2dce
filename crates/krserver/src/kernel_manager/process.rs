//
// process.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Kernel child processes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio::select;
use tokio::sync::oneshot;

use crate::signal::OnceSignal;

/// A running (or exited) kernel process.
pub struct KernelProcess {
    pub pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: Arc<OnceSignal>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl KernelProcess {
    /// Start a kernel process. `on_exit` is called with the exit code (if
    /// any) once the process has exited, for whatever reason.
    pub fn spawn<F>(
        kernel_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
        on_exit: F,
    ) -> Result<Self, anyhow::Error>
    where
        F: FnOnce(Option<i32>) + Send + 'static,
    {
        let Some((program, args)) = argv.split_first() else {
            anyhow::bail!("Kernel command line is empty");
        };
        log::debug!("[kernel {}] Starting kernel: {:?}", kernel_id, argv);

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            stream_output(kernel_id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            stream_output(kernel_id.to_string(), "stderr", stderr);
        }

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let exited = Arc::new(OnceSignal::new());
        let exit_code = Arc::new(Mutex::new(None));

        let kernel_id = kernel_id.to_string();
        let exited_signal = exited.clone();
        let exit_slot = exit_code.clone();
        tokio::spawn(async move {
            let status = select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    log::info!("[kernel {}] Killing kernel process", kernel_id);
                    if let Err(err) = child.start_kill() {
                        log::warn!("[kernel {}] Failed to kill kernel process: {}", kernel_id, err);
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => {
                    log::info!("[kernel {}] Kernel process exited with status: {}", kernel_id, status);
                    status.code()
                }
                Err(err) => {
                    log::error!("[kernel {}] Failed to wait on kernel process: {}", kernel_id, err);
                    None
                }
            };
            *exit_slot.lock().unwrap_or_else(PoisonError::into_inner) = code;
            exited_signal.fire();
            on_exit(code);
        });

        Ok(Self {
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
            exited,
            exit_code,
        })
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_fired()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Kill the process. Does nothing if it has already been killed.
    pub fn kill(&self) {
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
    }

    pub async fn wait(&self) {
        self.exited.wait().await
    }

    /// Wait up to `timeout` for the process to exit. Returns whether it did.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.exited.wait()).await.is_ok()
    }
}

/// Copy a kernel's standard stream into the log, line by line.
fn stream_output<T>(kernel_id: String, kind: &'static str, stream: T)
where
    T: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stream);
        let mut buffer = String::new();
        loop {
            buffer.clear();
            match reader.read_line(&mut buffer).await {
                Ok(0) => {
                    log::debug!("[kernel {}] End of {}", kernel_id, kind);
                    break;
                }
                Ok(_) => {
                    log::debug!("[kernel {}] {}: {}", kernel_id, kind, buffer.trim_end());
                }
                Err(err) => {
                    log::error!("[kernel {}] Failed to read {}: {}", kernel_id, kind, err);
                    break;
                }
            }
        }
    });
}
