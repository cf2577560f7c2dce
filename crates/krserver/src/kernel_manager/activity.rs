//
// activity.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::Arc;

use krshared::jupyter_message::JupyterChannel;
use tokio::select;
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::kernel_connection::KernelConnection;
use crate::kernel_record::KernelRecord;
use crate::signal::OnceSignal;
use crate::wire_message::WireMessage;

/// Watch a kernel's iopub socket and keep its record's activity time and
/// execution state current, until `stopped` fires.
pub fn watch(
    record: Arc<KernelRecord>,
    address: String,
    connection: KernelConnection,
    stopped: Arc<OnceSignal>,
) {
    tokio::spawn(async move {
        let mut socket = SubSocket::new();
        let connected = select! {
            result = socket.connect(&address) => result,
            _ = stopped.wait() => return,
        };
        if let Err(err) = connected {
            log::error!("[kernel {}] Failed to watch {} for activity: {}", record.id, address, err);
            return;
        }
        if let Err(err) = socket.subscribe("").await {
            log::error!("[kernel {}] Failed to subscribe to {}: {}", record.id, JupyterChannel::IOPub, err);
            return;
        }
        log::debug!("[kernel {}] Watching {} for activity", record.id, address);

        loop {
            select! {
                incoming = socket.recv() => {
                    let msg = match incoming {
                        Ok(msg) => msg,
                        Err(err) => {
                            log::warn!("[kernel {}] Activity watcher stopped: {}", record.id, err);
                            break;
                        }
                    };
                    match WireMessage::from_zmq(msg).and_then(|wire| wire.to_jupyter(&connection)) {
                        Ok(msg) => record.observe_iopub(&msg),
                        Err(err) => log::debug!("[kernel {}] Ignoring unreadable iopub message: {}", record.id, err),
                    }
                },
                _ = stopped.wait() => break,
            }
        }
    });
}
