//
// channel_bridge.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Bridges kernel ZeroMQ sockets to in-process channel streams.

use std::str::FromStr;
use std::sync::Arc;

use krshared::jupyter_message::JupyterChannel;
use tokio::select;
use zeromq::{
    util::PeerIdentity, DealerSocket, Socket, SocketOptions, SocketRecv, SocketSend, SubSocket,
    ZmqMessage,
};

use crate::connection_file::ConnectionFile;
use crate::kernel_connection::KernelConnection;
use crate::signal::OnceSignal;
use crate::supervisor::{ChannelEndpoint, ChannelStream};
use crate::wire_message::WireMessage;

/// Connect to one of a kernel's sockets and return a stream carrying its
/// messages. The bridge runs until the stream is closed, the socket fails, or
/// `stopped` fires.
pub async fn connect(
    connection_file: &ConnectionFile,
    channel: JupyterChannel,
    identity: Option<&str>,
    connection: KernelConnection,
    stopped: Arc<OnceSignal>,
) -> Result<ChannelStream, anyhow::Error> {
    let address = connection_file.endpoint(channel);
    let (stream, endpoint) = ChannelStream::pair(channel);

    match channel {
        JupyterChannel::IOPub => {
            let mut socket = SubSocket::new();
            socket.connect(&address).await?;
            socket.subscribe("").await?;
            log::trace!(
                "[kernel {}] Connected to iopub socket at {}",
                connection.kernel_id,
                address
            );
            tokio::spawn(run_subscriber(socket, endpoint, connection, stopped));
        }
        _ => {
            let mut socket = match identity {
                Some(identity) => DealerSocket::with_options(dealer_peer_opts(identity)?),
                None => DealerSocket::new(),
            };
            socket.connect(&address).await?;
            log::trace!(
                "[kernel {}] Connected to {} socket at {}",
                connection.kernel_id,
                channel,
                address
            );
            tokio::spawn(run_dealer(socket, endpoint, connection, stopped));
        }
    }

    Ok(stream)
}

/// Socket options that set a DEALER socket's routing identity.
fn dealer_peer_opts(identity: &str) -> Result<SocketOptions, anyhow::Error> {
    let peer_id = PeerIdentity::from_str(identity)
        .map_err(|err| anyhow::anyhow!("Invalid socket identity '{}': {}", identity, err))?;
    let mut peer_opts = SocketOptions::default();
    peer_opts.peer_identity(peer_id);
    Ok(peer_opts)
}

async fn run_dealer(
    mut socket: DealerSocket,
    endpoint: ChannelEndpoint,
    connection: KernelConnection,
    stopped: Arc<OnceSignal>,
) {
    let channel = endpoint.channel;
    loop {
        select! {
            incoming = socket.recv() => {
                match incoming {
                    Ok(msg) => {
                        if !deliver(&endpoint, &connection, msg).await {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("[kernel {}] Failed to read from {} socket: {}", connection.kernel_id, channel, err);
                        break;
                    }
                }
            },
            outgoing = endpoint.from_client.recv() => {
                let Ok(msg) = outgoing else {
                    // The stream's owner closed it
                    break;
                };
                let msg_type = msg.header.msg_type.clone();
                let zmq = WireMessage::from_jupyter(msg, &connection)
                    .and_then(ZmqMessage::try_from);
                match zmq {
                    Ok(zmq) => {
                        if let Err(err) = socket.send(zmq).await {
                            log::error!("[kernel {}] Failed to send {} on {}: {}", connection.kernel_id, msg_type, channel, err);
                        }
                    }
                    Err(err) => {
                        log::error!("[kernel {}] Failed to encode {}: {}", connection.kernel_id, msg_type, err);
                    }
                }
            },
            _ = stopped.wait() => break,
        }
    }
    endpoint.close();
    log::trace!("[kernel {}] Closed {} bridge", connection.kernel_id, channel);
}

async fn run_subscriber(
    mut socket: SubSocket,
    endpoint: ChannelEndpoint,
    connection: KernelConnection,
    stopped: Arc<OnceSignal>,
) {
    loop {
        select! {
            incoming = socket.recv() => {
                match incoming {
                    Ok(msg) => {
                        if !deliver(&endpoint, &connection, msg).await {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("[kernel {}] Failed to read from iopub socket: {}", connection.kernel_id, err);
                        break;
                    }
                }
            },
            outgoing = endpoint.from_client.recv() => {
                match outgoing {
                    Ok(msg) => log::warn!(
                        "[kernel {}] Cannot send {} on iopub; dropping",
                        connection.kernel_id,
                        msg.header.msg_type
                    ),
                    Err(_) => break,
                }
            },
            _ = stopped.wait() => break,
        }
    }
    endpoint.close();
    log::trace!("[kernel {}] Closed iopub bridge", connection.kernel_id);
}

/// Decode a message from the kernel and hand it to the stream. Returns
/// `false` once the stream is gone.
async fn deliver(
    endpoint: &ChannelEndpoint,
    connection: &KernelConnection,
    msg: ZmqMessage,
) -> bool {
    let decoded = WireMessage::from_zmq(msg).and_then(|wire| wire.to_jupyter(connection));
    match decoded {
        Ok(msg) => endpoint.to_client.send(msg).await.is_ok(),
        Err(err) => {
            log::warn!(
                "[kernel {}] Dropping malformed message on {}: {}",
                connection.kernel_id,
                endpoint.channel,
                err
            );
            true
        }
    }
}
