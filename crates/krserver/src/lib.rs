//
// lib.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! A websocket relay for Jupyter kernels: clients speak the Jupyter
//! websocket protocol, kernels speak ZeroMQ, and this crate sits between
//! them.

#![allow(missing_docs)]

pub mod config;
pub mod connection_file;
pub mod connection_registry;
pub mod culler;
pub mod error;
pub mod kernel_connection;
pub mod kernel_manager;
pub mod kernel_record;
pub mod kernel_relay;
pub mod kernel_spec;
pub mod rate_limiter;
pub mod server;
pub mod signal;
pub mod supervisor;
pub mod wire_message;
pub mod ws_codec;
