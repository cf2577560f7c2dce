//! Shared types for the kernel relay server and its clients.

/// Jupyter message types
pub mod jupyter_message;

/// Kernel info reply content
pub mod kernel_info;

/// Kernel models and execution states
pub mod kernel_model;

/// Date (de)serialization for message headers
pub mod iso_date;

mod parent_header;
