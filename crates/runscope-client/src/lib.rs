//! # Runscope Client
//!
//! Utilities for connecting to a runscope server as a viewer: subscribing to
//! projects and runs, tailing run logs, and editing run tags.

mod tcp;

pub use runscope_server::{ViewerRequest, ViewerResponse};
pub use tcp::ViewerConnection;
