//! Router, framing and configuration for the kiln gateway; the binary in
//! `main.rs` wires these to a listener.

pub mod config;
pub mod error;
pub mod extract;
pub mod jsonrpc;
pub mod routes;
pub mod state;
