//! vmlink-agent library
//!
//! Core functionality for the vmlink agent:
//! - Binary message codec shared by the broker link and the VM host IPC
//! - Session state: message counter, dedup window, flush-run bookkeeping
//! - VM host child supervision over a socketpair channel
//! - Single-threaded reactor tying transport, child and telemetry together

pub mod config;
pub mod dedup;
pub mod display;
pub mod reactor;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
