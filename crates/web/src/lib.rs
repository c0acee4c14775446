//! kvmdeck console relay
//!
//! Bridges browser sockets to the hypervisor's local display consoles.

pub mod tunnel;
pub mod ws;

pub use tunnel::{ConsoleTunnel, Frame, ShutdownSignal, TunnelStats};
