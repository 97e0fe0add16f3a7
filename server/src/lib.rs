//! Multi-threaded UDP relay daemon.
//!
//! Wires the event-loop transport from `relay-driver` into a runnable
//! service: configuration, logging, signal handling, worker spawning with
//! optional CPU pinning, traffic statistics, and a built-in echo relay
//! logic for the `relayd` binary.

pub mod affinity;
pub mod config;
pub mod logging;
pub mod logic;
pub mod metrics;
pub mod relay;
pub mod signal;
pub mod workers;

pub use config::{Args, Config};
pub use relay::Relay;
