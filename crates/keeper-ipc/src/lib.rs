//! # keeper-ipc
//!
//! Daemon plumbing shared by the keeper daemon and its CLI: XDG state/config
//! paths, PID files, and a newline-delimited JSON request/response protocol
//! served over a Unix socket (local) and TCP (remote).

pub mod paths;
pub mod server;
pub mod client;
pub mod daemon;
#[cfg(feature = "clap")]
pub mod clap;

pub use paths::DaemonPaths;
pub use client::{DaemonClient, ClientError};
pub use daemon::Daemon;
