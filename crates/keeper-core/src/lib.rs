//! # keeper-core
//!
//! Single-host process supervision: spawn jobs, restart them behind a
//! crash-loop guard, capture their output, and drive it all through one
//! [`ControlPlane`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use keeper_core::{ControlPlane, JobSpec, Registry, Supervisor, SupervisorConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut web = JobSpec::new("web", "/usr/local/bin/web");
//! web.restart = true;
//! web.stdout = true;
//!
//! let supervisor = Supervisor::new(Registry::new(), SupervisorConfig::default());
//! let control = ControlPlane::new(supervisor, Arc::new(vec![web]));
//! control.launch_all().await.unwrap();
//!
//! for summary in control.list_all().await {
//!     println!("{} {} alive={}", summary.pid, summary.name, summary.alive);
//! }
//! # }
//! ```

pub mod control;
pub mod error;
pub mod logs;
pub mod output;
pub mod record;
pub mod registry;
pub mod stats;
pub mod supervisor;
pub mod types;

pub use control::{ControlPlane, JobSource};
pub use error::{Result, SupervisorError, NO_SUCH_PROCESS};
pub use output::OutputBuffer;
pub use record::ProcessRecord;
pub use registry::Registry;
pub use stats::StatsProbe;
pub use supervisor::{Lineage, Supervisor, SupervisorConfig};
pub use types::*;
