//! Error taxonomy for supervision and control-plane operations.
//!
//! Transports turn these into user-facing strings (RPC) or status classes
//! (HTTP); nothing here ever takes the daemon down.

use thiserror::Error;

/// Canonical not-found message for name-keyed lookups.
pub const NO_SUCH_PROCESS: &str = "no such process";

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SupervisorError {
	/// The executable is missing or the OS refused to create the process.
	#[error("failed to spawn {name}: {reason}")]
	Spawn { name: String, reason: String },

	/// The process had already exited or refused the signal.
	#[error("failed to terminate pid {pid}: {reason}")]
	Termination { pid: u32, reason: String },

	/// A resource-usage sample could not be taken.
	#[error("stats unavailable for pid {pid}: {reason}")]
	Unavailable { pid: u32, reason: String },

	#[error("{0}")]
	NotFound(String),

	/// The job does not expose the requested endpoint.
	#[error("{what} not allowed for {name}")]
	Forbidden { what: &'static str, name: String },

	/// Termination or the unsupervised re-spawn failed. The record is gone
	/// from the registry either way.
	#[error("failed to detach {name}: {reason}")]
	Detach { name: String, reason: String },

	/// The job source could not be read.
	#[error("config error: {0}")]
	Config(String),
}

impl SupervisorError {
	pub fn no_such_process() -> Self {
		SupervisorError::NotFound(NO_SUCH_PROCESS.to_string())
	}

	pub fn unknown_pid(pid: u32) -> Self {
		SupervisorError::NotFound(format!("no process with pid {}", pid))
	}

	/// Short stable label (snake_case) for logs.
	pub fn as_label(&self) -> &'static str {
		match self {
			SupervisorError::Spawn { .. } => "spawn_failed",
			SupervisorError::Termination { .. } => "termination_failed",
			SupervisorError::Unavailable { .. } => "stats_unavailable",
			SupervisorError::NotFound(_) => "not_found",
			SupervisorError::Forbidden { .. } => "forbidden",
			SupervisorError::Detach { .. } => "detach_failed",
			SupervisorError::Config(_) => "config_error",
		}
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, SupervisorError::NotFound(_))
	}

	pub fn is_forbidden(&self) -> bool {
		matches!(self, SupervisorError::Forbidden { .. })
	}
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn not_found_messages() {
		assert_eq!(SupervisorError::no_such_process().to_string(), "no such process");
		assert_eq!(SupervisorError::unknown_pid(42).to_string(), "no process with pid 42");
		assert!(SupervisorError::unknown_pid(42).is_not_found());
	}

	#[test]
	fn labels_are_stable() {
		let err = SupervisorError::Forbidden {
			what: "stdout",
			name: "web".into(),
		};
		assert_eq!(err.as_label(), "forbidden");
		assert_eq!(err.to_string(), "stdout not allowed for web");
		assert!(err.is_forbidden());
	}
}
