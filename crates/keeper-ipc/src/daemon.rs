use std::path::PathBuf;

use crate::paths::DaemonPaths;

/// PID-file and socket bookkeeping for a daemon process.
pub struct Daemon {
	pub paths: DaemonPaths,
}

impl Daemon {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			paths: DaemonPaths::new(app_name),
		}
	}

	/// Creates the state dir, writes our PID and clears a stale socket.
	pub fn prepare(&self) -> std::io::Result<()> {
		std::fs::create_dir_all(self.paths.state_dir())?;
		std::fs::write(self.paths.pid_path(), std::process::id().to_string())?;

		let socket_path = self.paths.socket_path();
		if socket_path.exists() {
			let _ = std::fs::remove_file(&socket_path);
		}
		Ok(())
	}

	pub fn cleanup(&self) {
		let _ = std::fs::remove_file(self.paths.socket_path());
		let _ = std::fs::remove_file(self.paths.pid_path());
	}

	/// Re-executes the current binary with `args`, detached from our stdio.
	pub fn start_background(&self, args: &[&str]) -> Result<(), String> {
		if crate::client::is_running(&self.paths) {
			return Err("daemon already running".to_string());
		}

		let binary = find_current_binary();
		let mut cmd = std::process::Command::new(&binary);
		cmd.args(args)
			.stdin(std::process::Stdio::null())
			.stdout(std::process::Stdio::null())
			.stderr(std::process::Stdio::null());

		cmd.spawn().map_err(|e| format!("failed to start daemon: {}", e))?;
		Ok(())
	}

	pub fn stop(&self) -> Result<(), String> {
		if let Some(pid) = crate::client::read_pid(&self.paths) {
			use nix::sys::signal::{kill, Signal};
			use nix::unistd::Pid;
			kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
				.map_err(|e| format!("failed to signal daemon (pid {}): {}", pid, e))?;
			self.cleanup();
			Ok(())
		} else {
			Err("daemon not running".to_string())
		}
	}
}

fn find_current_binary() -> PathBuf {
	std::env::current_exe().unwrap_or_else(|_| PathBuf::from("keeper"))
}
