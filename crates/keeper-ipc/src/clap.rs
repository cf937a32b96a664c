use clap::Subcommand;

use crate::paths::DaemonPaths;

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
	/// Run the daemon in the foreground (used internally)
	Run,
	/// Start the daemon in the background
	Start,
	/// Stop the running daemon
	Stop,
	/// Show daemon status
	Status,
}

impl DaemonCommand {
	/// Handles everything except `Run`, which belongs to the application.
	/// Returns `false` when the caller must run the daemon itself.
	pub fn execute(&self, paths: &DaemonPaths) -> bool {
		let daemon = crate::Daemon {
			paths: paths.clone(),
		};
		match self {
			DaemonCommand::Run => return false,
			DaemonCommand::Start => {
				if crate::client::is_running(paths) {
					eprintln!("daemon already running");
					return true;
				}
				match daemon.start_background(&["daemon", "run"]) {
					Ok(_) => eprintln!("daemon started"),
					Err(e) => {
						eprintln!("error: {}", e);
						std::process::exit(1);
					}
				}
			}
			DaemonCommand::Stop => match daemon.stop() {
				Ok(_) => eprintln!("daemon stopped"),
				Err(e) => eprintln!("{}", e),
			},
			DaemonCommand::Status => {
				if crate::client::is_running(paths) {
					if let Some(pid) = crate::client::read_pid(paths) {
						eprintln!("daemon running (pid {})", pid);
					} else {
						eprintln!("daemon running");
					}
				} else {
					eprintln!("daemon not running");
				}
			}
		}
		true
	}
}
