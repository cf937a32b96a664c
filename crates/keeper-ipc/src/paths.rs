use std::path::PathBuf;

/// Where one app keeps its socket, pidfile and log (state) and its settings
/// (config). Both follow the XDG base directories, falling back to `$HOME`
/// and finally `/tmp`.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
	pub app_name: String,
}

impl DaemonPaths {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			app_name: app_name.into(),
		}
	}

	/// `$XDG_STATE_HOME/<app>` or `~/.local/state/<app>`.
	pub fn state_dir(&self) -> PathBuf {
		xdg_dir("XDG_STATE_HOME", &[".local", "state"])
			.map(|base| base.join(&self.app_name))
			.unwrap_or_else(|| PathBuf::from("/tmp").join(&self.app_name))
	}

	/// `$XDG_CONFIG_HOME/<app>` or `~/.config/<app>`.
	pub fn config_dir(&self) -> PathBuf {
		xdg_dir("XDG_CONFIG_HOME", &[".config"])
			.map(|base| base.join(&self.app_name))
			.unwrap_or_else(|| PathBuf::from("/tmp").join(&self.app_name).join("config"))
	}

	pub fn socket_path(&self) -> PathBuf {
		self.state_dir().join("daemon.sock")
	}

	pub fn pid_path(&self) -> PathBuf {
		self.state_dir().join("daemon.pid")
	}

	/// Tracing output of the running daemon; `keeper log` reads it back.
	pub fn log_path(&self) -> PathBuf {
		self.state_dir().join("daemon.log")
	}
}

fn xdg_dir(var: &str, under_home: &[&str]) -> Option<PathBuf> {
	if let Ok(dir) = std::env::var(var) {
		if !dir.is_empty() {
			return Some(PathBuf::from(dir));
		}
	}
	home_dir().map(|home| under_home.iter().fold(home, |path, part| path.join(part)))
}

pub fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}

/// Job files and config values may start with `~` or `~/`; anything else,
/// including `~user/...`, is taken literally.
pub fn expand_tilde(path: &str) -> PathBuf {
	let rest = match path {
		"~" => "",
		_ => match path.strip_prefix("~/") {
			Some(rest) => rest,
			None => return PathBuf::from(path),
		},
	};
	match home_dir() {
		Some(home) if rest.is_empty() => home,
		Some(home) => home.join(rest),
		None => PathBuf::from(path),
	}
}
