use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One supervised job as read from the job source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
	pub name: String,
	pub path: PathBuf,
	#[serde(default)]
	pub args: Vec<String>,
	/// Overrides the default of the executable's parent directory.
	#[serde(default, rename = "workdir")]
	pub working_dir: Option<PathBuf>,
	#[serde(default)]
	pub restart: bool,
	#[serde(default)]
	pub stats: bool,
	#[serde(default)]
	pub stdout: bool,
	#[serde(default)]
	pub stderr: bool,
	#[serde(default)]
	pub env: HashMap<String, String>,
	#[serde(default)]
	pub crash_report: CrashReportPolicy,
}

impl JobSpec {
	pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
		Self {
			name: name.into(),
			path: path.into(),
			args: Vec::new(),
			working_dir: None,
			restart: false,
			stats: false,
			stdout: false,
			stderr: false,
			env: HashMap::new(),
			crash_report: CrashReportPolicy::default(),
		}
	}

	pub fn resolve_working_dir(&self) -> PathBuf {
		if let Some(dir) = &self.working_dir {
			return dir.clone();
		}
		match self.path.parent() {
			Some(parent) if parent != Path::new("") => parent.to_path_buf(),
			_ => PathBuf::from("."),
		}
	}
}

/// Where crash reports would go. Parsed and carried, never acted upon.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CrashReportPolicy {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub mail: Vec<String>,
	#[serde(default)]
	pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
	Stdout,
	Stderr,
}

impl Stream {
	pub fn as_str(&self) -> &'static str {
		match self {
			Stream::Stdout => "stdout",
			Stream::Stderr => "stderr",
		}
	}
}

impl std::fmt::Display for Stream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSummary {
	pub pid: u32,
	pub name: String,
	pub path: String,
	pub args: Vec<String>,
	pub restart_attempt: u32,
	/// Unix seconds.
	pub started_at: u64,
	pub uptime_secs: u64,
	pub alive: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UsageSample {
	pub cpu_percent: f32,
	pub mem_percent: f32,
}

/// How a lineage stopped being supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageEnd {
	/// Exited on its own with restart off.
	Exited,
	/// Exited after an operator kill/stop.
	Stopped,
	/// Exited before the minimum uptime; left in the registry as not alive.
	Flapping,
	Detached,
}
