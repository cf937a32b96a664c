use keeper_core::{JobSource, JobSpec, StatsProbe, SupervisorConfig, SupervisorError};
use keeper_ipc::paths::expand_tilde;
use keeper_ipc::DaemonPaths;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Global config (~/.config/keeper/config.toml) ────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalConfig {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default)]
	pub supervisor: SupervisorSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	/// Shared secret for the TCP RPC listener and the HTTP API.
	pub token: Option<String>,
	/// TCP RPC listener, e.g. `0.0.0.0:7070`. The Unix socket is always on.
	pub rpc_addr: Option<String>,
	pub http_port: Option<u16>,
	#[serde(default = "default_http_bind")]
	pub http_bind: String,
	pub jobs_dir: Option<String>,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			token: None,
			rpc_addr: None,
			http_port: None,
			http_bind: default_http_bind(),
			jobs_dir: None,
		}
	}
}

fn default_http_bind() -> String { "127.0.0.1".to_string() }

impl DaemonConfig {
	pub fn jobs_dir(&self, paths: &DaemonPaths) -> PathBuf {
		match &self.jobs_dir {
			Some(dir) => expand_tilde(dir),
			None => paths.config_dir().join("jobs"),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
	#[serde(default = "default_min_uptime")]
	pub min_uptime_secs: u64,
	#[serde(default = "default_kill_grace")]
	pub kill_grace_secs: u64,
	#[serde(default = "default_output_lines")]
	pub output_lines: usize,
	#[serde(default)]
	pub stats_probe: StatsProbe,
	pub persist_dir: Option<String>,
}

impl Default for SupervisorSection {
	fn default() -> Self {
		Self {
			min_uptime_secs: default_min_uptime(),
			kill_grace_secs: default_kill_grace(),
			output_lines: default_output_lines(),
			stats_probe: StatsProbe::default(),
			persist_dir: None,
		}
	}
}

fn default_min_uptime() -> u64 { 10 }
fn default_kill_grace() -> u64 { 3 }
fn default_output_lines() -> usize { keeper_core::output::DEFAULT_OUTPUT_LINES }

impl SupervisorSection {
	pub fn to_config(&self, paths: &DaemonPaths) -> SupervisorConfig {
		let persist_dir = match &self.persist_dir {
			Some(dir) => expand_tilde(dir),
			None => paths.state_dir().join("output"),
		};
		SupervisorConfig {
			min_uptime: Duration::from_secs(self.min_uptime_secs),
			kill_grace: Duration::from_secs(self.kill_grace_secs),
			output_lines: self.output_lines,
			stats_probe: self.stats_probe,
			persist_dir: Some(persist_dir),
		}
	}
}

pub fn parse_global_config(content: &str) -> Result<GlobalConfig, String> {
	toml::from_str(content).map_err(|e| e.to_string())
}

pub fn load_global_config(paths: &DaemonPaths) -> GlobalConfig {
	let path = paths.config_dir().join("config.toml");
	if path.exists() {
		match std::fs::read_to_string(&path) {
			Ok(content) => match parse_global_config(&content) {
				Ok(config) => return config,
				Err(e) => tracing::warn!("failed to parse {}: {}", path.display(), e),
			},
			Err(e) => tracing::warn!("failed to read {}: {}", path.display(), e),
		}
	}
	GlobalConfig::default()
}

// ── Job files (<jobs_dir>/*.toml) ───────────────────────────────────────────

/// Reads one job spec per `*.toml` file, in file-name order.
pub struct JobDir {
	dir: PathBuf,
}

impl JobDir {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}
}

impl JobSource for JobDir {
	fn load(&self) -> keeper_core::Result<Vec<JobSpec>> {
		let entries = match std::fs::read_dir(&self.dir) {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				tracing::warn!("jobs dir {} does not exist", self.dir.display());
				return Ok(Vec::new());
			}
			Err(e) => {
				return Err(SupervisorError::Config(format!("{}: {}", self.dir.display(), e)));
			}
		};

		let mut files: Vec<PathBuf> = entries
			.flatten()
			.map(|entry| entry.path())
			.filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
			.collect();
		files.sort();

		let mut seen = HashSet::new();
		let mut jobs = Vec::new();
		for path in files {
			let spec = match parse_job_file(&path) {
				Ok(spec) => spec,
				Err(e) => {
					tracing::warn!("skipping {}: {}", path.display(), e);
					continue;
				}
			};
			if !seen.insert(spec.name.clone()) {
				tracing::warn!("skipping {}: duplicate job name '{}'", path.display(), spec.name);
				continue;
			}
			jobs.push(spec);
		}
		Ok(jobs)
	}
}

pub fn parse_job(content: &str) -> Result<JobSpec, String> {
	let mut spec: JobSpec = toml::from_str(content).map_err(|e| e.to_string())?;
	spec.path = expand_tilde(&spec.path.to_string_lossy());
	if let Some(dir) = &spec.working_dir {
		spec.working_dir = Some(expand_tilde(&dir.to_string_lossy()));
	}
	if spec.name.trim().is_empty() {
		return Err("job name is empty".to_string());
	}
	Ok(spec)
}

fn parse_job_file(path: &Path) -> Result<JobSpec, String> {
	let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
	parse_job(&content)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

	fn temp_dir(name: &str) -> PathBuf {
		let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir().join(format!("keeper-config-{}-{}-{}", std::process::id(), n, name));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();
		dir
	}

	#[test]
	fn empty_config_uses_defaults() {
		let config = parse_global_config("").unwrap();
		assert!(config.daemon.token.is_none());
		assert!(config.daemon.http_port.is_none());
		assert_eq!(config.daemon.http_bind, "127.0.0.1");
		assert_eq!(config.supervisor.min_uptime_secs, 10);
		assert_eq!(config.supervisor.kill_grace_secs, 3);
		assert_eq!(config.supervisor.output_lines, 1000);
		assert_eq!(config.supervisor.stats_probe, StatsProbe::Sysinfo);
	}

	#[test]
	fn full_config() {
		let config = parse_global_config(
			r#"
[daemon]
token = "secret"
rpc_addr = "0.0.0.0:7070"
http_port = 7071
jobs_dir = "/etc/keeper/jobs"

[supervisor]
min_uptime_secs = 30
stats_probe = "ps"
persist_dir = "/var/lib/keeper/output"
"#,
		)
		.unwrap();
		assert_eq!(config.daemon.token.as_deref(), Some("secret"));
		assert_eq!(config.daemon.rpc_addr.as_deref(), Some("0.0.0.0:7070"));
		assert_eq!(config.daemon.http_port, Some(7071));

		let paths = DaemonPaths::new("keeper");
		assert_eq!(config.daemon.jobs_dir(&paths), PathBuf::from("/etc/keeper/jobs"));
		let sup = config.supervisor.to_config(&paths);
		assert_eq!(sup.min_uptime, Duration::from_secs(30));
		assert_eq!(sup.kill_grace, Duration::from_secs(3));
		assert_eq!(sup.stats_probe, StatsProbe::Ps);
		assert_eq!(sup.persist_dir, Some(PathBuf::from("/var/lib/keeper/output")));
	}

	#[test]
	fn job_file_fields() {
		let spec = parse_job(
			r#"
name = "web"
path = "/srv/web/bin/server"
args = ["--port", "8080"]
workdir = "/srv/web"
restart = true
stdout = true

[env]
RUST_LOG = "info"

[crash_report]
enabled = true
mail = ["ops@example.com"]
"#,
		)
		.unwrap();
		assert_eq!(spec.name, "web");
		assert_eq!(spec.args, vec!["--port", "8080"]);
		assert_eq!(spec.working_dir, Some(PathBuf::from("/srv/web")));
		assert!(spec.restart);
		assert!(spec.stdout);
		assert!(!spec.stderr);
		assert!(!spec.stats);
		assert_eq!(spec.env.get("RUST_LOG").map(String::as_str), Some("info"));
		assert!(spec.crash_report.enabled);
	}

	#[test]
	fn job_file_requires_name_and_path() {
		assert!(parse_job(r#"path = "/bin/true""#).is_err());
		assert!(parse_job(r#"name = "x""#).is_err());
		assert!(parse_job("name = \"\"\npath = \"/bin/true\"").is_err());
	}

	#[test]
	fn job_dir_skips_bad_and_duplicate_files() {
		let dir = temp_dir("jobs");
		std::fs::write(dir.join("a.toml"), "name = \"alpha\"\npath = \"/bin/true\"\n").unwrap();
		std::fs::write(dir.join("b.toml"), "name = \"beta\"\npath = \"/bin/true\"\n").unwrap();
		std::fs::write(dir.join("c.toml"), "this is not toml [").unwrap();
		std::fs::write(dir.join("d.toml"), "name = \"alpha\"\npath = \"/bin/false\"\n").unwrap();
		std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

		let jobs = JobDir::new(&dir).load().unwrap();
		let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
		assert_eq!(names, vec!["alpha", "beta"]);
		assert_eq!(jobs[0].path, PathBuf::from("/bin/true"));

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn missing_job_dir_is_empty() {
		let dir = temp_dir("missing").join("nope");
		assert!(JobDir::new(dir).load().unwrap().is_empty());
	}
}
