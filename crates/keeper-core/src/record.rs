//! One supervised process attempt and the operations on it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::error::{Result, SupervisorError};
use crate::logs;
use crate::output::{LineReader, OutputBuffer};
use crate::registry::Registry;
use crate::stats::StatsProbe;
use crate::supervisor::SupervisorConfig;
use crate::types::{JobSpec, ProcessSummary, Stream, UsageSample};

pub struct ProcessRecord {
	pid: u32,
	spec: Arc<JobSpec>,
	working_dir: PathBuf,
	restart_attempt: u32,
	started_at: SystemTime,
	started: Instant,
	exited_at: OnceLock<Instant>,
	alive: AtomicBool,
	kill_requested: AtomicBool,
	detached: AtomicBool,
	stdout: OutputBuffer,
	stderr: OutputBuffer,
	persist_dir: Option<PathBuf>,
	exited: watch::Sender<bool>,
}

impl ProcessRecord {
	/// Starts `spec` as a new child in its own process group with piped
	/// stdout/stderr. The caller owns the returned [`Child`] and must wait on it.
	pub fn spawn(
		spec: Arc<JobSpec>,
		restart_attempt: u32,
		config: &SupervisorConfig,
	) -> Result<(Arc<Self>, Child)> {
		let spawn_error = |reason: String| SupervisorError::Spawn {
			name: spec.name.clone(),
			reason,
		};

		if !spec.path.exists() {
			return Err(spawn_error(format!("{} does not exist", spec.path.display())));
		}

		let working_dir = spec.resolve_working_dir();
		let mut cmd = build_command(&spec, &working_dir);
		cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

		let child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
		let pid = child
			.id()
			.ok_or_else(|| spawn_error("process exited before its pid was read".to_string()))?;

		let record = Arc::new(Self::new(
			pid,
			spec,
			working_dir,
			restart_attempt,
			config.output_lines,
			config.persist_dir.clone(),
		));
		Ok((record, child))
	}

	fn new(
		pid: u32,
		spec: Arc<JobSpec>,
		working_dir: PathBuf,
		restart_attempt: u32,
		output_lines: usize,
		persist_dir: Option<PathBuf>,
	) -> Self {
		let (exited, _) = watch::channel(false);
		Self {
			pid,
			spec,
			working_dir,
			restart_attempt,
			started_at: SystemTime::now(),
			started: Instant::now(),
			exited_at: OnceLock::new(),
			alive: AtomicBool::new(true),
			kill_requested: AtomicBool::new(false),
			detached: AtomicBool::new(false),
			stdout: OutputBuffer::new(output_lines),
			stderr: OutputBuffer::new(output_lines),
			persist_dir,
			exited,
		}
	}

	#[cfg(test)]
	pub(crate) fn for_test(pid: u32, name: &str) -> Arc<Self> {
		Arc::new(Self::new(
			pid,
			Arc::new(JobSpec::new(name, "/bin/true")),
			PathBuf::from("/"),
			0,
			16,
			None,
		))
	}

	/// Asks the process group to stop. SIGTERM first, SIGKILL if the child is
	/// still alive after `grace`.
	///
	/// Marks the record kill-requested before anything else, so even a failed
	/// call keeps the supervisor from restarting it.
	pub fn terminate(&self, grace: Duration) -> Result<()> {
		self.kill_requested.store(true, Ordering::SeqCst);

		if !self.is_alive() {
			return Err(SupervisorError::Termination {
				pid: self.pid,
				reason: "process already exited".to_string(),
			});
		}

		let pgid = Pid::from_raw(self.pid as i32);
		killpg(pgid, Signal::SIGTERM).map_err(|e| SupervisorError::Termination {
			pid: self.pid,
			reason: e.to_string(),
		})?;

		let exited = self.exited.subscribe();
		tokio::spawn(async move {
			if !wait_for_exit(exited, grace).await {
				tracing::warn!("pid {} ignored SIGTERM, sending SIGKILL", pgid);
				let _ = killpg(pgid, Signal::SIGKILL);
			}
		});
		Ok(())
	}

	/// Disowns the process: terminate it, drop it from `registry`, then start
	/// an unsupervised copy nobody keeps a handle to. Returns the copy's pid.
	///
	/// The record leaves the registry even when this fails.
	pub async fn detach(self: &Arc<Self>, registry: &Registry, grace: Duration) -> Result<u32> {
		self.detached.store(true, Ordering::SeqCst);

		let terminated = if self.is_alive() {
			self.terminate(grace)
		} else {
			self.kill_requested.store(true, Ordering::SeqCst);
			Ok(())
		};
		registry.remove(self).await;

		let detach_error = |reason: String| SupervisorError::Detach {
			name: self.spec.name.clone(),
			reason,
		};
		terminated.map_err(|e| detach_error(e.to_string()))?;

		if !self.wait_exited(grace + Duration::from_secs(1)).await {
			tracing::warn!("{} (pid {}) still running after detach signal", self.spec.name, self.pid);
		}

		let mut cmd = build_command(&self.spec, &self.working_dir);
		cmd.stdout(Stdio::null()).stderr(Stdio::null());
		let copy = cmd.spawn().map_err(|e| detach_error(e.to_string()))?;
		let copy_pid = copy.id().unwrap_or(0);
		// Dropping the handle leaves reaping to tokio's orphan queue.
		drop(copy);

		tracing::info!("{} detached (pid {} -> {})", self.spec.name, self.pid, copy_pid);
		Ok(copy_pid)
	}

	/// Blocking point-in-time CPU/memory sample.
	pub fn query_resource_usage(&self, probe: StatsProbe) -> Result<UsageSample> {
		let unavailable = |reason: String| SupervisorError::Unavailable {
			pid: self.pid,
			reason,
		};
		if !self.is_alive() {
			return Err(unavailable("process has exited".to_string()));
		}
		probe.sample(self.pid).map_err(unavailable)
	}

	pub fn output(&self, stream: Stream) -> &OutputBuffer {
		match stream {
			Stream::Stdout => &self.stdout,
			Stream::Stderr => &self.stderr,
		}
	}

	pub async fn append_output_line(&self, stream: Stream, line: String) {
		self.output(stream).push_line(line).await;
	}

	/// Feeds one of the child's pipes into its buffer until the pipe closes.
	pub(crate) async fn capture<R: AsyncRead + Unpin>(self: Arc<Self>, stream: Stream, reader: R) {
		let mut lines = LineReader::new(reader);
		while let Some(line) = lines.next_line().await {
			self.append_output_line(stream, line).await;
		}
	}

	pub async fn read_output(&self, stream: Stream) -> Vec<String> {
		self.output(stream).snapshot().await
	}

	/// Clears one stream, saving it under the persist dir first if asked and
	/// one is configured.
	pub async fn clear_output(&self, stream: Stream, persist: bool) {
		let target = match (&self.persist_dir, persist) {
			(Some(dir), true) => Some(logs::persisted_output_path(dir, &self.spec.name, stream)),
			(None, true) => {
				tracing::warn!("no persist dir configured, discarding {} of {}", stream, self.spec.name);
				None
			}
			_ => None,
		};
		self.output(stream).clear(target.as_deref()).await;
	}

	/// Called by the supervisor once the child has been reaped.
	pub(crate) fn mark_exited(&self) {
		let _ = self.exited_at.set(Instant::now());
		self.alive.store(false, Ordering::SeqCst);
		self.exited.send_replace(true);
	}

	/// Waits until the supervisor has reaped the child. `false` on timeout.
	pub async fn wait_exited(&self, timeout: Duration) -> bool {
		wait_for_exit(self.exited.subscribe(), timeout).await
	}

	pub fn pid(&self) -> u32 {
		self.pid
	}

	pub fn name(&self) -> &str {
		&self.spec.name
	}

	pub fn path(&self) -> &Path {
		&self.spec.path
	}

	pub fn args(&self) -> &[String] {
		&self.spec.args
	}

	pub fn working_dir(&self) -> &Path {
		&self.working_dir
	}

	pub fn spec(&self) -> &Arc<JobSpec> {
		&self.spec
	}

	pub fn restart_attempt(&self) -> u32 {
		self.restart_attempt
	}

	pub fn started_at(&self) -> SystemTime {
		self.started_at
	}

	/// Time since spawn, frozen at exit.
	pub fn uptime(&self) -> Duration {
		match self.exited_at.get() {
			Some(exited) => exited.duration_since(self.started),
			None => self.started.elapsed(),
		}
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::SeqCst)
	}

	pub fn kill_requested(&self) -> bool {
		self.kill_requested.load(Ordering::SeqCst)
	}

	pub fn is_detached(&self) -> bool {
		self.detached.load(Ordering::SeqCst)
	}

	pub fn stats_enabled(&self) -> bool {
		self.spec.stats
	}

	pub fn stream_enabled(&self, stream: Stream) -> bool {
		match stream {
			Stream::Stdout => self.spec.stdout,
			Stream::Stderr => self.spec.stderr,
		}
	}

	pub fn summary(&self) -> ProcessSummary {
		ProcessSummary {
			pid: self.pid,
			name: self.spec.name.clone(),
			path: self.spec.path.display().to_string(),
			args: self.spec.args.clone(),
			restart_attempt: self.restart_attempt,
			started_at: logs::unix_secs(self.started_at),
			uptime_secs: self.uptime().as_secs(),
			alive: self.is_alive(),
		}
	}
}

impl std::fmt::Debug for ProcessRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProcessRecord")
			.field("pid", &self.pid)
			.field("name", &self.spec.name)
			.field("restart_attempt", &self.restart_attempt)
			.field("alive", &self.is_alive())
			.field("kill_requested", &self.kill_requested())
			.field("detached", &self.is_detached())
			.finish()
	}
}

fn build_command(spec: &JobSpec, working_dir: &Path) -> Command {
	let mut cmd = Command::new(&spec.path);
	cmd.args(&spec.args)
		.current_dir(working_dir)
		.envs(&spec.env)
		.stdin(Stdio::null())
		.process_group(0);
	cmd
}

async fn wait_for_exit(mut exited: watch::Receiver<bool>, timeout: Duration) -> bool {
	tokio::time::timeout(timeout, async move {
		while !*exited.borrow_and_update() {
			if exited.changed().await.is_err() {
				break;
			}
		}
	})
	.await
	.is_ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn capture_fills_only_its_own_stream() {
		let record = ProcessRecord::for_test(4242, "web");
		let pipe: &[u8] = b"one\ntwo\n";
		record.clone().capture(Stream::Stderr, pipe).await;

		assert_eq!(record.read_output(Stream::Stderr).await, vec!["one", "two"]);
		assert!(record.read_output(Stream::Stdout).await.is_empty());
	}
}
