//! The one command surface both transports sit on.
//!
//! Every operation answers with a short success string, a value, or a
//! [`SupervisorError`]; turning those into wire replies is the transport's job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{Result, SupervisorError};
use crate::record::ProcessRecord;
use crate::registry::Registry;
use crate::supervisor::Supervisor;
use crate::types::{JobSpec, ProcessSummary, Stream, UsageSample};

/// Where job specs come from on launch and reload.
pub trait JobSource: Send + Sync {
	fn load(&self) -> Result<Vec<JobSpec>>;
}

impl JobSource for Vec<JobSpec> {
	fn load(&self) -> Result<Vec<JobSpec>> {
		Ok(self.clone())
	}
}

pub struct ControlPlane {
	supervisor: Arc<Supervisor>,
	jobs: Arc<dyn JobSource>,
	log_path: Option<PathBuf>,
	shutdown: watch::Sender<bool>,
}

impl ControlPlane {
	pub fn new(supervisor: Arc<Supervisor>, jobs: Arc<dyn JobSource>) -> Self {
		let (shutdown, _) = watch::channel(false);
		Self {
			supervisor,
			jobs,
			log_path: None,
			shutdown,
		}
	}

	/// Daemon log file served by [`read_log`](Self::read_log).
	pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.log_path = Some(path.into());
		self
	}

	pub fn supervisor(&self) -> &Arc<Supervisor> {
		&self.supervisor
	}

	pub fn registry(&self) -> &Arc<Registry> {
		self.supervisor.registry()
	}

	fn grace(&self) -> Duration {
		self.supervisor.config().kill_grace
	}

	/// Loads the job source and starts every job. Spawn failures are logged
	/// and skipped; returns how many lineages started.
	pub async fn launch_all(&self) -> Result<usize> {
		let specs = self.jobs.load()?;
		self.supervisor.replace_jobs(specs).await;

		let mut started = 0;
		for spec in self.supervisor.jobs().await {
			match self.supervisor.start(spec, 0).await {
				Ok(_) => started += 1,
				Err(e) => tracing::error!("{}", e),
			}
		}
		Ok(started)
	}

	pub async fn list_all(&self) -> Vec<ProcessSummary> {
		self.registry()
			.list()
			.await
			.iter()
			.map(|record| record.summary())
			.collect()
	}

	pub async fn status_by_name(&self, name: &str) -> Result<ProcessSummary> {
		Ok(self.find(name).await?.summary())
	}

	pub async fn stats(&self, pid: u32) -> Result<UsageSample> {
		let record = self.registry().get(pid).await?;
		if !record.stats_enabled() {
			return Err(SupervisorError::Forbidden {
				what: "stats",
				name: record.name().to_string(),
			});
		}
		let probe = self.supervisor.config().stats_probe;
		tokio::task::spawn_blocking(move || record.query_resource_usage(probe))
			.await
			.map_err(|e| SupervisorError::Unavailable {
				pid,
				reason: e.to_string(),
			})?
	}

	pub async fn kill(&self, pid: u32) -> Result<String> {
		let record = self.registry().get(pid).await?;
		record.terminate(self.grace())?;
		Ok(format!("{} killed", pid))
	}

	pub async fn start_by_name(&self, name: &str) -> Result<String> {
		let _job = self.supervisor.lock_job(name).await;
		let (spec, attempt) = match self.registry().find_by_name(name).await {
			Some(record) if record.is_alive() => return Ok("process already running".to_string()),
			Some(record) => {
				self.registry().remove(&record).await;
				let spec = self.supervisor.job(name).await.unwrap_or_else(|| record.spec().clone());
				(spec, record.restart_attempt())
			}
			None => {
				let spec = self
					.supervisor
					.job(name)
					.await
					.ok_or_else(SupervisorError::no_such_process)?;
				(spec, 0)
			}
		};
		self.supervisor.start(spec, attempt).await?;
		Ok("successfully started".to_string())
	}

	/// Stops the current lineage, waits for its exit, then starts a new one
	/// with the restart counter bumped.
	pub async fn restart_by_name(&self, name: &str) -> Result<String> {
		let _job = self.supervisor.lock_job(name).await;
		let record = self.find(name).await?;
		self.stop_record(&record).await?;
		let spec = self.supervisor.job(name).await.unwrap_or_else(|| record.spec().clone());
		self.supervisor.start(spec, record.restart_attempt() + 1).await?;
		Ok("successfully restarted".to_string())
	}

	pub async fn stop_by_name(&self, name: &str) -> Result<String> {
		let _job = self.supervisor.lock_job(name).await;
		let record = self.find(name).await?;
		self.stop_record(&record).await?;
		Ok("successfully stopped".to_string())
	}

	pub async fn detach_by_name(&self, name: &str) -> Result<String> {
		let _job = self.supervisor.lock_job(name).await;
		let record = self.find(name).await?;
		self.detach_record(&record).await
	}

	pub async fn start_pid(&self, pid: u32) -> Result<String> {
		let name = self.name_of(pid).await?;
		self.start_by_name(&name).await
	}

	pub async fn restart_pid(&self, pid: u32) -> Result<String> {
		let name = self.name_of(pid).await?;
		self.restart_by_name(&name).await
	}

	pub async fn detach_pid(&self, pid: u32) -> Result<String> {
		let name = self.name_of(pid).await?;
		let _job = self.supervisor.lock_job(&name).await;
		let record = self.registry().get(pid).await?;
		self.detach_record(&record).await
	}

	pub async fn read_output(&self, pid: u32, stream: Stream) -> Result<Vec<String>> {
		let record = self.exposed(pid, stream).await?;
		Ok(record.read_output(stream).await)
	}

	pub async fn clear_output(&self, pid: u32, stream: Stream, persist: bool) -> Result<String> {
		let record = self.exposed(pid, stream).await?;
		record.clear_output(stream, persist).await;
		Ok(format!("{} cleared", stream))
	}

	/// Stops everything, re-reads the job source and launches it again.
	pub async fn reload(&self) -> Result<String> {
		let specs = self.jobs.load()?;
		self.stop_all().await;
		self.supervisor.replace_jobs(specs).await;

		let mut failed = 0;
		for spec in self.supervisor.jobs().await {
			let _job = self.supervisor.lock_job(&spec.name).await;
			if let Err(e) = self.supervisor.start(spec, 0).await {
				tracing::error!("{}", e);
				failed += 1;
			}
		}
		if failed > 0 {
			return Ok(format!("reloaded, {} job(s) failed to start", failed));
		}
		Ok("successfully reloaded".to_string())
	}

	/// Kills, or with `detach_first` detaches, every record and then tells
	/// the daemon to exit.
	pub async fn shutdown(&self, detach_first: bool) -> String {
		if detach_first {
			for record in self.registry().list().await {
				let _job = self.supervisor.lock_job(record.name()).await;
				if !record.is_alive() {
					self.registry().remove(&record).await;
					continue;
				}
				if let Err(e) = record.detach(self.registry(), self.grace()).await {
					tracing::warn!("{}", e);
				}
			}
		} else {
			self.stop_all().await;
		}
		self.shutdown.send_replace(true);
		if detach_first {
			"detached all processes, shutting down".to_string()
		} else {
			"killed all processes, shutting down".to_string()
		}
	}

	/// Fires once [`shutdown`](Self::shutdown) has run.
	pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
		self.shutdown.subscribe()
	}

	pub fn ping(&self) -> &'static str {
		"pong"
	}

	pub async fn read_log(&self) -> Result<String> {
		let path = self.log_path()?;
		match tokio::fs::read_to_string(path).await {
			Ok(contents) => Ok(contents),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
			Err(e) => Err(SupervisorError::Config(format!("{}: {}", path.display(), e))),
		}
	}

	pub async fn clear_log(&self) -> Result<String> {
		let path = self.log_path()?;
		tokio::fs::write(path, b"")
			.await
			.map_err(|e| SupervisorError::Config(format!("{}: {}", path.display(), e)))?;
		Ok("log cleared".to_string())
	}

	fn log_path(&self) -> Result<&PathBuf> {
		self.log_path
			.as_ref()
			.ok_or_else(|| SupervisorError::Config("no daemon log configured".to_string()))
	}

	async fn find(&self, name: &str) -> Result<Arc<ProcessRecord>> {
		self.registry()
			.find_by_name(name)
			.await
			.ok_or_else(SupervisorError::no_such_process)
	}

	async fn name_of(&self, pid: u32) -> Result<String> {
		Ok(self.registry().get(pid).await?.name().to_string())
	}

	async fn exposed(&self, pid: u32, stream: Stream) -> Result<Arc<ProcessRecord>> {
		let record = self.registry().get(pid).await?;
		if !record.stream_enabled(stream) {
			return Err(SupervisorError::Forbidden {
				what: stream.as_str(),
				name: record.name().to_string(),
			});
		}
		Ok(record)
	}

	async fn detach_record(&self, record: &Arc<ProcessRecord>) -> Result<String> {
		let copy = record.detach(self.registry(), self.grace()).await?;
		Ok(format!("successfully detached (pid {})", copy))
	}

	/// Terminates `record` and waits for its lineage to see the exit. A
	/// record that already exited is just dropped from the registry.
	async fn stop_record(&self, record: &Arc<ProcessRecord>) -> Result<()> {
		if !record.is_alive() {
			self.registry().remove(record).await;
			return Ok(());
		}
		record.terminate(self.grace())?;
		if !record.wait_exited(self.grace() + Duration::from_secs(1)).await {
			tracing::warn!("{} (pid {}) did not exit in time", record.name(), record.pid());
		}
		self.registry().remove(record).await;
		Ok(())
	}

	async fn stop_all(&self) {
		for record in self.registry().list().await {
			let _job = self.supervisor.lock_job(record.name()).await;
			if let Err(e) = self.stop_record(&record).await {
				tracing::warn!("{}", e);
				self.registry().remove(&record).await;
			}
		}
	}
}
