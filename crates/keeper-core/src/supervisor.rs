use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::output::DEFAULT_OUTPUT_LINES;
use crate::record::ProcessRecord;
use crate::registry::Registry;
use crate::stats::StatsProbe;
use crate::types::{JobSpec, LineageEnd, Stream};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// A restarting job that exits sooner than this is treated as flapping
	/// and left stopped.
	pub min_uptime: Duration,
	/// Wait between SIGTERM and SIGKILL.
	pub kill_grace: Duration,
	/// Lines kept per output stream.
	pub output_lines: usize,
	pub stats_probe: StatsProbe,
	/// Where cleared output buffers are saved. `None` discards them.
	pub persist_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			min_uptime: Duration::from_secs(10),
			kill_grace: Duration::from_secs(3),
			output_lines: DEFAULT_OUTPUT_LINES,
			stats_probe: StatsProbe::default(),
			persist_dir: None,
		}
	}
}

/// A started lineage: its first record and the task supervising it.
pub struct Lineage {
	pub record: Arc<ProcessRecord>,
	pub handle: JoinHandle<Result<LineageEnd>>,
}

pub struct Supervisor {
	registry: Arc<Registry>,
	config: SupervisorConfig,
	jobs: RwLock<HashMap<String, Arc<JobSpec>>>,
	job_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Supervisor {
	pub fn new(registry: Arc<Registry>, config: SupervisorConfig) -> Arc<Self> {
		Arc::new(Self {
			registry,
			config,
			jobs: RwLock::new(HashMap::new()),
			job_locks: Mutex::new(HashMap::new()),
		})
	}

	/// Serializes everything that replaces or removes the records of one job:
	/// name-keyed control operations and the restart step of its lineage.
	pub async fn lock_job(&self, name: &str) -> OwnedMutexGuard<()> {
		let lock = self
			.job_locks
			.lock()
			.await
			.entry(name.to_string())
			.or_default()
			.clone();
		lock.lock_owned().await
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.config
	}

	pub async fn job(&self, name: &str) -> Option<Arc<JobSpec>> {
		self.jobs.read().await.get(name).cloned()
	}

	/// Known job specs, sorted by name.
	pub async fn jobs(&self) -> Vec<Arc<JobSpec>> {
		let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
		jobs.sort_by(|a, b| a.name.cmp(&b.name));
		jobs
	}

	pub async fn replace_jobs(&self, specs: Vec<JobSpec>) {
		let mut jobs = self.jobs.write().await;
		jobs.clear();
		for spec in specs {
			jobs.insert(spec.name.clone(), Arc::new(spec));
		}
	}

	/// Spawns the first attempt of a lineage and hands the rest to a
	/// background task. A spawn failure here is returned directly.
	pub async fn start(self: &Arc<Self>, spec: Arc<JobSpec>, restart_attempt: u32) -> Result<Lineage> {
		self.jobs.write().await.insert(spec.name.clone(), spec.clone());

		let (record, child) = self.spawn_attempt(spec, restart_attempt).await?;
		let sup = Arc::clone(self);
		let first = record.clone();
		let handle = tokio::spawn(async move { sup.supervise(first, child).await });
		Ok(Lineage { record, handle })
	}

	async fn spawn_attempt(
		&self,
		spec: Arc<JobSpec>,
		restart_attempt: u32,
	) -> Result<(Arc<ProcessRecord>, Child)> {
		let (record, mut child) = ProcessRecord::spawn(spec, restart_attempt, &self.config)?;
		self.registry.add(record.clone()).await;

		if let Some(stdout) = child.stdout.take() {
			tokio::spawn(record.clone().capture(Stream::Stdout, stdout));
		}
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(record.clone().capture(Stream::Stderr, stderr));
		}

		tracing::info!(
			"started {} (pid {}, attempt {})",
			record.name(),
			record.pid(),
			restart_attempt
		);
		Ok((record, child))
	}

	async fn supervise(self: Arc<Self>, mut record: Arc<ProcessRecord>, mut child: Child) -> Result<LineageEnd> {
		loop {
			match child.wait().await {
				Ok(status) => tracing::info!("{} (pid {}) exited: {}", record.name(), record.pid(), status),
				Err(e) => tracing::warn!("{} (pid {}) wait failed: {}", record.name(), record.pid(), e),
			}
			record.mark_exited();

			if record.is_detached() {
				return Ok(LineageEnd::Detached);
			}

			// Held until the next attempt is registered.
			let _job = self.lock_job(record.name()).await;
			if record.kill_requested() {
				self.registry.remove(&record).await;
				return Ok(LineageEnd::Stopped);
			}
			if !record.spec().restart {
				self.registry.remove(&record).await;
				return Ok(LineageEnd::Exited);
			}

			let uptime = record.uptime();
			if uptime < self.config.min_uptime {
				tracing::warn!(
					"{} exited after {:.1}s (minimum {}s), not restarting",
					record.name(),
					uptime.as_secs_f64(),
					self.config.min_uptime.as_secs()
				);
				return Ok(LineageEnd::Flapping);
			}

			if !self.registry.remove(&record).await {
				// An operator start already replaced this record.
				tracing::info!("{} (pid {}) was superseded, not restarting", record.name(), record.pid());
				return Ok(LineageEnd::Stopped);
			}
			let attempt = record.restart_attempt() + 1;
			match self.spawn_attempt(record.spec().clone(), attempt).await {
				Ok((next, next_child)) => {
					tracing::info!("restarted {} (pid {} -> {})", next.name(), record.pid(), next.pid());
					record = next;
					child = next_child;
				}
				Err(e) => {
					tracing::error!("restart of {} failed: {}", record.name(), e);
					return Err(e);
				}
			}
		}
	}
}
