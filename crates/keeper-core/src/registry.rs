use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, SupervisorError};
use crate::record::ProcessRecord;

/// Live process records keyed by pid.
///
/// One map-wide lock: writers for add/remove, readers for lookups and
/// snapshots. Record buffers lock on their own.
#[derive(Default)]
pub struct Registry {
	records: RwLock<HashMap<u32, Arc<ProcessRecord>>>,
}

impl Registry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub async fn add(&self, record: Arc<ProcessRecord>) {
		let mut records = self.records.write().await;
		if let Some(previous) = records.insert(record.pid(), record) {
			tracing::debug!("pid {} reused, replacing stale record for {}", previous.pid(), previous.name());
		}
	}

	/// Removes `record` if it is still the entry for its pid. Returns whether
	/// anything was removed.
	pub async fn remove(&self, record: &Arc<ProcessRecord>) -> bool {
		let mut records = self.records.write().await;
		match records.get(&record.pid()) {
			Some(current) if Arc::ptr_eq(current, record) => {
				records.remove(&record.pid());
				true
			}
			_ => false,
		}
	}

	pub async fn get(&self, pid: u32) -> Result<Arc<ProcessRecord>> {
		self.records
			.read()
			.await
			.get(&pid)
			.cloned()
			.ok_or_else(|| SupervisorError::unknown_pid(pid))
	}

	/// Consistent snapshot, ordered by job name then pid.
	pub async fn list(&self) -> Vec<Arc<ProcessRecord>> {
		let mut list: Vec<_> = self.records.read().await.values().cloned().collect();
		list.sort_by(|a, b| a.name().cmp(b.name()).then(a.pid().cmp(&b.pid())));
		list
	}

	/// Record for the job `name`, an alive one if there is one.
	pub async fn find_by_name(&self, name: &str) -> Option<Arc<ProcessRecord>> {
		let records = self.records.read().await;
		let mut found: Option<&Arc<ProcessRecord>> = None;
		for record in records.values().filter(|r| r.name() == name) {
			match found {
				Some(current) if current.is_alive() => {}
				_ => found = Some(record),
			}
		}
		found.cloned()
	}

	pub async fn len(&self) -> usize {
		self.records.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.records.read().await.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn lookup_unknown_pid_is_not_found() {
		let registry = Registry::new();
		let err = registry.get(99).await.unwrap_err();
		assert!(err.is_not_found());
	}

	#[tokio::test]
	async fn remove_ignores_stale_record() {
		let registry = Registry::new();
		let old = ProcessRecord::for_test(10, "web");
		let new = ProcessRecord::for_test(10, "web");
		registry.add(old.clone()).await;
		registry.add(new.clone()).await;

		assert!(!registry.remove(&old).await);
		assert!(Arc::ptr_eq(&registry.get(10).await.unwrap(), &new));
		assert!(registry.remove(&new).await);
		assert!(registry.is_empty().await);
	}

	#[tokio::test]
	async fn find_by_name_prefers_alive() {
		let registry = Registry::new();
		let dead = ProcessRecord::for_test(1, "web");
		dead.mark_exited();
		let alive = ProcessRecord::for_test(2, "web");
		registry.add(dead).await;
		registry.add(alive).await;
		registry.add(ProcessRecord::for_test(3, "db")).await;

		assert_eq!(registry.find_by_name("web").await.unwrap().pid(), 2);
		assert_eq!(registry.find_by_name("db").await.unwrap().pid(), 3);
		assert!(registry.find_by_name("cache").await.is_none());

		let names: Vec<_> = registry.list().await.iter().map(|r| r.pid()).collect();
		assert_eq!(names, vec![3, 1, 2]);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_add_and_remove_stay_consistent() {
		let registry = Registry::new();
		let mut handles = Vec::new();
		for task in 0..8u32 {
			let registry = registry.clone();
			handles.push(tokio::spawn(async move {
				for i in 0..50u32 {
					let record = ProcessRecord::for_test(task * 1000 + i, "job");
					registry.add(record.clone()).await;
					if i % 2 == 0 {
						assert!(registry.remove(&record).await);
					}
				}
			}));
		}
		for handle in handles {
			handle.await.unwrap();
		}

		assert_eq!(registry.len().await, 8 * 25);
		for record in registry.list().await {
			assert_eq!(record.pid() % 2, 1);
		}
	}
}
