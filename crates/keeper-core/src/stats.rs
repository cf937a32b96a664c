use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::types::UsageSample;

/// How CPU and memory usage are sampled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsProbe {
	/// In-process read of the OS process table.
	#[default]
	Sysinfo,
	/// `ps -p <pid> -o %cpu=,%mem=`.
	Ps,
}

impl StatsProbe {
	/// Blocking; takes at least one CPU refresh interval with `Sysinfo`.
	pub fn sample(&self, pid: u32) -> Result<UsageSample, String> {
		match self {
			StatsProbe::Sysinfo => sample_sysinfo(pid),
			StatsProbe::Ps => sample_ps(pid),
		}
	}
}

fn sample_sysinfo(pid: u32) -> Result<UsageSample, String> {
	let mut system = System::new();
	let target = Pid::from_u32(pid);
	let refresh = ProcessRefreshKind::new().with_cpu().with_memory();

	system.refresh_memory();
	system.refresh_processes_specifics(ProcessesToUpdate::Some(&[target]), true, refresh);
	// cpu_usage is a delta between two refreshes
	std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
	system.refresh_processes_specifics(ProcessesToUpdate::Some(&[target]), true, refresh);

	let process = system
		.process(target)
		.ok_or_else(|| "process not found".to_string())?;
	let total = system.total_memory();
	let mem_percent = if total > 0 {
		(process.memory() as f64 / total as f64 * 100.0) as f32
	} else {
		0.0
	};

	Ok(UsageSample {
		cpu_percent: process.cpu_usage(),
		mem_percent,
	})
}

fn sample_ps(pid: u32) -> Result<UsageSample, String> {
	let output = std::process::Command::new("ps")
		.args(["-p", &pid.to_string(), "-o", "%cpu=,%mem="])
		.output()
		.map_err(|e| format!("failed to run ps: {}", e))?;
	if !output.status.success() {
		return Err("process not found".to_string());
	}
	parse_ps_output(&String::from_utf8_lossy(&output.stdout))
		.ok_or_else(|| "unexpected ps output".to_string())
}

pub fn parse_ps_output(output: &str) -> Option<UsageSample> {
	let mut fields = output.split_whitespace();
	let cpu_percent = fields.next()?.parse().ok()?;
	let mem_percent = fields.next()?.parse().ok()?;
	Some(UsageSample {
		cpu_percent,
		mem_percent,
	})
}
