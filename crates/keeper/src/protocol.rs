use keeper_core::{ProcessSummary, Stream, UsageSample};
use serde::{Deserialize, Serialize};

/// One line on the RPC wire. `token` is only checked on the TCP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	#[serde(flatten)]
	pub command: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	Ping,
	List,
	Status { name: String },
	Start { name: String },
	Stop { name: String },
	Restart { name: String },
	Detach { name: String },
	Kill { pid: u32 },
	StartPid { pid: u32 },
	RestartPid { pid: u32 },
	DetachPid { pid: u32 },
	Stats { pid: u32 },
	Output { pid: u32, stream: Stream },
	ClearOutput {
		pid: u32,
		stream: Stream,
		#[serde(default)]
		persist: bool,
	},
	Reload,
	Shutdown {
		#[serde(default)]
		detach: bool,
	},
	ReadLog,
	ClearLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Ok { message: String },
	Processes { processes: Vec<ProcessSummary> },
	Process { process: ProcessSummary },
	Stats { pid: u32, usage: UsageSample },
	Output { lines: Vec<String> },
	Log { contents: String },
	Error { message: String },
	Pong,
}

pub fn daemon_paths() -> keeper_ipc::DaemonPaths {
	keeper_ipc::DaemonPaths::new("keeper")
}
