mod config;
mod daemon;
mod protocol;

use clap::{Parser, Subcommand};
use keeper_core::logs::{format_timestamp, format_uptime};
use keeper_core::{ProcessSummary, Stream};
use keeper_ipc::clap::DaemonCommand;
use keeper_ipc::{ClientError, Daemon, DaemonClient, DaemonPaths};
use owo_colors::OwoColorize;
use protocol::{Request, Response, RpcRequest};

#[derive(Parser)]
#[command(name = "keeper", version, about = "Single-host process supervisor")]
struct Cli {
	/// Remote daemon RPC address (host:port) instead of the local socket
	#[arg(long, global = true)]
	remote: Option<String>,
	/// Shared secret for a remote daemon
	#[arg(long, global = true)]
	token: Option<String>,
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Manage the local daemon
	#[command(subcommand)]
	Daemon(DaemonCommand),
	/// Check the daemon is alive
	Ping,
	/// List supervised processes
	#[command(alias = "ls")]
	List,
	/// Show one job by name
	Status { name: String },
	/// Start a job by name
	Start { name: String },
	/// Stop a job by name
	Stop { name: String },
	/// Restart a job by name
	Restart { name: String },
	/// Stop supervising a job, leaving a copy running
	Detach { name: String },
	/// Terminate one process by pid
	Kill { pid: u32 },
	/// Print captured stdout of a process
	Stdout {
		pid: u32,
		/// Clear the buffer after printing
		#[arg(long)]
		clear: bool,
		/// Save the buffer to the persist dir before clearing
		#[arg(long, requires = "clear")]
		persist: bool,
	},
	/// Print captured stderr of a process
	Stderr {
		pid: u32,
		#[arg(long)]
		clear: bool,
		#[arg(long, requires = "clear")]
		persist: bool,
	},
	/// CPU and memory usage of a process
	Stats { pid: u32 },
	/// Stop everything and reload job files
	Reload,
	/// Show the daemon log
	Log {
		#[arg(long)]
		clear: bool,
	},
	/// Stop the daemon and every job it supervises
	Shutdown {
		/// Leave unsupervised copies of the jobs running
		#[arg(long)]
		detach: bool,
	},
}

fn main() {
	let cli = Cli::parse();
	let paths = protocol::daemon_paths();

	let requests = match &cli.command {
		Command::Daemon(cmd) => {
			if !cmd.execute(&paths) {
				run_daemon(&paths);
			}
			return;
		}
		Command::Ping => vec![Request::Ping],
		Command::List => vec![Request::List],
		Command::Status { name } => vec![Request::Status { name: name.clone() }],
		Command::Start { name } => vec![Request::Start { name: name.clone() }],
		Command::Stop { name } => vec![Request::Stop { name: name.clone() }],
		Command::Restart { name } => vec![Request::Restart { name: name.clone() }],
		Command::Detach { name } => vec![Request::Detach { name: name.clone() }],
		Command::Kill { pid } => vec![Request::Kill { pid: *pid }],
		Command::Stdout { pid, clear, persist } => output_requests(*pid, Stream::Stdout, *clear, *persist),
		Command::Stderr { pid, clear, persist } => output_requests(*pid, Stream::Stderr, *clear, *persist),
		Command::Stats { pid } => vec![Request::Stats { pid: *pid }],
		Command::Reload => vec![Request::Reload],
		Command::Log { clear: false } => vec![Request::ReadLog],
		Command::Log { clear: true } => vec![Request::ClearLog],
		Command::Shutdown { detach } => vec![Request::Shutdown { detach: *detach }],
	};

	let autostart = cli.remote.is_none() && !matches!(cli.command, Command::Ping | Command::Shutdown { .. });
	let mut client = connect(&cli, &paths, autostart);
	for command in requests {
		let request = RpcRequest {
			token: cli.token.clone(),
			command,
		};
		match client.send(&request) {
			Ok(response) => render(response),
			Err(e) => fail(&e.to_string()),
		}
	}
}

fn run_daemon(paths: &DaemonPaths) {
	match tokio::runtime::Runtime::new() {
		Ok(runtime) => runtime.block_on(daemon::run(paths)),
		Err(e) => fail(&format!("failed to start runtime: {}", e)),
	}
}

fn output_requests(pid: u32, stream: Stream, clear: bool, persist: bool) -> Vec<Request> {
	let mut requests = vec![Request::Output { pid, stream }];
	if clear {
		requests.push(Request::ClearOutput { pid, stream, persist });
	}
	requests
}

type Client = DaemonClient<RpcRequest, Response>;

fn connect(cli: &Cli, paths: &DaemonPaths, autostart: bool) -> Client {
	if let Some(addr) = &cli.remote {
		return DaemonClient::connect_tcp(addr).unwrap_or_else(|e| fail(&e.to_string()));
	}

	match DaemonClient::connect(paths) {
		Ok(client) => return client,
		Err(ClientError::NotRunning) if autostart => {}
		Err(ClientError::NotRunning) => fail("daemon not running (start it with `keeper daemon start`)"),
		Err(e) => fail(&e.to_string()),
	}

	eprintln!("starting daemon...");
	let daemon = Daemon {
		paths: paths.clone(),
	};
	if let Err(e) = daemon.start_background(&["daemon", "run"]) {
		fail(&format!("failed to start daemon: {}", e));
	}
	for _ in 0..50 {
		std::thread::sleep(std::time::Duration::from_millis(100));
		if let Ok(client) = DaemonClient::connect(paths) {
			return client;
		}
	}
	fail("daemon did not start in time")
}

fn fail(message: &str) -> ! {
	eprintln!("{} {}", "error:".red().bold(), message);
	std::process::exit(1);
}

fn render(response: Response) {
	match response {
		Response::Ok { message } => println!("{}", message),
		Response::Pong => println!("{}", "daemon running".green()),
		Response::Processes { processes } => render_processes(&processes),
		Response::Process { process } => render_processes(std::slice::from_ref(&process)),
		Response::Stats { pid, usage } => {
			println!("{} cpu {:.1}%  mem {:.1}%", pid.bold(), usage.cpu_percent, usage.mem_percent)
		}
		Response::Output { lines } => {
			for line in lines {
				println!("{}", line);
			}
		}
		Response::Log { contents } => print!("{}", contents),
		Response::Error { message } => fail(&message),
	}
}

fn render_processes(processes: &[ProcessSummary]) {
	if processes.is_empty() {
		println!("{}", "no processes".dimmed());
		return;
	}
	let name_width = processes.iter().map(|p| p.name.len()).max().unwrap_or(4).max(4);
	for p in processes {
		let (circle, label) = if p.alive {
			("●".green().to_string(), "on".green().to_string())
		} else {
			("●".red().to_string(), "off".red().to_string())
		};
		let restarts = if p.restart_attempt > 0 {
			format!(" restarts {}", p.restart_attempt).yellow().to_string()
		} else {
			String::new()
		};
		println!(
			"{} {:<width$} {:<8} {:<8} {} {}{}",
			circle,
			p.name,
			p.pid,
			format_uptime(p.uptime_secs),
			label,
			format_timestamp(p.started_at).dimmed(),
			restarts,
			width = name_width
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;

	#[test]
	fn cli_is_well_formed() {
		Cli::command().debug_assert();
	}

	#[test]
	fn parses_remote_flags_after_subcommand() {
		let cli = Cli::try_parse_from(["keeper", "stats", "42", "--remote", "box:7070", "--token", "t"]).unwrap();
		assert_eq!(cli.remote.as_deref(), Some("box:7070"));
		assert_eq!(cli.token.as_deref(), Some("t"));
		assert!(matches!(cli.command, Command::Stats { pid: 42 }));
	}

	#[test]
	fn persist_requires_clear() {
		assert!(Cli::try_parse_from(["keeper", "stdout", "1", "--persist"]).is_err());
		let requests = output_requests(1, Stream::Stdout, true, true);
		assert_eq!(requests.len(), 2);
		assert!(matches!(requests[1], Request::ClearOutput { persist: true, .. }));
	}
}
