pub mod api;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use keeper_core::{ControlPlane, Registry, Supervisor, SupervisorError};
use keeper_ipc::{Daemon, DaemonPaths};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::config::{self, JobDir};
use crate::protocol::{Request, Response, RpcRequest};

pub async fn run(paths: &DaemonPaths) {
	init_logging(&paths.log_path());

	let global_config = config::load_global_config(paths);
	let daemon = Daemon {
		paths: paths.clone(),
	};
	if let Err(e) = daemon.prepare() {
		tracing::error!("failed to prepare {}: {}", paths.state_dir().display(), e);
		return;
	}

	let supervisor = Supervisor::new(Registry::new(), global_config.supervisor.to_config(paths));
	let jobs = JobDir::new(global_config.daemon.jobs_dir(paths));
	tracing::info!("loading jobs from {}", jobs.dir().display());
	let control = Arc::new(ControlPlane::new(supervisor, Arc::new(jobs)).with_log_path(paths.log_path()));

	match control.launch_all().await {
		Ok(started) => tracing::info!("launched {} job(s)", started),
		Err(e) => tracing::error!("{}", e),
	}

	let token: Option<Arc<str>> = global_config.daemon.token.as_deref().map(Arc::from);

	// Local socket: trusted, no token.
	let control_socket = Arc::clone(&control);
	let paths_socket = paths.clone();
	let socket_handle = tokio::spawn(async move {
		keeper_ipc::server::run_socket_server_with_error(
			&paths_socket,
			move |req: RpcRequest| {
				let control = Arc::clone(&control_socket);
				async move { handle_request(&control, req.command).await }
			},
			Some(|message: String| Response::Error { message }),
		)
		.await;
	});

	if let Some(addr) = &global_config.daemon.rpc_addr {
		match addr.parse::<SocketAddr>() {
			Ok(addr) => match keeper_ipc::server::bind_tcp(addr).await {
				Ok(listener) => {
					let control_tcp = Arc::clone(&control);
					let token = token.clone();
					tokio::spawn(keeper_ipc::server::run_tcp_server(
						listener,
						move |req: RpcRequest| {
							let control = Arc::clone(&control_tcp);
							let token = token.clone();
							async move { handle_remote(&control, token.as_deref(), req).await }
						},
						Some(|message: String| Response::Error { message }),
					));
				}
				Err(e) => tracing::error!("failed to bind RPC on {}: {}", addr, e),
			},
			Err(e) => tracing::error!("invalid rpc_addr {}: {}", addr, e),
		}
	}

	if let Some(port) = global_config.daemon.http_port {
		let control_http = Arc::clone(&control);
		let bind = global_config.daemon.http_bind.clone();
		let token = global_config.daemon.token.clone();
		tokio::spawn(async move {
			run_http_server(control_http, token, &bind, port).await;
		});
	}

	tracing::info!("daemon started (pid {})", std::process::id());

	wait_for_exit(&control, socket_handle).await;

	daemon.cleanup();
	tracing::info!("daemon stopped");
}

/// Returns once the daemon should exit. Jobs are stopped on every path
/// except an RPC shutdown, which has already dealt with them.
async fn wait_for_exit(control: &ControlPlane, socket: JoinHandle<()>) {
	let mut shutdown = control.subscribe_shutdown();
	let mut terminate = match signal(SignalKind::terminate()) {
		Ok(s) => Some(s),
		Err(e) => {
			tracing::warn!("cannot listen for SIGTERM: {}", e);
			None
		}
	};

	tokio::select! {
		_ = socket => {
			tracing::error!("control socket is gone, stopping jobs");
			control.shutdown(false).await;
		}
		_ = shutdown.changed() => {
			tracing::info!("shutdown requested");
			// let the reply reach the client
			tokio::time::sleep(std::time::Duration::from_millis(100)).await;
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("interrupted, stopping jobs");
			control.shutdown(false).await;
		}
		_ = async {
			match terminate.as_mut() {
				Some(s) => { s.recv().await; }
				None => std::future::pending::<()>().await,
			}
		} => {
			tracing::info!("terminated, stopping jobs");
			control.shutdown(false).await;
		}
	}
}

fn init_logging(log_path: &Path) {
	let builder = tracing_subscriber::fmt()
		.with_max_level(tracing::Level::INFO)
		.with_target(false);

	if let Some(dir) = log_path.parent() {
		let _ = std::fs::create_dir_all(dir);
	}
	match std::fs::OpenOptions::new().create(true).append(true).open(log_path) {
		Ok(file) => builder
			.with_ansi(false)
			.with_writer(std::sync::Mutex::new(file))
			.init(),
		Err(e) => {
			builder.with_writer(std::io::stderr).init();
			tracing::warn!("cannot open {}: {}, logging to stderr", log_path.display(), e);
		}
	}
}

/// Token gate for the TCP listener.
pub async fn handle_remote(control: &ControlPlane, token: Option<&str>, request: RpcRequest) -> Response {
	if let Some(expected) = token {
		if request.token.as_deref() != Some(expected) {
			tracing::warn!("rejected remote request with bad token");
			return Response::Error {
				message: "unauthorized".to_string(),
			};
		}
	}
	handle_request(control, request.command).await
}

pub async fn handle_request(control: &ControlPlane, request: Request) -> Response {
	match request {
		Request::Ping => Response::Pong,
		Request::List => Response::Processes {
			processes: control.list_all().await,
		},
		Request::Status { name } => reply(control.status_by_name(&name).await, |process| Response::Process { process }),
		Request::Start { name } => message(control.start_by_name(&name).await),
		Request::Stop { name } => message(control.stop_by_name(&name).await),
		Request::Restart { name } => message(control.restart_by_name(&name).await),
		Request::Detach { name } => message(control.detach_by_name(&name).await),
		Request::Kill { pid } => message(control.kill(pid).await),
		Request::StartPid { pid } => message(control.start_pid(pid).await),
		Request::RestartPid { pid } => message(control.restart_pid(pid).await),
		Request::DetachPid { pid } => message(control.detach_pid(pid).await),
		Request::Stats { pid } => reply(control.stats(pid).await, |usage| Response::Stats { pid, usage }),
		Request::Output { pid, stream } => reply(control.read_output(pid, stream).await, |lines| Response::Output { lines }),
		Request::ClearOutput { pid, stream, persist } => message(control.clear_output(pid, stream, persist).await),
		Request::Reload => message(control.reload().await),
		Request::Shutdown { detach } => Response::Ok {
			message: control.shutdown(detach).await,
		},
		Request::ReadLog => reply(control.read_log().await, |contents| Response::Log { contents }),
		Request::ClearLog => message(control.clear_log().await),
	}
}

fn reply<T>(result: Result<T, SupervisorError>, ok: impl FnOnce(T) -> Response) -> Response {
	match result {
		Ok(value) => ok(value),
		Err(e) => {
			tracing::debug!("request failed ({}): {}", e.as_label(), e);
			Response::Error { message: e.to_string() }
		}
	}
}

fn message(result: Result<String, SupervisorError>) -> Response {
	reply(result, |message| Response::Ok { message })
}

async fn run_http_server(control: Arc<ControlPlane>, token: Option<String>, bind: &str, port: u16) {
	let app = api::router(control, token);
	let addr = format!("{}:{}", bind, port);
	let listener = match tokio::net::TcpListener::bind(&addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind HTTP on {}: {}", addr, e);
			return;
		}
	};
	tracing::info!("HTTP listening on {}", addr);
	if let Err(e) = axum::serve(listener, app).await {
		tracing::error!("HTTP server error: {}", e);
	}
}
