use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};

use crate::paths::DaemonPaths;

/// Serves newline-delimited JSON requests on the daemon's Unix socket.
///
/// Malformed lines are dropped. Use [`run_socket_server_with_error`] to answer
/// them instead.
pub async fn run_socket_server<Req, Resp, F, Fut>(paths: &DaemonPaths, handler: F)
where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
{
	run_socket_server_with_error(paths, handler, None::<fn(String) -> Resp>).await;
}

pub async fn run_socket_server_with_error<Req, Resp, F, Fut, E>(
	paths: &DaemonPaths,
	handler: F,
	on_invalid: Option<E>,
) where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let socket_path = paths.socket_path();
	let listener = match bind_unix(&socket_path) {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind socket {}: {}", socket_path.display(), e);
			return;
		}
	};

	tracing::info!("listening on {}", socket_path.display());

	let handler = Arc::new(handler);
	let on_invalid = Arc::new(on_invalid);

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let handler = Arc::clone(&handler);
		let on_invalid = Arc::clone(&on_invalid);
		tokio::spawn(async move {
			handle_connection(stream, handler, on_invalid).await;
		});
	}
}

fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
	if path.exists() {
		let _ = std::fs::remove_file(path);
	}
	UnixListener::bind(path)
}

/// Binds a TCP listener for remote clients. Split from [`run_tcp_server`] so
/// callers can learn the bound address before serving.
pub async fn bind_tcp(addr: SocketAddr) -> std::io::Result<TcpListener> {
	TcpListener::bind(addr).await
}

/// Serves the same line protocol as the Unix socket over TCP.
pub async fn run_tcp_server<Req, Resp, F, Fut, E>(
	listener: TcpListener,
	handler: F,
	on_invalid: Option<E>,
) where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	if let Ok(addr) = listener.local_addr() {
		tracing::info!("listening on tcp {}", addr);
	}

	let handler = Arc::new(handler);
	let on_invalid = Arc::new(on_invalid);

	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};
		tracing::debug!("rpc connection from {}", peer);

		let handler = Arc::clone(&handler);
		let on_invalid = Arc::clone(&on_invalid);
		tokio::spawn(async move {
			handle_connection(stream, handler, on_invalid).await;
		});
	}
}

async fn handle_connection<S, Req, Resp, F, Fut, E>(
	stream: S,
	handler: Arc<F>,
	on_invalid: Arc<Option<E>>,
) where
	S: AsyncRead + AsyncWrite + Send + 'static,
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let (reader, mut writer) = tokio::io::split(stream);
	let mut lines = BufReader::new(reader).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		let response = match serde_json::from_str::<Req>(&line) {
			Ok(request) => handler(request).await,
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				match &*on_invalid {
					Some(on_invalid) => on_invalid(format!("invalid request: {}", e)),
					None => continue,
				}
			}
		};

		let mut data = match serde_json::to_vec(&response) {
			Ok(d) => d,
			Err(e) => {
				tracing::error!("failed to serialize response: {}", e);
				continue;
			}
		};
		data.push(b'\n');

		if writer.write_all(&data).await.is_err() {
			break;
		}
	}
}
