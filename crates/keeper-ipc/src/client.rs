use std::io::{self, BufRead, BufReader, Read, Write};
use std::marker::PhantomData;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use serde::{de::DeserializeOwned, Serialize};

use crate::paths::DaemonPaths;

/// Errors from daemon client operations.
#[derive(Debug)]
pub enum ClientError {
	/// Daemon is not running (socket not found).
	NotRunning,
	/// Remote daemon could not be reached.
	Unreachable(String, io::Error),
	/// Daemon closed the connection before answering.
	Closed,
	/// IO error during communication.
	Io(io::Error),
	/// Failed to serialize request.
	Serialize(String),
	/// Failed to deserialize response.
	Deserialize(String),
}

impl std::fmt::Display for ClientError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ClientError::NotRunning => write!(f, "daemon not running"),
			ClientError::Unreachable(addr, e) => write!(f, "cannot reach {}: {}", addr, e),
			ClientError::Closed => write!(f, "connection closed by daemon"),
			ClientError::Io(e) => write!(f, "io error: {}", e),
			ClientError::Serialize(e) => write!(f, "serialize error: {}", e),
			ClientError::Deserialize(e) => write!(f, "deserialize error: {}", e),
		}
	}
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
	fn from(e: io::Error) -> Self {
		ClientError::Io(e)
	}
}

/// Synchronous client for a daemon speaking newline-delimited JSON.
///
/// Generic over request and response types. Works over the local Unix socket
/// or a TCP connection to a remote daemon.
pub struct DaemonClient<Req, Resp> {
	reader: BufReader<Box<dyn Read + Send>>,
	writer: Box<dyn Write + Send>,
	_phantom: PhantomData<(Req, Resp)>,
}

impl<Req, Resp> DaemonClient<Req, Resp>
where
	Req: Serialize,
	Resp: DeserializeOwned,
{
	/// Connect to an already-running local daemon.
	/// Returns `Err(ClientError::NotRunning)` if the socket doesn't exist.
	pub fn connect(paths: &DaemonPaths) -> Result<Self, ClientError> {
		let stream =
			UnixStream::connect(paths.socket_path()).map_err(|_| ClientError::NotRunning)?;
		let read_half = stream.try_clone()?;
		Ok(Self::from_parts(Box::new(read_half), Box::new(stream)))
	}

	/// Connect to a daemon's TCP listener, e.g. `host:7070`.
	pub fn connect_tcp(addr: &str) -> Result<Self, ClientError> {
		let stream =
			TcpStream::connect(addr).map_err(|e| ClientError::Unreachable(addr.to_string(), e))?;
		let read_half = stream.try_clone()?;
		Ok(Self::from_parts(Box::new(read_half), Box::new(stream)))
	}

	fn from_parts(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
		Self {
			reader: BufReader::new(reader),
			writer,
			_phantom: PhantomData,
		}
	}

	/// Send a request and receive a response.
	pub fn send(&mut self, request: &Req) -> Result<Resp, ClientError> {
		let mut data =
			serde_json::to_vec(request).map_err(|e| ClientError::Serialize(e.to_string()))?;
		data.push(b'\n');
		self.writer.write_all(&data)?;
		self.writer.flush()?;

		let mut line = String::new();
		if self.reader.read_line(&mut line)? == 0 {
			return Err(ClientError::Closed);
		}

		serde_json::from_str(&line).map_err(|e| ClientError::Deserialize(e.to_string()))
	}
}

/// Check if a daemon is running (socket is connectable).
pub fn is_running(paths: &DaemonPaths) -> bool {
	UnixStream::connect(paths.socket_path()).is_ok()
}

/// Read the PID of a running daemon from its PID file.
pub fn read_pid(paths: &DaemonPaths) -> Option<u32> {
	std::fs::read_to_string(paths.pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}
