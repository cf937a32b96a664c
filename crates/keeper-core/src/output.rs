use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;

pub const DEFAULT_OUTPUT_LINES: usize = 1000;

/// Bounded, ordered line buffer for one output stream of one process.
///
/// Clones share the same storage. Once `capacity` lines are held the oldest
/// line is dropped for every new one.
#[derive(Clone)]
pub struct OutputBuffer {
	lines: Arc<Mutex<VecDeque<String>>>,
	capacity: usize,
}

impl OutputBuffer {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
			capacity,
		}
	}

	pub async fn push_line(&self, line: String) {
		let mut lines = self.lines.lock().await;
		if lines.len() >= self.capacity {
			lines.pop_front();
		}
		lines.push_back(line);
	}

	pub async fn snapshot(&self) -> Vec<String> {
		let lines = self.lines.lock().await;
		lines.iter().cloned().collect()
	}

	pub async fn len(&self) -> usize {
		self.lines.lock().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.lines.lock().await.is_empty()
	}

	/// Empties the buffer, first appending it as one JSON array line to
	/// `persist_to` when given. A failed save is logged; the buffer is
	/// cleared regardless.
	pub async fn clear(&self, persist_to: Option<&Path>) {
		let mut lines = self.lines.lock().await;
		if let Some(path) = persist_to {
			if let Err(e) = persist(path, lines.make_contiguous()) {
				tracing::warn!("failed to save output buffer to {}: {}", path.display(), e);
			}
		}
		lines.clear();
	}
}

fn persist(path: &Path, lines: &[String]) -> std::io::Result<()> {
	if let Some(dir) = path.parent() {
		fs::create_dir_all(dir)?;
	}
	let mut data = serde_json::to_vec(lines)?;
	data.push(b'\n');
	let mut file = OpenOptions::new().create(true).append(true).open(path)?;
	file.write_all(&data)
}

/// Splits a child's pipe into lines.
///
/// A trailing line without a newline is kept; invalid UTF-8 is replaced.
pub struct LineReader<R> {
	reader: BufReader<R>,
	raw: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
	pub fn new(reader: R) -> Self {
		Self {
			reader: BufReader::new(reader),
			raw: Vec::with_capacity(256),
		}
	}

	/// `None` once the pipe is closed or unreadable.
	pub async fn next_line(&mut self) -> Option<String> {
		self.raw.clear();
		match self.reader.read_until(b'\n', &mut self.raw).await {
			Ok(0) => None,
			Ok(_) => {
				if self.raw.last() == Some(&b'\n') {
					self.raw.pop();
				}
				if self.raw.last() == Some(&b'\r') {
					self.raw.pop();
				}
				Some(String::from_utf8_lossy(&self.raw).into_owned())
			}
			Err(e) => {
				tracing::debug!("output capture ended: {}", e);
				None
			}
		}
	}
}
