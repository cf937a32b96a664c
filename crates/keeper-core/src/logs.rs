use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Stream;

/// File a cleared buffer is appended to: `<dir>/<job> <yy-mmdd>.<stream>.json`.
pub fn persisted_output_path(dir: &Path, job: &str, stream: Stream) -> PathBuf {
	dir.join(persisted_output_name(job, stream, unix_now()))
}

pub fn persisted_output_name(job: &str, stream: Stream, now_secs: u64) -> String {
	let (year, month, day, _, _) = secs_to_datetime(now_secs);
	format!("{} {:02}-{:02}{:02}.{}.json", job, year % 100, month, day, stream)
}

/// `YYYY-MM-DD HH:MM` in UTC.
pub fn format_timestamp(secs: u64) -> String {
	let (year, month, day, hour, minute) = secs_to_datetime(secs);
	format!("{:04}-{:02}-{:02} {:02}:{:02}", year, month, day, hour, minute)
}

/// `3d 4h`, `5m 02s`, `17s`.
pub fn format_uptime(secs: u64) -> String {
	let days = secs / 86400;
	let hours = (secs % 86400) / 3600;
	let minutes = (secs % 3600) / 60;
	let seconds = secs % 60;
	if days > 0 {
		format!("{}d {}h", days, hours)
	} else if hours > 0 {
		format!("{}h {:02}m", hours, minutes)
	} else if minutes > 0 {
		format!("{}m {:02}s", minutes, seconds)
	} else {
		format!("{}s", seconds)
	}
}

pub fn unix_secs(time: SystemTime) -> u64 {
	time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub fn unix_now() -> u64 {
	unix_secs(SystemTime::now())
}

pub fn secs_to_datetime(secs: u64) -> (u32, u32, u32, u32, u32) {
	let days = (secs / 86400) as i64;
	let time_of_day = secs % 86400;
	let hour = (time_of_day / 3600) as u32;
	let minute = ((time_of_day % 3600) / 60) as u32;

	let z = days + 719468;
	let era = if z >= 0 { z } else { z - 146096 } / 146097;
	let doe = (z - era * 146097) as u32;
	let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
	let y = yoe as i64 + era * 400;
	let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
	let mp = (5 * doy + 2) / 153;
	let d = doy - (153 * mp + 2) / 5 + 1;
	let m = if mp < 10 { mp + 3 } else { mp - 9 };
	let y = if m <= 2 { y + 1 } else { y };

	(y as u32, m, d, hour, minute)
}
