#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Unix time (ms) of an event that happened `ago_ms` before now.
pub fn unix_ms_ago(ago_ms: u64) -> i64 {
	unix_ms_now().saturating_sub(i64::try_from(ago_ms).unwrap_or(i64::MAX))
}
