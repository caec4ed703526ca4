#![forbid(unsafe_code)]

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Recently seen command ids.
///
/// Holds at most `capacity` ids; each is forgotten once it is older than `ttl`
/// or when evicted as the oldest entry to make room.
#[derive(Debug)]
pub struct DedupWindow {
	capacity: usize,
	ttl: Duration,
	order: VecDeque<(String, Instant)>,
	seen: HashSet<String>,
}

impl DedupWindow {
	pub fn new(capacity: usize, ttl: Duration) -> Self {
		Self {
			capacity: capacity.max(1),
			ttl,
			order: VecDeque::new(),
			seen: HashSet::new(),
		}
	}

	/// Record `id`; returns `false` if it is already in the window.
	pub fn check_and_record(&mut self, id: &str, now: Instant) -> bool {
		self.prune(now);
		if self.seen.contains(id) {
			return false;
		}

		while self.order.len() >= self.capacity {
			if let Some((old, _)) = self.order.pop_front() {
				self.seen.remove(&old);
			}
		}

		self.order.push_back((id.to_string(), now));
		self.seen.insert(id.to_string());
		true
	}

	/// Forget ids older than the ttl. Returns how many were dropped.
	pub fn prune(&mut self, now: Instant) -> usize {
		let mut dropped = 0;
		while let Some((_, at)) = self.order.front() {
			if now.saturating_duration_since(*at) < self.ttl {
				break;
			}
			if let Some((id, _)) = self.order.pop_front() {
				self.seen.remove(&id);
				dropped += 1;
			}
		}
		dropped
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}
}
