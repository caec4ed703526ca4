#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use tracing::trace;

/// Duration-valued token bucket.
///
/// Throughput is tracked as accumulated time: each admitted unit costs `cost`,
/// the budget refills with elapsed wall-clock time and never exceeds
/// `capacity`. Starting full, `capacity / cost` units pass back to back, then
/// one unit per `cost` of real time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
	capacity: Duration,
	cost: Duration,
	available: Duration,
	last_refill: Instant,
}

impl TokenBucket {
	pub fn new(capacity: Duration, cost: Duration) -> Self {
		Self::new_at(capacity, cost, Instant::now())
	}

	pub fn new_at(capacity: Duration, cost: Duration, now: Instant) -> Self {
		Self {
			capacity,
			cost,
			available: capacity,
			last_refill: now,
		}
	}

	/// Admit `quantity` units if the budget covers them. Never blocks.
	pub fn request(&mut self, quantity: u32) -> bool {
		self.request_at(quantity, Instant::now())
	}

	pub fn request_at(&mut self, quantity: u32, now: Instant) -> bool {
		self.refill(now);

		let required = self.cost.saturating_mul(quantity);
		let admitted = required <= self.available;
		if admitted {
			self.available -= required;
		}

		trace!(quantity, admitted, available_ms = self.available.as_millis(), "bucket request");
		admitted
	}

	/// Whether at least one unit could be admitted right now (without refilling).
	pub fn has_capacity(&self) -> bool {
		self.available >= self.cost
	}

	pub fn available(&self) -> Duration {
		self.available
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last_refill);
		self.available = (self.available + elapsed).min(self.capacity);
		self.last_refill = now;
	}
}
