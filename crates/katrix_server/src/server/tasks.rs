#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts spawned chat operations so callers can wait for them to settle.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
	inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	count: AtomicUsize,
	idle: Notify,
}

struct Guard(Arc<Inner>);

impl Drop for Guard {
	fn drop(&mut self) {
		if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.0.idle.notify_waiters();
		}
	}
}

impl InFlight {
	pub fn new() -> Self {
		Self::default()
	}

	/// Spawn `fut` on the runtime and track it until it finishes (or panics).
	pub fn spawn<F>(&self, fut: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		self.inner.count.fetch_add(1, Ordering::AcqRel);
		let guard = Guard(Arc::clone(&self.inner));
		tokio::spawn(async move {
			let _guard = guard;
			fut.await;
		});
	}

	pub fn len(&self) -> usize {
		self.inner.count.load(Ordering::Acquire)
	}

	/// Wait until nothing is in flight, including work spawned while waiting.
	pub async fn settle(&self) {
		loop {
			let idle = self.inner.idle.notified();
			tokio::pin!(idle);
			idle.as_mut().enable();
			if self.len() == 0 {
				return;
			}
			idle.await;
		}
	}
}
