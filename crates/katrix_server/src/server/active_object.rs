#![forbid(unsafe_code)]

//! Single-worker task queue with a gate.
//!
//! Work is submitted without blocking and runs strictly in submission order on
//! one background task. Before each task the worker waits until the gate reads
//! `true`, so work submitted while the gate is closed is held, not dropped.

use std::panic::AssertUnwindSafe;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

enum Job {
	Run(BoxFuture<'static, ()>),
	Flush(oneshot::Sender<()>),
	Stop,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct ActiveObject {
	name: &'static str,
	tx: mpsc::UnboundedSender<Job>,
	worker: JoinHandle<()>,
}

impl ActiveObject {
	/// Start a worker that always runs.
	pub fn new(name: &'static str) -> Self {
		let (_gate_tx, gate_rx) = watch::channel(true);
		Self::spawn(name, gate_rx, false)
	}

	/// Start a worker that runs a task only while `gate` reads `true`.
	pub fn gated(name: &'static str, gate: watch::Receiver<bool>) -> Self {
		Self::spawn(name, gate, true)
	}

	fn spawn(name: &'static str, gate: watch::Receiver<bool>, gated: bool) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		let worker = tokio::spawn(run_worker(name, rx, gate, gated));
		Self { name, tx, worker }
	}

	/// Enqueue a unit of work; returns immediately.
	pub fn submit<F>(&self, task: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		if self.tx.send(Job::Run(task.boxed())).is_err() {
			warn!(worker = self.name, "active object stopped; task dropped");
		}
	}

	/// Wait until everything submitted before this call has run.
	pub async fn flush(&self) {
		let (done_tx, done_rx) = oneshot::channel();
		if self.tx.send(Job::Flush(done_tx)).is_ok() {
			let _ = done_rx.await;
		}
	}

	/// Enqueue the stop sentinel and wait for the worker to drain and exit.
	///
	/// Tasks queued ahead of the sentinel still run (subject to the gate).
	pub async fn shutdown(self) {
		let _ = self.tx.send(Job::Stop);
		if let Err(e) = self.worker.await {
			error!(worker = self.name, error = %e, "active object worker failed");
		}
	}
}

async fn run_worker(name: &'static str, mut rx: mpsc::UnboundedReceiver<Job>, mut gate: watch::Receiver<bool>, gated: bool) {
	debug!(worker = name, "active object started");

	while let Some(job) = rx.recv().await {
		match job {
			Job::Stop => break,
			Job::Flush(done) => {
				let _ = done.send(());
			}
			Job::Run(task) => {
				if gated && gate.wait_for(|open| *open).await.is_err() {
					warn!(worker = name, "active object gate closed for good; stopping");
					break;
				}

				if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
					let msg = panic
						.downcast_ref::<&str>()
						.map(|s| s.to_string())
						.or_else(|| panic.downcast_ref::<String>().cloned())
						.unwrap_or_else(|| "unknown panic".to_string());
					error!(worker = name, panic = %msg, "active object task panicked");
					metrics::counter!("katrix_active_object_task_panics_total", "worker" => name).increment(1);
				}
			}
		}
	}

	debug!(worker = name, "active object stopped");
}
