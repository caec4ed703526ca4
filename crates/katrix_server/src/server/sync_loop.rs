#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use katrix_platform::{ChatClient, ChatError, SyncOptions};
use katrix_util::backoff::backoff_delay;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::server::dispatcher::Dispatcher;
use crate::server::health::HealthState;

/// Where the long-poll loop stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
	/// No cursor yet. `attempt` counts consecutive failed initial syncs.
	Initial { attempt: u32 },
	/// Cursor known; each success re-arms with the new cursor.
	Steady { cursor: String },
	/// The last call failed; retry with the last known cursor.
	ErrorRetry { cursor: String, attempt: u32 },
}

impl SyncState {
	pub fn since(&self) -> Option<&str> {
		match self {
			Self::Initial { .. } => None,
			Self::Steady { cursor } | Self::ErrorRetry { cursor, .. } => Some(cursor),
		}
	}

	pub fn is_initial(&self) -> bool {
		matches!(self, Self::Initial { .. })
	}
}

/// Retry pacing.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub min_delay: Duration,
	pub max_delay: Duration,
}

impl RetryPolicy {
	fn delay(&self, attempt: u32) -> Duration {
		backoff_delay(attempt, self.min_delay, self.max_delay)
	}
}

/// What the driver does after one sync call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
	pub next: SyncState,
	/// Pause before the next call.
	pub wait: Duration,
	/// Run the maintenance pass (only after a successful continuation).
	pub maintenance: bool,
}

/// Result of one sync call, reduced to what the state machine needs.
#[derive(Debug, Clone, Copy)]
pub enum SyncResult<'a> {
	Ok { next_batch: &'a str },
	/// `clean_empty` is the "no data yet" condition.
	Err { clean_empty: bool },
}

/// Pure transition function of the sync loop.
pub fn step(state: &SyncState, result: SyncResult<'_>, policy: &RetryPolicy) -> Transition {
	match (state, result) {
		(SyncState::Initial { .. }, SyncResult::Ok { next_batch }) => Transition {
			next: SyncState::Steady {
				cursor: next_batch.to_string(),
			},
			wait: Duration::ZERO,
			maintenance: false,
		},
		(SyncState::Initial { attempt }, SyncResult::Err { clean_empty: false }) => Transition {
			next: SyncState::Initial { attempt: attempt + 1 },
			// First retry is immediate, later ones back off.
			wait: if *attempt == 0 {
				Duration::ZERO
			} else {
				policy.delay(attempt - 1)
			},
			maintenance: false,
		},
		(SyncState::Initial { attempt }, SyncResult::Err { clean_empty: true }) => Transition {
			next: SyncState::Initial { attempt: *attempt },
			wait: policy.min_delay,
			maintenance: false,
		},
		(SyncState::Steady { .. } | SyncState::ErrorRetry { .. }, SyncResult::Ok { next_batch }) => Transition {
			next: SyncState::Steady {
				cursor: next_batch.to_string(),
			},
			wait: Duration::ZERO,
			maintenance: true,
		},
		(SyncState::Steady { cursor }, SyncResult::Err { .. }) => Transition {
			next: SyncState::ErrorRetry {
				cursor: cursor.clone(),
				attempt: 0,
			},
			wait: policy.delay(0),
			maintenance: false,
		},
		(SyncState::ErrorRetry { cursor, attempt }, SyncResult::Err { .. }) => Transition {
			next: SyncState::ErrorRetry {
				cursor: cursor.clone(),
				attempt: attempt + 1,
			},
			wait: policy.delay(attempt + 1),
			maintenance: false,
		},
	}
}

/// Long-poll driver. Keeps its state across runs so a re-login resumes from the
/// last cursor.
pub struct SyncLoop {
	client: Arc<dyn ChatClient>,
	dispatcher: Arc<Dispatcher>,
	settings: SyncSettings,
	health: Option<HealthState>,
	state: SyncState,
}

impl SyncLoop {
	pub fn new(client: Arc<dyn ChatClient>, dispatcher: Arc<Dispatcher>, settings: SyncSettings) -> Self {
		Self {
			client,
			dispatcher,
			settings,
			health: None,
			state: SyncState::Initial { attempt: 0 },
		}
	}

	pub fn with_health(mut self, health: HealthState) -> Self {
		self.health = Some(health);
		self
	}

	pub fn state(&self) -> &SyncState {
		&self.state
	}

	fn policy(&self) -> RetryPolicy {
		RetryPolicy {
			min_delay: self.settings.retry_min_delay,
			max_delay: self.settings.retry_max_delay,
		}
	}

	/// Run until `shutdown` flips to `true` (returns `Ok`) or an auth error
	/// escapes (returns it, state intact).
	pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ChatError> {
		loop {
			if *shutdown.borrow() {
				return Ok(());
			}

			let wait = tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				res = self.tick() => res?,
			};

			if !wait.is_zero() {
				tokio::select! {
					_ = shutdown.changed() => return Ok(()),
					_ = tokio::time::sleep(wait) => {}
				}
			}
		}
	}

	/// One sync call plus its transition. Returns how long to wait before the next.
	pub async fn tick(&mut self) -> Result<Duration, ChatError> {
		let opts = SyncOptions {
			since: self.state.since().map(str::to_string),
			timeout: if self.state.is_initial() {
				Duration::ZERO
			} else {
				self.settings.timeout
			},
		};

		let policy = self.policy();
		match self.client.sync(&opts).await {
			Ok(resp) => {
				let was_initial = self.state.is_initial();
				let t = step(
					&self.state,
					SyncResult::Ok {
						next_batch: &resp.next_batch,
					},
					&policy,
				);
				// Cursor first; maintenance runs against the new state.
				self.state = t.next;

				if was_initial {
					info!(rooms = resp.rooms.len(), "initial sync complete");
					if let Some(h) = &self.health {
						h.mark_ready();
					}
				}

				self.dispatcher.observe_sync(&resp, !was_initial);
				if t.maintenance {
					self.dispatcher.maintenance();
				}
				Ok(t.wait)
			}
			Err(e) if e.is_auth() => {
				warn!(error = %e, "sync rejected credentials");
				metrics::counter!("katrix_sync_errors_total", "kind" => "auth").increment(1);
				Err(e)
			}
			Err(e) => {
				let clean_empty = e.is_clean_empty();
				let t = step(&self.state, SyncResult::Err { clean_empty }, &policy);
				if clean_empty {
					debug!(error = %e, "sync returned no data");
				} else {
					warn!(
						error = %e,
						state = ?self.state,
						retry_in_ms = t.wait.as_millis(),
						"sync failed; retrying"
					);
				}
				metrics::counter!("katrix_sync_errors_total", "kind" => if clean_empty { "empty" } else { "error" })
					.increment(1);
				self.state = t.next;
				Ok(t.wait)
			}
		}
	}
}
