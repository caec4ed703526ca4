#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::anyhow;
use katrix_platform::{ChatClient, LoginResponse, SecretString};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::server::health::HealthState;
use crate::server::sync_loop::{RetryPolicy, SyncLoop};

/// Account used for (re-)login.
#[derive(Debug, Clone)]
pub struct Credentials {
	pub user: String,
	pub password: SecretString,
}

/// Log in, retrying with bounded backoff until it succeeds.
///
/// Returns `Ok(None)` if `shutdown` fires first.
pub async fn login_with_retry(
	client: &dyn ChatClient,
	creds: &Credentials,
	policy: &RetryPolicy,
	shutdown: &mut watch::Receiver<bool>,
) -> Option<LoginResponse> {
	let mut attempt: u32 = 0;
	loop {
		if *shutdown.borrow() {
			return None;
		}

		match client.login(&creds.user, &creds.password).await {
			Ok(resp) => {
				info!(user = %resp.user_id, device = %resp.device_id, attempts = attempt + 1, "logged in");
				metrics::counter!("katrix_logins_total", "result" => "ok").increment(1);
				return Some(resp);
			}
			Err(e) => {
				let wait = katrix_util::backoff::backoff_delay(attempt, policy.min_delay, policy.max_delay);
				metrics::counter!("katrix_logins_total", "result" => "error").increment(1);
				if e.is_auth() || e.status_code() == Some(403) {
					error!(user = %creds.user, error = %e, "login rejected; check credentials");
				} else {
					warn!(user = %creds.user, error = %e, retry_in_ms = wait.as_millis(), "login failed; retrying");
				}
				attempt = attempt.saturating_add(1);
				tokio::select! {
					_ = shutdown.changed() => return None,
					_ = tokio::time::sleep(wait) => {}
				}
			}
		}
	}
}

/// Keeps the sync loop logged in.
///
/// An auth error escaping the loop triggers one forced re-login; a second
/// escape after that recovery ends the daemon.
pub struct Supervisor {
	client: Arc<dyn ChatClient>,
	creds: Credentials,
	policy: RetryPolicy,
	health: HealthState,
}

impl Supervisor {
	pub fn new(client: Arc<dyn ChatClient>, creds: Credentials, policy: RetryPolicy, health: HealthState) -> Self {
		Self {
			client,
			creds,
			policy,
			health,
		}
	}

	pub async fn run(&self, sync: &mut SyncLoop, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		if login_with_retry(self.client.as_ref(), &self.creds, &self.policy, &mut shutdown)
			.await
			.is_none()
		{
			return Ok(());
		}

		let mut recovered = false;
		loop {
			let Err(e) = sync.run(shutdown.clone()).await else {
				info!("sync loop stopped");
				return Ok(());
			};

			self.health.mark_not_ready();
			if recovered {
				error!(error = %e, "sync failed again after forced re-login; giving up");
				return Err(anyhow!(e).context("sync loop failed after re-login"));
			}

			warn!(error = %e, cursor = ?sync.state().since(), "session lost; forcing re-login");
			metrics::counter!("katrix_forced_relogins_total").increment(1);
			if login_with_retry(self.client.as_ref(), &self.creds, &self.policy, &mut shutdown)
				.await
				.is_none()
			{
				return Ok(());
			}
			self.health.mark_ready();
			recovered = true;
		}
	}
}
