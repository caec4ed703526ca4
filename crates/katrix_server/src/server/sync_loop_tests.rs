#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use katrix_platform::{JoinedRoom, SecretString};
use katrix_protocol::{IpcMessage, pb};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::SyncSettings;
use crate::server::dispatcher::Dispatcher;
use crate::server::health::HealthState;
use crate::server::supervisor::{Credentials, Supervisor};
use crate::server::sync_loop::{RetryPolicy, SyncLoop, SyncState};
use crate::server::test_support::{MemoryMailbox, MockClient, bridge_settings, http_error, room, sync_ok};
use crate::server::transport::Mailbox;

fn sync_settings() -> SyncSettings {
	SyncSettings {
		timeout: Duration::from_secs(30),
		retry_min_delay: Duration::from_millis(1),
		retry_max_delay: Duration::from_millis(5),
	}
}

struct Harness {
	client: Arc<MockClient>,
	mailbox: Arc<MemoryMailbox>,
	dispatcher: Arc<Dispatcher>,
	health: HealthState,
	sync: SyncLoop,
}

fn harness() -> Harness {
	let client = Arc::new(MockClient::new());
	let mailbox = Arc::new(MemoryMailbox::new());
	let dispatcher = Dispatcher::new(client.clone(), mailbox.clone(), bridge_settings());
	let health = HealthState::new();
	let sync = SyncLoop::new(client.clone(), dispatcher.clone(), sync_settings()).with_health(health.clone());
	Harness {
		client,
		mailbox,
		dispatcher,
		health,
		sync,
	}
}

fn since_of_calls(client: &MockClient) -> Vec<Option<String>> {
	client.sync_calls.lock().iter().map(|o| o.since.clone()).collect()
}

#[tokio::test]
async fn resumes_from_last_cursor_after_errors() {
	let mut h = harness();
	h.client.script_sync(sync_ok("s1", Vec::new()));
	h.client.script_sync(sync_ok("s2", Vec::new()));
	h.client.script_sync(Err(http_error(502, "")));
	h.client.script_sync(Err(http_error(502, "")));
	h.client.script_sync(sync_ok("s3", Vec::new()));

	for _ in 0..5 {
		h.sync.tick().await.expect("tick");
	}

	assert_eq!(
		since_of_calls(&h.client),
		vec![
			None,
			Some("s1".to_string()),
			Some("s2".to_string()),
			Some("s2".to_string()),
			Some("s2".to_string()),
		]
	);
	assert_eq!(
		*h.sync.state(),
		SyncState::Steady {
			cursor: "s3".to_string()
		}
	);

	let calls = h.client.sync_calls.lock();
	assert_eq!(calls[0].timeout, Duration::ZERO);
	assert_eq!(calls[1].timeout, Duration::from_secs(30));
}

#[tokio::test]
async fn initial_failures_keep_retrying_without_a_cursor() {
	let mut h = harness();
	h.client.script_sync(Err(http_error(500, "M_UNKNOWN")));
	h.client.script_sync(Err(http_error(500, "M_UNKNOWN")));
	h.client.script_sync(sync_ok("s1", Vec::new()));

	assert_eq!(h.sync.tick().await.expect("tick"), Duration::ZERO);
	assert_eq!(h.sync.tick().await.expect("tick"), Duration::from_millis(1));
	assert!(!h.health.is_ready());
	h.sync.tick().await.expect("tick");

	assert_eq!(since_of_calls(&h.client), vec![None, None, None]);
	assert!(h.health.is_ready());
}

#[tokio::test]
async fn inbound_queue_drains_only_after_steady_success() {
	let mut h = harness();
	h.mailbox.push(IpcMessage::Platform(pb::PlatformMessage {
		id: "1".to_string(),
		content: "hello".to_string(),
		..Default::default()
	}));
	h.client.script_sync(sync_ok(
		"s1",
		vec![JoinedRoom {
			room_id: room(),
			timeline: Vec::new(),
		}],
	));
	h.client.script_sync(Err(http_error(502, "")));
	h.client.script_sync(sync_ok("s2", Vec::new()));

	h.sync.tick().await.expect("initial");
	assert!(h.mailbox.has_msgs(), "initial sync does not run maintenance");
	assert_eq!(h.dispatcher.rooms().len(), 1);

	h.sync.tick().await.expect("error");
	assert!(h.mailbox.has_msgs(), "errors skip maintenance");

	h.sync.tick().await.expect("steady");
	assert!(!h.mailbox.has_msgs());
	timeout(Duration::from_secs(5), h.dispatcher.settle())
		.await
		.expect("settled");
	assert_eq!(h.client.sent_bodies(), vec!["hello"]);
}

#[tokio::test]
async fn auth_error_escapes_with_state_intact() {
	let mut h = harness();
	h.client.script_sync(sync_ok("s1", Vec::new()));
	h.client.script_sync(Err(http_error(401, "M_UNKNOWN_TOKEN")));

	h.sync.tick().await.expect("initial");
	let err = h.sync.tick().await.expect_err("auth error");
	assert!(err.is_auth());
	assert_eq!(h.sync.state().since(), Some("s1"));
}

#[tokio::test]
async fn run_stops_on_shutdown() {
	let mut h = harness();
	h.client.script_sync(sync_ok("s1", Vec::new()));
	let (tx, rx) = watch::channel(false);

	let handle = tokio::spawn(async move {
		let res = h.sync.run(rx).await;
		(res, h.sync)
	});
	tokio::time::sleep(Duration::from_millis(20)).await;
	tx.send(true).expect("signal");

	let (res, sync) = timeout(Duration::from_secs(5), handle)
		.await
		.expect("stopped")
		.expect("join");
	assert!(res.is_ok());
	assert_eq!(sync.state().since(), Some("s1"));
}

fn supervisor(h: &Harness) -> Supervisor {
	Supervisor::new(
		h.client.clone(),
		Credentials {
			user: "bot".to_string(),
			password: SecretString::new("hunter2"),
		},
		RetryPolicy {
			min_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(5),
		},
		h.health.clone(),
	)
}

#[tokio::test]
async fn second_session_loss_after_relogin_is_fatal() {
	let mut h = harness();
	h.client.fail_next_login(http_error(502, ""));
	h.client.script_sync(sync_ok("s1", Vec::new()));
	h.client.script_sync(Err(http_error(401, "M_UNKNOWN_TOKEN")));
	h.client.script_sync(sync_ok("s2", Vec::new()));
	h.client.script_sync(Err(http_error(401, "M_UNKNOWN_TOKEN")));

	let sup = supervisor(&h);
	let (_tx, rx) = watch::channel(false);
	let res = timeout(Duration::from_secs(5), sup.run(&mut h.sync, rx))
		.await
		.expect("supervisor finished");

	assert!(res.is_err());
	// One failed login, the first login, one forced re-login.
	assert_eq!(h.client.logins.load(Ordering::SeqCst), 3);
	// The re-login resumes from the stored cursor.
	assert_eq!(since_of_calls(&h.client)[2], Some("s1".to_string()));
	assert!(!h.health.is_ready());
}

#[tokio::test]
async fn supervisor_exits_cleanly_on_shutdown() {
	let mut h = harness();
	let sup = supervisor(&h);
	let (tx, rx) = watch::channel(false);
	tx.send(true).expect("signal");

	let res = timeout(Duration::from_secs(5), sup.run(&mut h.sync, rx))
		.await
		.expect("supervisor finished");
	assert!(res.is_ok());
	assert_eq!(h.client.logins.load(Ordering::SeqCst), 0);
}
