#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use katrix_domain::{ContentUri, EventId, RoomId, UserId};
use katrix_platform::{
	ChatClient, ChatError, JoinedRoom, LoginResponse, MessageContent, Presence, SecretString, SyncOptions,
	SyncResponse, TimelineEvent,
};
use katrix_protocol::IpcMessage;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::config::BridgeSettings;
use crate::server::request::{Outcome, Request};
use crate::server::transport::{Inbox, Mailbox};

pub const BOT: &str = "@bot:example.org";
pub const ROOM: &str = "!room:example.org";

pub fn room() -> RoomId {
	RoomId::new(ROOM).expect("room id")
}

pub fn http_error(status: u16, errcode: &str) -> ChatError {
	ChatError::Http {
		status,
		errcode: errcode.to_string(),
		error: "test".to_string(),
	}
}

pub fn sync_ok(next_batch: &str, rooms: Vec<JoinedRoom>) -> Result<SyncResponse, ChatError> {
	Ok(SyncResponse {
		next_batch: next_batch.to_string(),
		rooms,
	})
}

pub fn room_message(sender: &str, body: &str) -> TimelineEvent {
	TimelineEvent {
		event_id: Some(format!("$ev-{body}")),
		sender: sender.to_string(),
		event_type: "m.room.message".to_string(),
		msgtype: Some("m.text".to_string()),
		body: Some(body.to_string()),
		origin_server_ts: Some(1_700_000_000_000),
	}
}

pub fn bridge_settings() -> BridgeSettings {
	BridgeSettings {
		default_room: Some(ROOM.to_string()),
		..BridgeSettings::default()
	}
}

/// Scripted [`ChatClient`] that records every call.
pub struct MockClient {
	user: Option<UserId>,
	pub sent: Mutex<Vec<(RoomId, MessageContent)>>,
	pub uploaded: Mutex<Vec<String>>,
	pub sync_calls: Mutex<Vec<SyncOptions>>,
	pub logins: AtomicUsize,
	/// When set, each upload waits for one permit.
	upload_gate: Option<Arc<Semaphore>>,
	/// Per-file gates; an upload of that file waits for one permit.
	file_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
	failing_uploads: Mutex<HashSet<String>>,
	failing_sends: Mutex<HashSet<String>>,
	sync_script: Mutex<VecDeque<Result<SyncResponse, ChatError>>>,
	login_failures: Mutex<VecDeque<ChatError>>,
	pub presence: Mutex<Presence>,
	pub aliases: Mutex<Vec<String>>,
}

impl MockClient {
	pub fn new() -> Self {
		Self {
			user: UserId::new(BOT).ok(),
			sent: Mutex::new(Vec::new()),
			uploaded: Mutex::new(Vec::new()),
			sync_calls: Mutex::new(Vec::new()),
			logins: AtomicUsize::new(0),
			upload_gate: None,
			file_gates: Mutex::new(HashMap::new()),
			failing_uploads: Mutex::new(HashSet::new()),
			failing_sends: Mutex::new(HashSet::new()),
			sync_script: Mutex::new(VecDeque::new()),
			login_failures: Mutex::new(VecDeque::new()),
			presence: Mutex::new(Presence::default()),
			aliases: Mutex::new(Vec::new()),
		}
	}

	pub fn with_upload_gate(mut self, gate: Arc<Semaphore>) -> Self {
		self.upload_gate = Some(gate);
		self
	}

	/// Hold uploads of `filename` until a permit is added to the returned gate.
	pub fn gate_upload_of(&self, filename: &str) -> Arc<Semaphore> {
		let gate = Arc::new(Semaphore::new(0));
		self.file_gates.lock().insert(filename.to_string(), gate.clone());
		gate
	}

	pub fn fail_upload_of(&self, filename: &str) {
		self.failing_uploads.lock().insert(filename.to_string());
	}

	pub fn fail_send_of(&self, body: &str) {
		self.failing_sends.lock().insert(body.to_string());
	}

	pub fn script_sync(&self, result: Result<SyncResponse, ChatError>) {
		self.sync_script.lock().push_back(result);
	}

	pub fn fail_next_login(&self, err: ChatError) {
		self.login_failures.lock().push_back(err);
	}

	pub fn sent_bodies(&self) -> Vec<String> {
		self.sent
			.lock()
			.iter()
			.map(|(_, c)| match c {
				MessageContent::Text { body } | MessageContent::Media { body, .. } => body.clone(),
			})
			.collect()
	}
}

#[async_trait::async_trait]
impl ChatClient for MockClient {
	fn user_id(&self) -> Option<UserId> {
		self.user.clone()
	}

	async fn login(&self, _user: &str, _password: &SecretString) -> Result<LoginResponse, ChatError> {
		self.logins.fetch_add(1, Ordering::SeqCst);
		if let Some(err) = self.login_failures.lock().pop_front() {
			return Err(err);
		}
		Ok(LoginResponse {
			user_id: UserId::new(BOT).map_err(|e| ChatError::Invalid(e.to_string()))?,
			device_id: "DEVICE".to_string(),
			access_token: SecretString::new("token"),
		})
	}

	async fn sync(&self, opts: &SyncOptions) -> Result<SyncResponse, ChatError> {
		self.sync_calls.lock().push(opts.clone());
		let next = self.sync_script.lock().pop_front();
		match next {
			Some(result) => result,
			None => futures::future::pending().await,
		}
	}

	async fn send_message(&self, room: &RoomId, content: &MessageContent) -> Result<EventId, ChatError> {
		let body = match content {
			MessageContent::Text { body } | MessageContent::Media { body, .. } => body.clone(),
		};
		if self.failing_sends.lock().contains(&body) {
			return Err(http_error(500, "M_UNKNOWN"));
		}
		let n = {
			let mut sent = self.sent.lock();
			sent.push((room.clone(), content.clone()));
			sent.len()
		};
		EventId::new(format!("$sent{n}")).map_err(|e| ChatError::Invalid(e.to_string()))
	}

	async fn upload(&self, _data: Bytes, _mime: &str, filename: &str) -> Result<ContentUri, ChatError> {
		if let Some(gate) = &self.upload_gate {
			let permit = gate.acquire().await.map_err(|e| ChatError::Invalid(e.to_string()))?;
			permit.forget();
		}
		let file_gate = self.file_gates.lock().get(filename).cloned();
		if let Some(gate) = file_gate {
			let permit = gate.acquire().await.map_err(|e| ChatError::Invalid(e.to_string()))?;
			permit.forget();
		}
		if self.failing_uploads.lock().contains(filename) {
			return Err(http_error(413, "M_TOO_LARGE"));
		}
		self.uploaded.lock().push(filename.to_string());
		ContentUri::new(format!("mxc://example.org/{filename}")).map_err(|e| ChatError::Invalid(e.to_string()))
	}

	async fn presence(&self, _user: &UserId) -> Result<Presence, ChatError> {
		Ok(self.presence.lock().clone())
	}

	async fn list_aliases(&self, _room: &RoomId) -> Result<Vec<String>, ChatError> {
		Ok(self.aliases.lock().clone())
	}
}

/// [`Mailbox`] over a real [`Inbox`] that keeps outbound messages in memory.
pub struct MemoryMailbox {
	inbox: Mutex<Inbox>,
	pub sent: Mutex<Vec<IpcMessage>>,
}

impl MemoryMailbox {
	pub fn new() -> Self {
		Self {
			inbox: Mutex::new(Inbox::new("matrix", 64, Duration::from_secs(60))),
			sent: Mutex::new(Vec::new()),
		}
	}

	pub fn push(&self, msg: IpcMessage) -> bool {
		self.inbox.lock().accept(msg, Instant::now())
	}

	pub fn sent(&self) -> Vec<IpcMessage> {
		self.sent.lock().clone()
	}
}

impl Mailbox for MemoryMailbox {
	fn has_msgs(&self) -> bool {
		self.inbox.lock().has_msgs()
	}

	fn get_msg(&self) -> Option<IpcMessage> {
		self.inbox.lock().pop()
	}

	fn reply(&self, req: &Request, outcome: Outcome) {
		let msg = self.inbox.lock().compose_reply(req, &outcome);
		if let Some(msg) = msg {
			self.sent.lock().push(msg);
		}
	}

	fn send(&self, msg: IpcMessage) {
		self.sent.lock().push(msg);
	}

	fn prune(&self) {
		self.inbox.lock().prune(Instant::now());
	}
}

/// Write `files` (name, contents) into a fresh temp dir; returns the dir and the paths.
pub fn media_files(files: &[(&str, &[u8])]) -> (tempfile::TempDir, Vec<String>) {
	let dir = tempfile::tempdir().expect("tempdir");
	let paths = files
		.iter()
		.map(|(name, data)| {
			let path = dir.path().join(name);
			std::fs::write(&path, data).expect("write media");
			path.to_string_lossy().into_owned()
		})
		.collect();
	(dir, paths)
}
