#![forbid(unsafe_code)]

pub mod error;
pub mod matrix;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use katrix_domain::{ContentUri, EventId, MediaKind, RoomId, UserId};
use serde::Serialize;

pub use error::ChatError;
pub use matrix::{MatrixClient, MatrixConfig};

/// Result of a successful password login.
#[derive(Debug, Clone)]
pub struct LoginResponse {
	pub user_id: UserId,
	pub device_id: String,
	pub access_token: SecretString,
}

/// Options for one long-poll sync call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
	/// Continuation token from the previous response; absent on the first call.
	pub since: Option<String>,
	/// How long the homeserver may hold the request open.
	pub timeout: Duration,
}

/// Normalized long-poll response.
#[derive(Debug, Clone, Default)]
pub struct SyncResponse {
	pub next_batch: String,
	pub rooms: Vec<JoinedRoom>,
}

/// Activity for one joined room.
#[derive(Debug, Clone)]
pub struct JoinedRoom {
	pub room_id: RoomId,
	pub timeline: Vec<TimelineEvent>,
}

/// One timeline event, reduced to the fields the bridge reads.
#[derive(Debug, Clone, Default)]
pub struct TimelineEvent {
	pub event_id: Option<String>,
	pub sender: String,
	pub event_type: String,
	pub msgtype: Option<String>,
	pub body: Option<String>,
	pub origin_server_ts: Option<i64>,
}

impl TimelineEvent {
	/// Whether the event has a textual representation (`m.room.message` with a body).
	pub fn is_room_message(&self) -> bool {
		self.event_type == "m.room.message" && self.body.is_some()
	}

	pub fn body(&self) -> &str {
		self.body.as_deref().unwrap_or_default()
	}

	/// Origin timestamp as RFC 3339, empty when unknown.
	pub fn time(&self) -> String {
		self.origin_server_ts
			.and_then(chrono::DateTime::from_timestamp_millis)
			.map(|t| t.to_rfc3339())
			.unwrap_or_default()
	}
}

/// Content of an outbound room message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
	Text {
		body: String,
	},
	Media {
		kind: MediaKind,
		body: String,
		url: ContentUri,
		mime: String,
		size: Option<u64>,
	},
}

impl MessageContent {
	pub fn text(body: impl Into<String>) -> Self {
		Self::Text { body: body.into() }
	}

	pub fn msgtype(&self) -> &'static str {
		match self {
			Self::Text { .. } => "m.text",
			Self::Media { kind, .. } => kind.msgtype(),
		}
	}

	/// Event content JSON.
	pub fn to_json(&self) -> serde_json::Value {
		match self {
			Self::Text { body } => serde_json::json!({
				"msgtype": "m.text",
				"body": body,
			}),
			Self::Media {
				kind,
				body,
				url,
				mime,
				size,
			} => {
				let mut info = serde_json::json!({ "mimetype": mime });
				if let Some(size) = size {
					info["size"] = serde_json::json!(size);
				}
				serde_json::json!({
					"msgtype": kind.msgtype(),
					"body": body,
					"url": url.as_str(),
					"info": info,
				})
			}
		}
	}
}

/// Presence snapshot for a user.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Presence {
	pub displayname: Option<String>,
	pub presence: String,
	pub last_active_ago: Option<u64>,
	pub currently_active: Option<bool>,
	pub status_msg: Option<String>,
	pub avatar_url: Option<String>,
}

/// The chat protocol operations the bridge depends on.
///
/// Every operation completes with a result or a typed [`ChatError`].
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync + 'static {
	/// The logged-in account, once known.
	fn user_id(&self) -> Option<UserId>;

	async fn login(&self, user: &str, password: &SecretString) -> Result<LoginResponse, ChatError>;

	async fn sync(&self, opts: &SyncOptions) -> Result<SyncResponse, ChatError>;

	async fn send_message(&self, room: &RoomId, content: &MessageContent) -> Result<EventId, ChatError>;

	async fn upload(&self, data: Bytes, mime: &str, filename: &str) -> Result<ContentUri, ChatError>;

	async fn presence(&self, user: &UserId) -> Result<Presence, ChatError>;

	async fn list_aliases(&self, room: &RoomId) -> Result<Vec<String>, ChatError>;
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
