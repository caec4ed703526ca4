#![forbid(unsafe_code)]

//! Homeserver JSON shapes and their reduction to the crate's types.

use std::collections::BTreeMap;

use katrix_domain::RoomId;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ChatError;
use crate::{JoinedRoom, Presence, SyncResponse, TimelineEvent};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
	#[serde(default)]
	pub errcode: String,
	#[serde(default)]
	pub error: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginBody {
	pub user_id: String,
	pub access_token: String,
	#[serde(default)]
	pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendBody {
	pub event_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadBody {
	pub content_uri: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AliasesBody {
	#[serde(default)]
	pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PresenceBody {
	#[serde(default)]
	pub presence: String,
	#[serde(default)]
	pub last_active_ago: Option<u64>,
	#[serde(default)]
	pub currently_active: Option<bool>,
	#[serde(default)]
	pub status_msg: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ProfileBody {
	#[serde(default)]
	pub displayname: Option<String>,
	#[serde(default)]
	pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SyncBody {
	pub next_batch: String,
	#[serde(default)]
	rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
	#[serde(default)]
	join: BTreeMap<String, JoinedRoomBody>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoomBody {
	#[serde(default)]
	timeline: TimelineBody,
}

#[derive(Debug, Default, Deserialize)]
struct TimelineBody {
	#[serde(default)]
	events: Vec<EventBody>,
}

#[derive(Debug, Deserialize)]
struct EventBody {
	#[serde(default)]
	event_id: Option<String>,
	#[serde(default)]
	sender: String,
	#[serde(default, rename = "type")]
	event_type: String,
	#[serde(default)]
	content: Value,
	#[serde(default)]
	origin_server_ts: Option<i64>,
}

impl From<EventBody> for TimelineEvent {
	fn from(ev: EventBody) -> Self {
		let field = |name: &str| ev.content.get(name).and_then(Value::as_str).map(str::to_string);
		Self {
			msgtype: field("msgtype"),
			body: field("body"),
			event_id: ev.event_id,
			sender: ev.sender,
			event_type: ev.event_type,
			origin_server_ts: ev.origin_server_ts,
		}
	}
}

impl SyncBody {
	/// Reduce to the normalized response; rooms with unparseable ids are dropped.
	pub fn into_response(self) -> SyncResponse {
		let rooms = self
			.rooms
			.join
			.into_iter()
			.filter_map(|(id, room)| match RoomId::new(id.clone()) {
				Ok(room_id) => Some(JoinedRoom {
					room_id,
					timeline: room.timeline.events.into_iter().map(TimelineEvent::from).collect(),
				}),
				Err(e) => {
					debug!(room = %id, error = %e, "skipping joined room with invalid id");
					None
				}
			})
			.collect();

		SyncResponse {
			next_batch: self.next_batch,
			rooms,
		}
	}
}

pub(crate) fn presence_from(body: PresenceBody, profile: ProfileBody) -> Presence {
	Presence {
		displayname: profile.displayname,
		presence: body.presence,
		last_active_ago: body.last_active_ago,
		currently_active: body.currently_active,
		status_msg: body.status_msg,
		avatar_url: profile.avatar_url,
	}
}

/// Turn a raw status + body into a typed value or a typed failure.
pub(crate) fn decode_body<T: serde::de::DeserializeOwned>(status: u16, body: &[u8]) -> Result<T, ChatError> {
	if !(200..300).contains(&status) {
		let err: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
		let error = if err.error.is_empty() {
			String::from_utf8_lossy(body).chars().take(256).collect()
		} else {
			err.error
		};
		return Err(ChatError::Http {
			status,
			errcode: err.errcode,
			error,
		});
	}

	serde_json::from_slice(body).map_err(|e| ChatError::Decode {
		status,
		detail: e.to_string(),
	})
}
