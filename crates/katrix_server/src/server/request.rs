#![forbid(unsafe_code)]

use katrix_protocol::{IpcMessage, split_urls};
use tracing::{debug, warn};

/// Normalized unit of work taken from one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
	/// Correlates the eventual reply. For info queries this is the query kind.
	pub id: String,
	pub user: String,
	/// Message body for commands; query kind for info queries (later replaced by the answer).
	pub text: String,
	/// `>`-delimited resource locators.
	pub media: String,
	pub time: String,
	/// Command arguments, or the query parameter for info queries.
	pub args: String,
	pub info: bool,
}

impl Request {
	pub fn media_locators(&self) -> Vec<String> {
		split_urls(&self.media)
	}

	pub fn has_media(&self) -> bool {
		!self.media_locators().is_empty()
	}
}

/// How a request ended, as reported back to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
	Success,
	Failure(String),
}

impl Outcome {
	pub fn is_success(&self) -> bool {
		matches!(self, Self::Success)
	}

	pub fn failure(reason: impl Into<String>) -> Self {
		Self::Failure(reason.into())
	}
}

impl<E: std::fmt::Display> From<Result<(), E>> for Outcome {
	fn from(r: Result<(), E>) -> Self {
		match r {
			Ok(()) => Self::Success,
			Err(e) => Self::Failure(e.to_string()),
		}
	}
}

/// Map an inbound message to a [`Request`].
///
/// Only chat commands and info queries produce a request; every other kind is
/// logged and dropped.
pub fn normalize(msg: &IpcMessage) -> Option<Request> {
	match msg {
		IpcMessage::Platform(m) => Some(Request {
			id: m.id.clone(),
			user: m.user.clone(),
			text: m.content.clone(),
			media: m.urls.clone(),
			time: m.time.clone(),
			args: m.args.clone(),
			info: false,
		}),
		IpcMessage::Info(m) => Some(Request {
			id: m.kind.clone(),
			text: m.kind.clone(),
			args: m.info.clone(),
			info: true,
			..Default::default()
		}),
		IpcMessage::Kiq(m) => {
			debug!(command = %m.command, "ignoring daemon instruction");
			None
		}
		other => {
			warn!(kind = %other.kind(), "ignoring inbound message kind with no request mapping");
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use katrix_protocol::pb;

	use super::*;

	#[test]
	fn command_maps_to_non_info_request() {
		let msg = IpcMessage::Platform(pb::PlatformMessage {
			platform: "matrix".to_string(),
			id: "42".to_string(),
			user: "kiq".to_string(),
			content: "hello room".to_string(),
			urls: "/tmp/a.png>".to_string(),
			time: "1700000000".to_string(),
			args: "!room:example.org".to_string(),
			..Default::default()
		});

		let req = normalize(&msg).expect("request");
		assert_eq!(req.id, "42");
		assert_eq!(req.text, "hello room");
		assert_eq!(req.args, "!room:example.org");
		assert!(!req.info);
		assert_eq!(req.media_locators(), vec!["/tmp/a.png"]);
	}

	#[test]
	fn info_query_uses_kind_as_id_and_text() {
		let msg = IpcMessage::Info(pb::PlatformInfo {
			platform: "matrix".to_string(),
			info: "@alice:example.org".to_string(),
			kind: "presence".to_string(),
		});

		let req = normalize(&msg).expect("request");
		assert!(req.info);
		assert_eq!(req.id, "presence");
		assert_eq!(req.text, "presence");
		assert_eq!(req.args, "@alice:example.org");
		assert!(!req.has_media());
	}

	#[test]
	fn other_kinds_produce_nothing() {
		let kiq = IpcMessage::Kiq(pb::KiqMessage {
			command: "restart".to_string(),
			payload: String::new(),
		});
		assert!(normalize(&kiq).is_none());
		assert!(normalize(&IpcMessage::okay("matrix", "1")).is_none());
		assert!(normalize(&IpcMessage::fail("matrix", "1", "nope")).is_none());
	}

	#[test]
	fn outcome_from_result() {
		assert!(Outcome::from(Ok::<(), String>(())).is_success());
		assert_eq!(
			Outcome::from(Err::<(), _>("no room")),
			Outcome::Failure("no room".to_string())
		);
	}
}
