#![forbid(unsafe_code)]

use std::collections::HashMap;

use katrix_protocol::{IpcMessage, pb};
use tracing::{debug, warn};

use crate::server::request::{Outcome, Request};

/// Pending-reply bookkeeping: request id -> the original inbound message.
#[derive(Debug)]
pub struct ReplyCorrelator {
	platform: String,
	pending: HashMap<String, IpcMessage>,
}

impl ReplyCorrelator {
	pub fn new(platform: impl Into<String>) -> Self {
		Self {
			platform: platform.into(),
			pending: HashMap::new(),
		}
	}

	/// Start awaiting a reply for `msg`. Kinds that don't correlate are ignored.
	///
	/// A later message with the same id replaces the earlier entry.
	pub fn track(&mut self, msg: &IpcMessage) {
		if !msg.is_correlatable() {
			return;
		}
		if let Some(id) = msg.correlation_id()
			&& self.pending.insert(id.to_string(), msg.clone()).is_some()
		{
			debug!(id, "replaced pending reply entry");
		}
	}

	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}

	pub fn is_pending(&self, id: &str) -> bool {
		self.pending.contains_key(id)
	}

	/// Build the reply for `req`, consuming its pending entry.
	///
	/// Returns `None` when nothing at all is awaiting a reply.
	pub fn compose(&mut self, req: &Request, outcome: &Outcome) -> Option<IpcMessage> {
		if self.pending.is_empty() {
			debug!(id = %req.id, "reply with nothing pending; ignoring");
			return None;
		}

		let Some(original) = self.pending.remove(&req.id) else {
			warn!(id = %req.id, pending = self.pending.len(), "no pending entry for reply; sending sentinel");
			metrics::counter!("katrix_reply_fallbacks_total").increment(1);
			return Some(self.sentinel(&req.id, outcome));
		};

		let reply = match outcome {
			Outcome::Failure(_) => self.sentinel(&req.id, outcome),
			Outcome::Success if req.info => match original {
				IpcMessage::Info(query) => IpcMessage::Info(pb::PlatformInfo {
					platform: query.platform,
					info: req.text.clone(),
					kind: query.kind,
				}),
				other => other,
			},
			Outcome::Success => original,
		};
		Some(reply)
	}

	fn sentinel(&self, id: &str, outcome: &Outcome) -> IpcMessage {
		match outcome {
			Outcome::Success => IpcMessage::okay(&self.platform, id),
			Outcome::Failure(reason) => IpcMessage::fail(&self.platform, id, reason),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::request::normalize;

	fn command(id: &str) -> IpcMessage {
		IpcMessage::Platform(pb::PlatformMessage {
			platform: "matrix".to_string(),
			id: id.to_string(),
			content: "hi".to_string(),
			..Default::default()
		})
	}

	fn query(kind: &str) -> IpcMessage {
		IpcMessage::Info(pb::PlatformInfo {
			platform: "matrix".to_string(),
			info: String::new(),
			kind: kind.to_string(),
		})
	}

	#[test]
	fn nothing_pending_is_a_no_op() {
		let mut c = ReplyCorrelator::new("matrix");
		let req = normalize(&command("x")).expect("req");
		assert!(c.compose(&req, &Outcome::Success).is_none());
	}

	#[test]
	fn successful_command_echoes_original() {
		let mut c = ReplyCorrelator::new("matrix");
		let msg = command("X");
		c.track(&msg);

		let req = normalize(&msg).expect("req");
		let reply = c.compose(&req, &Outcome::Success).expect("reply");
		assert_eq!(reply, msg);
		assert_eq!(reply.correlation_id(), Some("X"));
		assert_eq!(c.pending_len(), 0);
	}

	#[test]
	fn failed_command_yields_fail_sentinel() {
		let mut c = ReplyCorrelator::new("matrix");
		let msg = command("X");
		c.track(&msg);

		let req = normalize(&msg).expect("req");
		match c.compose(&req, &Outcome::failure("upload failed")).expect("reply") {
			IpcMessage::Fail(f) => {
				assert_eq!(f.id, "X");
				assert_eq!(f.platform, "matrix");
				assert_eq!(f.reason, "upload failed");
			}
			other => panic!("unexpected reply: {other:?}"),
		}
		assert!(!c.is_pending("X"));
	}

	#[test]
	fn info_answer_patches_query_and_keeps_kind() {
		let mut c = ReplyCorrelator::new("matrix");
		let msg = query("rooms");
		c.track(&msg);

		let mut req = normalize(&msg).expect("req");
		req.text = r#"{"rooms":[]}"#.to_string();
		match c.compose(&req, &Outcome::Success).expect("reply") {
			IpcMessage::Info(i) => {
				assert_eq!(i.kind, "rooms");
				assert_eq!(i.info, r#"{"rooms":[]}"#);
			}
			other => panic!("unexpected reply: {other:?}"),
		}
	}

	#[test]
	fn unknown_id_falls_back_to_sentinel() {
		let mut c = ReplyCorrelator::new("matrix");
		c.track(&command("A"));

		let req = normalize(&command("B")).expect("req");
		assert_eq!(
			c.compose(&req, &Outcome::Success),
			Some(IpcMessage::okay("matrix", "B"))
		);
		assert!(c.is_pending("A"), "unrelated entry must survive");
	}

	#[test]
	fn non_correlatable_kinds_are_not_tracked() {
		let mut c = ReplyCorrelator::new("matrix");
		c.track(&IpcMessage::okay("matrix", "A"));
		assert_eq!(c.pending_len(), 0);
	}
}
