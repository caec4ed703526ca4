#![forbid(unsafe_code)]

use core::fmt;

use bytes::Bytes;
use prost::Message;
use thiserror::Error;

/// Typed message bodies exchanged with the automation platform.
pub mod pb {
	/// Generic daemon instruction.
	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct KiqMessage {
		#[prost(string, tag = "1")]
		pub command: String,
		#[prost(string, tag = "2")]
		pub payload: String,
	}

	/// Chat command (send) or chat activity (forwarded event).
	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct PlatformMessage {
		#[prost(string, tag = "1")]
		pub platform: String,
		#[prost(string, tag = "2")]
		pub id: String,
		#[prost(string, tag = "3")]
		pub user: String,
		#[prost(string, tag = "4")]
		pub content: String,
		/// `>`-delimited resource locators.
		#[prost(string, tag = "5")]
		pub urls: String,
		#[prost(bool, tag = "6")]
		pub repost: bool,
		#[prost(string, tag = "7")]
		pub args: String,
		#[prost(string, tag = "8")]
		pub time: String,
	}

	/// Info query; the answer travels back in `info` with `kind` preserved.
	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct PlatformInfo {
		#[prost(string, tag = "1")]
		pub platform: String,
		#[prost(string, tag = "2")]
		pub info: String,
		#[prost(string, tag = "3")]
		pub kind: String,
	}

	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct OkayMessage {
		#[prost(string, tag = "1")]
		pub platform: String,
		#[prost(string, tag = "2")]
		pub id: String,
	}

	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct FailMessage {
		#[prost(string, tag = "1")]
		pub platform: String,
		#[prost(string, tag = "2")]
		pub id: String,
		#[prost(string, tag = "3")]
		pub reason: String,
	}
}

/// Resource locator delimiter inside `PlatformMessage.urls`.
pub const URL_DELIMITER: char = '>';

/// Message kind tag (frame 0 of every encoded message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
	Kiq = 1,
	Platform = 2,
	Info = 3,
	Okay = 4,
	Fail = 5,
}

impl MessageKind {
	pub const fn as_u8(self) -> u8 {
		self as u8
	}

	pub fn from_u8(v: u8) -> Option<Self> {
		match v {
			1 => Some(Self::Kiq),
			2 => Some(Self::Platform),
			3 => Some(Self::Info),
			4 => Some(Self::Okay),
			5 => Some(Self::Fail),
			_ => None,
		}
	}

	/// Stable name for logs/metrics.
	pub const fn name(self) -> &'static str {
		match self {
			Self::Kiq => "kiq",
			Self::Platform => "platform_message",
			Self::Info => "platform_info",
			Self::Okay => "okay",
			Self::Fail => "fail",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("message has no frames")]
	Empty,

	#[error("invalid header frame: expected 1 byte, got {0}")]
	BadHeader(usize),

	#[error("unknown message kind tag: {0}")]
	UnknownKind(u8),

	#[error("message of kind {0} is missing its body frame")]
	MissingBody(MessageKind),

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),
}

/// A decoded IPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
	Kiq(pb::KiqMessage),
	Platform(pb::PlatformMessage),
	Info(pb::PlatformInfo),
	Okay(pb::OkayMessage),
	Fail(pb::FailMessage),
}

impl IpcMessage {
	pub fn kind(&self) -> MessageKind {
		match self {
			Self::Kiq(_) => MessageKind::Kiq,
			Self::Platform(_) => MessageKind::Platform,
			Self::Info(_) => MessageKind::Info,
			Self::Okay(_) => MessageKind::Okay,
			Self::Fail(_) => MessageKind::Fail,
		}
	}

	/// Key used to correlate a reply with this message.
	///
	/// Commands correlate by their id, info queries by their kind discriminator.
	/// Other kinds are never awaiting a reply.
	pub fn correlation_id(&self) -> Option<&str> {
		match self {
			Self::Platform(m) => Some(m.id.as_str()),
			Self::Info(m) => Some(m.kind.as_str()),
			Self::Okay(m) => Some(m.id.as_str()),
			Self::Fail(m) => Some(m.id.as_str()),
			Self::Kiq(_) => None,
		}
	}

	/// Whether replies are correlated for this kind.
	pub fn is_correlatable(&self) -> bool {
		matches!(self, Self::Platform(_) | Self::Info(_))
	}

	/// Encode into frames: `[kind tag, protobuf body]`.
	pub fn to_frames(&self) -> Vec<Bytes> {
		let body = match self {
			Self::Kiq(m) => m.encode_to_vec(),
			Self::Platform(m) => m.encode_to_vec(),
			Self::Info(m) => m.encode_to_vec(),
			Self::Okay(m) => m.encode_to_vec(),
			Self::Fail(m) => m.encode_to_vec(),
		};
		vec![Bytes::copy_from_slice(&[self.kind().as_u8()]), Bytes::from(body)]
	}

	/// Decode from frames produced by [`IpcMessage::to_frames`].
	///
	/// Extra trailing frames are ignored.
	pub fn from_frames(frames: &[Bytes]) -> Result<Self, CodecError> {
		let header = frames.first().ok_or(CodecError::Empty)?;
		if header.len() != 1 {
			return Err(CodecError::BadHeader(header.len()));
		}

		let kind = MessageKind::from_u8(header[0]).ok_or(CodecError::UnknownKind(header[0]))?;
		let body = frames.get(1).ok_or(CodecError::MissingBody(kind))?;

		Ok(match kind {
			MessageKind::Kiq => Self::Kiq(pb::KiqMessage::decode(body.as_ref())?),
			MessageKind::Platform => Self::Platform(pb::PlatformMessage::decode(body.as_ref())?),
			MessageKind::Info => Self::Info(pb::PlatformInfo::decode(body.as_ref())?),
			MessageKind::Okay => Self::Okay(pb::OkayMessage::decode(body.as_ref())?),
			MessageKind::Fail => Self::Fail(pb::FailMessage::decode(body.as_ref())?),
		})
	}

	pub fn okay(platform: impl Into<String>, id: impl Into<String>) -> Self {
		Self::Okay(pb::OkayMessage {
			platform: platform.into(),
			id: id.into(),
		})
	}

	pub fn fail(platform: impl Into<String>, id: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::Fail(pb::FailMessage {
			platform: platform.into(),
			id: id.into(),
			reason: reason.into(),
		})
	}
}

/// Split a delimited locator list, skipping blanks.
pub fn split_urls(urls: &str) -> Vec<String> {
	urls.split(URL_DELIMITER)
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.collect()
}
