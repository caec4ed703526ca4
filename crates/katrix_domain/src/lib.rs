#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}
			pub fn as_str(&self) -> &str {
				&self.0
			}
			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Homeserver room identifier (`!opaque:server`).
	RoomId
);

string_id!(
	/// Chat account identifier (`@user:server`).
	UserId
);

string_id!(
	/// Identifier the homeserver assigned to a sent event.
	EventId
);

string_id!(
	/// Content locator returned by a media upload (`mxc://server/media`).
	ContentUri
);

impl UserId {
	/// Localpart of a fully qualified id: `@user:server` -> `user`.
	pub fn localpart(&self) -> &str {
		let s = self.0.strip_prefix('@').unwrap_or(&self.0);
		s.split(':').next().unwrap_or(s)
	}
}

impl ContentUri {
	/// Parse and require the `mxc://` scheme.
	pub fn parse_mxc(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !s.starts_with("mxc://") {
			return Err(ParseIdError::InvalidFormat(format!("expected mxc:// uri: {s}")));
		}
		Ok(Self(s.to_string()))
	}
}

/// Media classification used to pick the outbound message type for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
	Image,
	Video,
	Audio,
	File,
}

impl MediaKind {
	/// Classify by MIME type.
	pub fn from_mime(mime: &str) -> Self {
		let top = mime.trim().split('/').next().unwrap_or_default().to_ascii_lowercase();
		match top.as_str() {
			"image" => Self::Image,
			"video" => Self::Video,
			"audio" => Self::Audio,
			_ => Self::File,
		}
	}

	/// Message type string on the wire.
	pub const fn msgtype(self) -> &'static str {
		match self {
			Self::Image => "m.image",
			Self::Video => "m.video",
			Self::Audio => "m.audio",
			Self::File => "m.file",
		}
	}
}

impl fmt::Display for MediaKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.msgtype())
	}
}

/// Guess a MIME type from a filename extension.
pub fn guess_mime(filename: &str) -> &'static str {
	let ext = filename
		.rsplit_once('.')
		.map(|(_, ext)| ext.trim().to_ascii_lowercase())
		.unwrap_or_default();

	match ext.as_str() {
		"jpg" | "jpeg" => "image/jpeg",
		"png" => "image/png",
		"gif" => "image/gif",
		"webp" => "image/webp",
		"heic" => "image/heic",
		"mp4" | "m4v" => "video/mp4",
		"webm" => "video/webm",
		"mov" => "video/quicktime",
		"mkv" => "video/x-matroska",
		"mp3" => "audio/mpeg",
		"ogg" | "oga" => "audio/ogg",
		"wav" => "audio/wav",
		"txt" => "text/plain",
		"json" => "application/json",
		"pdf" => "application/pdf",
		_ => "application/octet-stream",
	}
}
