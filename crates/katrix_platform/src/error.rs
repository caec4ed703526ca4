#![forbid(unsafe_code)]

use thiserror::Error;

/// Typed failure of a chat protocol operation.
#[derive(Debug, Error)]
pub enum ChatError {
	#[error("homeserver returned {status}: {errcode} {error}")]
	Http {
		status: u16,
		errcode: String,
		error: String,
	},

	#[error("transport error: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("failed to decode response (status {status}): {detail}")]
	Decode {
		status: u16,
		detail: String,
	},

	#[error("not logged in")]
	NotLoggedIn,

	#[error("invalid response: {0}")]
	Invalid(String),
}

impl ChatError {
	/// HTTP status of the failed call, when one was received.
	pub fn status_code(&self) -> Option<u16> {
		match self {
			Self::Http { status, .. } | Self::Decode { status, .. } => Some(*status),
			Self::Transport(e) => e.status().map(|s| s.as_u16()),
			Self::NotLoggedIn | Self::Invalid(_) => None,
		}
	}

	/// The homeserver answered 200 but there was nothing usable yet.
	pub fn is_clean_empty(&self) -> bool {
		self.status_code() == Some(200)
	}

	/// The access token is missing, invalid or expired.
	pub fn is_auth(&self) -> bool {
		match self {
			Self::NotLoggedIn => true,
			Self::Http { status, errcode, .. } => *status == 401 || errcode == "M_UNKNOWN_TOKEN" || errcode == "M_MISSING_TOKEN",
			_ => false,
		}
	}
}
