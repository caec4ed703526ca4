#![forbid(unsafe_code)]

mod client;
mod wire;

pub use client::MatrixClient;

/// Connection settings for a homeserver.
#[derive(Debug, Clone)]
pub struct MatrixConfig {
	/// Base URL, e.g. `https://matrix.org`.
	pub homeserver: String,
	/// Device display name sent at login.
	pub device_name: String,
}

impl Default for MatrixConfig {
	fn default() -> Self {
		Self {
			homeserver: "https://matrix.org".to_string(),
			device_name: "katrix".to_string(),
		}
	}
}
