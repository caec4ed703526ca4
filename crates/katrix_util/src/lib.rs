#![forbid(unsafe_code)]

pub mod endpoint {
	/// Parsed `tcp://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct TcpEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl TcpEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Parse an endpoint string in the form `tcp://host:port`.
		///
		/// A bare `host:port` is accepted as well, since most peers configure the
		/// bridge with plain socket addresses.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected tcp://host:port)".to_string());
			}

			let rest = s.strip_prefix("tcp://").unwrap_or(s);
			if rest.contains("://") {
				return Err(format!("invalid endpoint scheme (expected tcp://host:port): {s}"));
			}

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected tcp://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected tcp://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected tcp://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like tcp://[::1]:28477): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	impl std::fmt::Display for TcpEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "tcp://{}:{}", self.host, self.port)
		}
	}

	/// Validate `tcp://host:port` (or a bare `host:port`).
	pub fn validate_tcp_endpoint(s: &str) -> Result<(), String> {
		let _ = TcpEndpoint::parse(s)?;
		Ok(())
	}

}

pub mod backoff {
	use std::time::Duration;

	/// Exponential delay `min * 2^attempt`, clamped to `[min, max]`.
	pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn doubles_until_capped() {
			let min = Duration::from_millis(500);
			let max = Duration::from_secs(30);
			assert_eq!(backoff_delay(0, min, max), min);
			assert_eq!(backoff_delay(1, min, max), Duration::from_secs(1));
			assert_eq!(backoff_delay(3, min, max), Duration::from_secs(4));
			assert_eq!(backoff_delay(10, min, max), max);
			assert_eq!(backoff_delay(u32::MAX, min, max), max);
		}
	}
}
