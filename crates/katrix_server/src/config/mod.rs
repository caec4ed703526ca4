#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use katrix_platform::SecretString;
use katrix_protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_PARTS};
use katrix_util::endpoint::validate_tcp_endpoint;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.katrix/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".katrix").join("config.toml"))
}

/// Load the daemon config from TOML at `path`, then apply env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<KatrixConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = KatrixConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	cfg.normalize();
	cfg.validate()?;

	Ok(cfg)
}

/// Daemon config (v1).
#[derive(Debug, Clone, Default)]
pub struct KatrixConfig {
	pub transport: TransportSettings,
	pub matrix: MatrixSettings,
	pub bridge: BridgeSettings,
	pub sync: SyncSettings,
	pub server: ServerSettings,
}

/// Message-queue transport settings.
#[derive(Debug, Clone)]
pub struct TransportSettings {
	/// Inbound listener (`tcp://host:port`).
	pub rx_bind: String,
	/// Outbound peer (`tcp://host:port`).
	pub tx_connect: String,
	/// Identity part sent ahead of every outbound message.
	pub identity: String,
	/// Maximum number of remembered command ids.
	pub dedup_capacity: usize,
	/// How long a command id stays remembered.
	pub dedup_ttl: Duration,
	pub max_frame_bytes: usize,
	/// Most parts one inbound message may carry.
	pub max_message_parts: usize,
	/// Outbound reconnect backoff bounds.
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for TransportSettings {
	fn default() -> Self {
		Self {
			rx_bind: "tcp://0.0.0.0:28477".to_string(),
			tx_connect: "tcp://127.0.0.1:28478".to_string(),
			identity: "katrix_daemon".to_string(),
			dedup_capacity: 1024,
			dedup_ttl: Duration::from_secs(3600),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			max_message_parts: DEFAULT_MAX_PARTS,
			reconnect_min_delay: Duration::from_millis(250),
			reconnect_max_delay: Duration::from_secs(10),
		}
	}
}

/// Homeserver account settings.
#[derive(Debug, Clone)]
pub struct MatrixSettings {
	pub homeserver: String,
	pub user: Option<String>,
	pub password: Option<SecretString>,
	/// Room that receives commands that don't name one.
	pub room_id: Option<String>,
	/// Forward room messages from other users to the peer.
	pub forward_room_messages: bool,
}

impl Default for MatrixSettings {
	fn default() -> Self {
		Self {
			homeserver: "https://matrix.org".to_string(),
			user: None,
			password: None,
			room_id: None,
			forward_room_messages: false,
		}
	}
}

/// Command dispatch settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
	/// Platform name stamped on replies and forwarded messages.
	pub platform_name: String,
	/// Token bucket capacity.
	pub bucket_capacity: Duration,
	/// Token bucket cost per admitted send.
	pub bucket_cost: Duration,
	/// Drop an outbound message (and reply fail) when one of its uploads fails.
	pub abandon_failed_uploads: bool,
	/// Default outbound room; filled from `matrix.room_id`.
	pub default_room: Option<String>,
	/// Filled from `matrix.forward_room_messages`.
	pub forward_room_messages: bool,
}

impl Default for BridgeSettings {
	fn default() -> Self {
		let capacity = Duration::from_secs(60);
		Self {
			platform_name: "matrix".to_string(),
			bucket_capacity: capacity,
			bucket_cost: capacity / 4,
			abandon_failed_uploads: true,
			default_room: None,
			forward_room_messages: false,
		}
	}
}

/// Long-poll settings.
#[derive(Debug, Clone)]
pub struct SyncSettings {
	pub timeout: Duration,
	pub retry_min_delay: Duration,
	pub retry_max_delay: Duration,
}

impl Default for SyncSettings {
	fn default() -> Self {
		Self {
			timeout: Duration::from_millis(30_000),
			retry_min_delay: Duration::from_millis(500),
			retry_max_delay: Duration::from_millis(30_000),
		}
	}
}

/// Process-level endpoints.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	transport: FileTransportSettings,

	#[serde(default)]
	matrix: FileMatrixSettings,

	#[serde(default)]
	bridge: FileBridgeSettings,

	#[serde(default)]
	sync: FileSyncSettings,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTransportSettings {
	rx_bind: Option<String>,
	tx_connect: Option<String>,
	identity: Option<String>,
	dedup_capacity: Option<usize>,
	dedup_ttl_secs: Option<u64>,
	max_frame_bytes: Option<usize>,
	max_message_parts: Option<usize>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMatrixSettings {
	homeserver: Option<String>,
	user: Option<String>,
	password: Option<String>,
	room_id: Option<String>,
	forward_room_messages: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBridgeSettings {
	platform_name: Option<String>,
	bucket_capacity_secs: Option<u64>,
	bucket_cost_secs: Option<u64>,
	abandon_failed_uploads: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSyncSettings {
	timeout_ms: Option<u64>,
	retry_min_delay_ms: Option<u64>,
	retry_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl KatrixConfig {
	fn from_file(file: FileConfig) -> Self {
		let t = TransportSettings::default();
		let transport = TransportSettings {
			rx_bind: non_empty(file.transport.rx_bind).unwrap_or(t.rx_bind),
			tx_connect: non_empty(file.transport.tx_connect).unwrap_or(t.tx_connect),
			identity: non_empty(file.transport.identity).unwrap_or(t.identity),
			dedup_capacity: file.transport.dedup_capacity.unwrap_or(t.dedup_capacity),
			dedup_ttl: file.transport.dedup_ttl_secs.map(Duration::from_secs).unwrap_or(t.dedup_ttl),
			max_frame_bytes: file.transport.max_frame_bytes.unwrap_or(t.max_frame_bytes),
			max_message_parts: file
				.transport
				.max_message_parts
				.filter(|v| *v > 0)
				.unwrap_or(t.max_message_parts),
			reconnect_min_delay: file
				.transport
				.reconnect_min_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(t.reconnect_min_delay),
			reconnect_max_delay: file
				.transport
				.reconnect_max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(t.reconnect_max_delay),
		};

		let matrix = MatrixSettings {
			homeserver: non_empty(file.matrix.homeserver).unwrap_or_else(|| MatrixSettings::default().homeserver),
			user: non_empty(file.matrix.user),
			password: non_empty(file.matrix.password).map(SecretString::new),
			room_id: non_empty(file.matrix.room_id),
			forward_room_messages: file.matrix.forward_room_messages.unwrap_or(false),
		};

		let b = BridgeSettings::default();
		let bucket_capacity = file
			.bridge
			.bucket_capacity_secs
			.filter(|v| *v > 0)
			.map(Duration::from_secs)
			.unwrap_or(b.bucket_capacity);
		let bridge = BridgeSettings {
			platform_name: non_empty(file.bridge.platform_name).unwrap_or(b.platform_name),
			bucket_capacity,
			bucket_cost: file
				.bridge
				.bucket_cost_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(bucket_capacity / 4),
			abandon_failed_uploads: file.bridge.abandon_failed_uploads.unwrap_or(b.abandon_failed_uploads),
			default_room: None,
			forward_room_messages: false,
		};

		let s = SyncSettings::default();
		let sync = SyncSettings {
			timeout: file.sync.timeout_ms.map(Duration::from_millis).unwrap_or(s.timeout),
			retry_min_delay: file
				.sync
				.retry_min_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(s.retry_min_delay),
			retry_max_delay: file
				.sync
				.retry_max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(s.retry_max_delay),
		};

		Self {
			transport,
			matrix,
			bridge,
			sync,
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
			},
		}
	}

	/// Copy cross-section values and fix inverted bounds.
	fn normalize(&mut self) {
		self.bridge.default_room = self.matrix.room_id.clone();
		self.bridge.forward_room_messages = self.matrix.forward_room_messages;

		if self.sync.retry_min_delay > self.sync.retry_max_delay {
			warn!(
				min_ms = self.sync.retry_min_delay.as_millis(),
				max_ms = self.sync.retry_max_delay.as_millis(),
				"sync config: retry_min_delay > retry_max_delay; swapping"
			);
			std::mem::swap(&mut self.sync.retry_min_delay, &mut self.sync.retry_max_delay);
		}

		if self.transport.reconnect_min_delay > self.transport.reconnect_max_delay {
			warn!("transport config: reconnect_min_delay > reconnect_max_delay; swapping");
			std::mem::swap(
				&mut self.transport.reconnect_min_delay,
				&mut self.transport.reconnect_max_delay,
			);
		}

		if self.bridge.bucket_cost > self.bridge.bucket_capacity {
			warn!(
				cost_secs = self.bridge.bucket_cost.as_secs(),
				capacity_secs = self.bridge.bucket_capacity.as_secs(),
				"bridge config: bucket cost exceeds capacity; clamping"
			);
			self.bridge.bucket_cost = self.bridge.bucket_capacity;
		}

		if self.transport.dedup_capacity == 0 {
			warn!("transport config: dedup_capacity of 0 disables dedup; using 1");
			self.transport.dedup_capacity = 1;
		}
	}

	/// Reject settings the daemon cannot start with.
	fn validate(&self) -> anyhow::Result<()> {
		validate_tcp_endpoint(&self.transport.rx_bind).map_err(|e| anyhow!("transport.rx_bind: {e}"))?;
		validate_tcp_endpoint(&self.transport.tx_connect).map_err(|e| anyhow!("transport.tx_connect: {e}"))?;
		Ok(())
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut KatrixConfig) {
	if let Some(v) = env_string("KATRIX_RX_BIND") {
		cfg.transport.rx_bind = v;
		info!("transport config: rx_bind overridden by env");
	}

	if let Some(v) = env_string("KATRIX_TX_CONNECT") {
		cfg.transport.tx_connect = v;
		info!("transport config: tx_connect overridden by env");
	}

	if let Some(v) = env_string("KATRIX_IDENTITY") {
		cfg.transport.identity = v;
		info!("transport config: identity overridden by env");
	}

	if let Some(v) = env_string("KATRIX_DEDUP_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.transport.dedup_capacity = capacity;
		info!(capacity, "transport config: dedup_capacity overridden by env");
	}

	if let Some(v) = env_string("KATRIX_DEDUP_TTL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.transport.dedup_ttl = Duration::from_secs(secs);
		info!(secs, "transport config: dedup_ttl overridden by env");
	}

	if let Some(v) = env_string("KATRIX_HOMESERVER") {
		cfg.matrix.homeserver = v;
		info!("matrix config: homeserver overridden by env");
	}

	if let Some(v) = env_string("KATRIX_USER") {
		cfg.matrix.user = Some(v);
		info!("matrix config: user overridden by env");
	}

	if let Some(v) = env_string("KATRIX_PASSWORD") {
		cfg.matrix.password = Some(SecretString::new(v));
		info!("matrix config: password overridden by env");
	}

	if let Some(v) = env_string("KATRIX_ROOM_ID") {
		cfg.matrix.room_id = Some(v);
		info!("matrix config: room_id overridden by env");
	}

	if let Some(v) = env_string("KATRIX_FORWARD_ROOM_MESSAGES")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.matrix.forward_room_messages = enabled;
		info!(enabled, "matrix config: forward_room_messages overridden by env");
	}

	if let Some(v) = env_string("KATRIX_PLATFORM_NAME") {
		cfg.bridge.platform_name = v;
		info!("bridge config: platform_name overridden by env");
	}

	if let Some(v) = env_string("KATRIX_ABANDON_FAILED_UPLOADS")
		&& let Some(abandon) = parse_env_bool(&v)
	{
		cfg.bridge.abandon_failed_uploads = abandon;
		info!(abandon, "bridge config: abandon_failed_uploads overridden by env");
	}

	if let Some(v) = env_string("KATRIX_SYNC_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.sync.timeout = Duration::from_millis(ms);
		info!(ms, "sync config: timeout overridden by env");
	}

	if let Some(v) = env_string("KATRIX_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("KATRIX_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}
}
