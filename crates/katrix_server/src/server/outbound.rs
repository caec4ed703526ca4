#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use katrix_protocol::{IpcMessage, encode_multipart};
use katrix_util::backoff::backoff_delay;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::server::active_object::ActiveObject;

/// Time allowed for queued replies to go out during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Outbound link settings.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
	/// `host:port` of the peer.
	pub addr: String,
	/// Identity part sent ahead of every message.
	pub identity: String,
	pub max_frame_bytes: usize,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

struct Shared {
	writer: Mutex<Option<OwnedWriteHalf>>,
	connected: watch::Sender<bool>,
	lost: Notify,
}

/// Persistent connection to the peer's reply endpoint.
///
/// Messages are written by a gated [`ActiveObject`]: while the connection is
/// down they wait in order and go out once it is back.
pub struct OutboundLink {
	cfg: OutboundConfig,
	shared: Arc<Shared>,
	sender: ActiveObject,
	manager: JoinHandle<()>,
	shutdown_tx: watch::Sender<bool>,
}

impl OutboundLink {
	pub fn start(cfg: OutboundConfig) -> Self {
		let (connected, gate) = watch::channel(false);
		let shared = Arc::new(Shared {
			writer: Mutex::new(None),
			connected,
			lost: Notify::new(),
		});
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let manager = tokio::spawn(run_connection_manager(cfg.clone(), Arc::clone(&shared), shutdown_rx));
		let sender = ActiveObject::gated("outbound", gate);

		Self {
			cfg,
			shared,
			sender,
			manager,
			shutdown_tx,
		}
	}

	pub fn is_connected(&self) -> bool {
		*self.shared.connected.borrow()
	}

	/// Queue `msg` for delivery as `[identity][kind][body]`.
	pub fn send(&self, msg: &IpcMessage) {
		let mut frames = Vec::with_capacity(3);
		frames.push(Bytes::from(self.cfg.identity.clone()));
		frames.extend(msg.to_frames());

		let wire = match encode_multipart(&frames, self.cfg.max_frame_bytes) {
			Ok(buf) => buf.freeze(),
			Err(e) => {
				warn!(kind = %msg.kind(), error = %e, "failed to encode outbound message; dropping");
				metrics::counter!("katrix_outbound_dropped_total", "reason" => "encode").increment(1);
				return;
			}
		};

		let kind = msg.kind();
		let shared = Arc::clone(&self.shared);
		self.sender.submit(async move {
			let mut writer = shared.writer.lock().await;
			let Some(stream) = writer.as_mut() else {
				warn!(%kind, "outbound connection dropped before write; message lost");
				metrics::counter!("katrix_outbound_dropped_total", "reason" => "disconnected").increment(1);
				return;
			};

			match stream.write_all(&wire).await {
				Ok(()) => {
					trace!(%kind, bytes = wire.len(), "outbound message written");
					metrics::counter!("katrix_outbound_messages_total", "kind" => kind.name()).increment(1);
				}
				Err(e) => {
					warn!(%kind, error = %e, "outbound write failed; reconnecting");
					metrics::counter!("katrix_outbound_dropped_total", "reason" => "io").increment(1);
					writer.take();
					shared.connected.send_replace(false);
					shared.lost.notify_one();
				}
			}
		});
	}

	/// Wait until every message queued so far has been written (or dropped).
	pub async fn flush(&self) {
		self.sender.flush().await;
	}

	pub async fn shutdown(self) {
		if tokio::time::timeout(SHUTDOWN_GRACE, self.sender.flush()).await.is_err() {
			warn!("outbound link shutting down with undelivered messages");
		}

		let _ = self.shutdown_tx.send(true);
		if let Err(e) = self.manager.await {
			warn!(error = %e, "outbound connection manager failed");
		}

		if tokio::time::timeout(SHUTDOWN_GRACE, self.sender.shutdown()).await.is_err() {
			warn!("outbound sender did not drain; discarding");
		}
	}
}

async fn run_connection_manager(cfg: OutboundConfig, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
	let mut attempt: u32 = 0;

	loop {
		if *shutdown.borrow() {
			break;
		}

		let stream = tokio::select! {
			_ = shutdown.changed() => break,
			res = TcpStream::connect(&cfg.addr) => res,
		};

		let stream = match stream {
			Ok(s) => s,
			Err(e) => {
				let delay = backoff_delay(attempt, cfg.reconnect_min_delay, cfg.reconnect_max_delay);
				attempt = attempt.saturating_add(1);
				debug!(addr = %cfg.addr, error = %e, delay_ms = delay.as_millis(), "outbound connect failed; retrying");
				tokio::select! {
					_ = shutdown.changed() => break,
					_ = tokio::time::sleep(delay) => continue,
				}
			}
		};

		attempt = 0;
		let _ = stream.set_nodelay(true);
		let (mut reader, writer) = stream.into_split();
		*shared.writer.lock().await = Some(writer);
		shared.connected.send_replace(true);
		metrics::gauge!("katrix_outbound_connected").set(1.0);
		info!(addr = %cfg.addr, "outbound connection established");

		// The peer never sends on this link; a read only tells us it went away.
		let mut scratch = [0u8; 256];
		let stopping = loop {
			tokio::select! {
				_ = shutdown.changed() => break true,
				_ = shared.lost.notified() => {
					if !*shared.connected.borrow() {
						break false;
					}
				}
				res = reader.read(&mut scratch) => match res {
					Ok(0) => break false,
					Ok(n) => trace!(bytes = n, "ignoring data on outbound link"),
					Err(e) => {
						debug!(error = %e, "outbound read error");
						break false;
					}
				},
			}
		};

		shared.connected.send_replace(false);
		shared.writer.lock().await.take();
		metrics::gauge!("katrix_outbound_connected").set(0.0);

		if stopping {
			break;
		}
		warn!(addr = %cfg.addr, "outbound connection lost; reconnecting");
	}

	debug!("outbound connection manager stopped");
}
