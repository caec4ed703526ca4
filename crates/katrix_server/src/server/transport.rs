#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use katrix_protocol::{IpcMessage, MessageKind, MultipartAssembler};
use katrix_util::endpoint::TcpEndpoint;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::TransportSettings;
use crate::server::correlator::ReplyCorrelator;
use crate::server::dedup::DedupWindow;
use crate::server::outbound::{OutboundConfig, OutboundLink};
use crate::server::request::{Outcome, Request};

/// Raw messages waiting for the receive loop.
const RAW_CHANNEL_CAPACITY: usize = 1024;

/// Consumer-side view of the transport.
pub trait Mailbox: Send + Sync + 'static {
	fn has_msgs(&self) -> bool;

	/// Pop the oldest inbound message; correlatable kinds start awaiting a reply.
	fn get_msg(&self) -> Option<IpcMessage>;

	/// Send the reply for `req`, if anything is awaiting one.
	fn reply(&self, req: &Request, outcome: Outcome);

	/// Send an unsolicited message to the peer.
	fn send(&self, msg: IpcMessage);

	/// Forget expired dedup entries.
	fn prune(&self);
}

/// Shared inbound state: queue, dedup window and pending replies.
#[derive(Debug)]
pub struct Inbox {
	queue: VecDeque<IpcMessage>,
	dedup: DedupWindow,
	correlator: ReplyCorrelator,
}

impl Inbox {
	pub fn new(platform: impl Into<String>, dedup_capacity: usize, dedup_ttl: Duration) -> Self {
		Self {
			queue: VecDeque::new(),
			dedup: DedupWindow::new(dedup_capacity, dedup_ttl),
			correlator: ReplyCorrelator::new(platform),
		}
	}

	/// Queue an inbound message. Commands already seen in the window are dropped.
	pub fn accept(&mut self, msg: IpcMessage, now: Instant) -> bool {
		metrics::counter!("katrix_inbound_messages_total", "kind" => msg.kind().name()).increment(1);

		if let IpcMessage::Platform(m) = &msg {
			if m.id.is_empty() {
				debug!("command without id; skipping dedup");
			} else if !self.dedup.check_and_record(&m.id, now) {
				warn!(id = %m.id, "ignoring duplicate command");
				metrics::counter!("katrix_inbound_duplicates_total").increment(1);
				return false;
			}
		}

		trace!(kind = %msg.kind(), queued = self.queue.len() + 1, "inbound message queued");
		self.queue.push_back(msg);
		true
	}

	pub fn has_msgs(&self) -> bool {
		!self.queue.is_empty()
	}

	pub fn pop(&mut self) -> Option<IpcMessage> {
		let msg = self.queue.pop_front()?;
		self.correlator.track(&msg);
		Some(msg)
	}

	pub fn compose_reply(&mut self, req: &Request, outcome: &Outcome) -> Option<IpcMessage> {
		self.correlator.compose(req, outcome)
	}

	pub fn prune(&mut self, now: Instant) -> usize {
		self.dedup.prune(now)
	}

	pub fn pending_replies(&self) -> usize {
		self.correlator.pending_len()
	}
}

/// Duplex message-queue server.
///
/// Inbound: a listener accepts any number of peers; each connection's reader
/// reassembles `[identity][kind][body]` messages and hands them to one receive
/// task that decodes, dedups and queues them. Outbound: replies go through an
/// [`OutboundLink`] to the configured peer.
pub struct TransportServer {
	local_addr: SocketAddr,
	inbox: Arc<Mutex<Inbox>>,
	outbound: OutboundLink,
	shutdown_tx: watch::Sender<bool>,
	accept_task: JoinHandle<()>,
	recv_task: JoinHandle<()>,
}

impl TransportServer {
	pub async fn start(settings: &TransportSettings, platform: &str) -> anyhow::Result<Self> {
		let rx = TcpEndpoint::parse(&settings.rx_bind)
			.map_err(anyhow::Error::msg)
			.context("transport.rx_bind")?;
		let tx = TcpEndpoint::parse(&settings.tx_connect)
			.map_err(anyhow::Error::msg)
			.context("transport.tx_connect")?;

		let listener = TcpListener::bind(rx.hostport())
			.await
			.with_context(|| format!("bind {rx}"))?;
		let local_addr = listener.local_addr().context("listener local_addr")?;
		info!(bind = %local_addr, peer = %tx, identity = %settings.identity, "transport listening");

		let inbox = Arc::new(Mutex::new(Inbox::new(
			platform,
			settings.dedup_capacity,
			settings.dedup_ttl,
		)));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);

		let accept_task = tokio::spawn(run_accept_loop(
			listener,
			raw_tx,
			settings.max_frame_bytes,
			settings.max_message_parts,
			shutdown_rx.clone(),
		));
		let recv_task = tokio::spawn(run_receive_loop(raw_rx, Arc::clone(&inbox), shutdown_rx));

		let outbound = OutboundLink::start(OutboundConfig {
			addr: tx.hostport(),
			identity: settings.identity.clone(),
			max_frame_bytes: settings.max_frame_bytes,
			reconnect_min_delay: settings.reconnect_min_delay,
			reconnect_max_delay: settings.reconnect_max_delay,
		});

		Ok(Self {
			local_addr,
			inbox,
			outbound,
			shutdown_tx,
			accept_task,
			recv_task,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn is_outbound_connected(&self) -> bool {
		self.outbound.is_connected()
	}

	pub fn pending_replies(&self) -> usize {
		self.inbox.lock().pending_replies()
	}

	/// Wait until every reply queued so far has been written.
	pub async fn flush(&self) {
		self.outbound.flush().await;
	}

	/// Stop the receive side, then drain and close the outbound link.
	pub async fn shutdown(self) {
		let _ = self.shutdown_tx.send(true);
		for (name, task) in [("accept", self.accept_task), ("receive", self.recv_task)] {
			if let Err(e) = task.await {
				warn!(task = name, error = %e, "transport task failed");
			}
		}
		self.outbound.shutdown().await;
		info!("transport stopped");
	}
}

impl Mailbox for TransportServer {
	fn has_msgs(&self) -> bool {
		self.inbox.lock().has_msgs()
	}

	fn get_msg(&self) -> Option<IpcMessage> {
		self.inbox.lock().pop()
	}

	fn reply(&self, req: &Request, outcome: Outcome) {
		let Some(msg) = self.inbox.lock().compose_reply(req, &outcome) else {
			return;
		};
		debug!(id = %req.id, success = outcome.is_success(), reply = %msg.kind(), "sending reply");
		metrics::counter!("katrix_replies_total", "kind" => msg.kind().name()).increment(1);
		self.outbound.send(&msg);
	}

	fn send(&self, msg: IpcMessage) {
		self.outbound.send(&msg);
	}

	fn prune(&self) {
		let dropped = self.inbox.lock().prune(Instant::now());
		if dropped > 0 {
			debug!(dropped, "pruned dedup window");
		}
	}
}

async fn run_accept_loop(
	listener: TcpListener,
	raw_tx: mpsc::Sender<Vec<Bytes>>,
	max_frame_bytes: usize,
	max_parts: usize,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut next_conn_id: u64 = 1;
	loop {
		let accepted = tokio::select! {
			_ = shutdown.changed() => break,
			res = listener.accept() => res,
		};

		match accepted {
			Ok((stream, remote)) => {
				let conn_id = next_conn_id;
				next_conn_id += 1;
				debug!(conn_id, %remote, "inbound peer connected");
				metrics::counter!("katrix_inbound_connections_total").increment(1);
				tokio::spawn(read_connection(
					conn_id,
					stream,
					raw_tx.clone(),
					max_frame_bytes,
					max_parts,
					shutdown.clone(),
				));
			}
			Err(e) => {
				warn!(error = %e, "accept failed");
				tokio::time::sleep(Duration::from_millis(100)).await;
			}
		}
	}
	debug!("accept loop stopped");
}

async fn read_connection(
	conn_id: u64,
	mut stream: TcpStream,
	raw_tx: mpsc::Sender<Vec<Bytes>>,
	max_frame_bytes: usize,
	max_parts: usize,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut asm = MultipartAssembler::new(max_frame_bytes).with_max_parts(max_parts);
	let mut buf = vec![0u8; 16 * 1024];

	loop {
		let n = tokio::select! {
			_ = shutdown.changed() => break,
			res = stream.read(&mut buf) => match res {
				Ok(0) => break,
				Ok(n) => n,
				Err(e) => {
					debug!(conn_id, error = %e, "inbound read error");
					break;
				}
			},
		};

		asm.extend(&buf[..n]);
		loop {
			match asm.next_message() {
				Ok(Some(frames)) => {
					if raw_tx.send(frames).await.is_err() {
						return;
					}
				}
				Ok(None) => break,
				Err(e) => {
					error!(conn_id, error = %e, "inbound framing error; closing connection");
					metrics::counter!("katrix_inbound_errors_total", "reason" => "framing").increment(1);
					return;
				}
			}
		}
	}

	if asm.pending_parts() > 0 {
		debug!(conn_id, parts = asm.pending_parts(), "inbound peer left mid-message");
	}
	debug!(conn_id, "inbound peer disconnected");
}

/// Decode one raw inbound message: `[identity][kind][body]`.
pub fn decode_inbound(frames: &[Bytes]) -> Result<(Bytes, IpcMessage), String> {
	let (identity, body) = frames.split_first().ok_or_else(|| "empty message".to_string())?;
	if identity.is_empty() {
		return Err("empty identity".to_string());
	}
	let msg = IpcMessage::from_frames(body).map_err(|e| e.to_string())?;
	Ok((identity.clone(), msg))
}

async fn run_receive_loop(
	mut raw_rx: mpsc::Receiver<Vec<Bytes>>,
	inbox: Arc<Mutex<Inbox>>,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		let frames = tokio::select! {
			_ = shutdown.changed() => break,
			next = raw_rx.recv() => match next {
				Some(f) => f,
				None => break,
			},
		};

		match decode_inbound(&frames) {
			Ok((identity, msg)) => {
				trace!(
					identity = %String::from_utf8_lossy(&identity),
					kind = %msg.kind(),
					"inbound message decoded"
				);
				if msg.kind() == MessageKind::Okay || msg.kind() == MessageKind::Fail {
					debug!(kind = %msg.kind(), "peer sent a reply kind inbound");
				}
				inbox.lock().accept(msg, Instant::now());
			}
			Err(e) => {
				error!(error = %e, frames = frames.len(), "dropping undecodable inbound message");
				metrics::counter!("katrix_inbound_errors_total", "reason" => "decode").increment(1);
			}
		}
	}
	debug!("receive loop stopped");
}
