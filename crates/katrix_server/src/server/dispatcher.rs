#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use katrix_domain::{RoomId, UserId};
use katrix_platform::{ChatClient, ChatError, MessageContent, Presence, SyncResponse};
use katrix_protocol::{IpcMessage, pb};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::BridgeSettings;
use crate::server::bucket::TokenBucket;
use crate::server::polls::PollTally;
use crate::server::request::{Outcome, Request, normalize};
use crate::server::rooms::RoomDirectory;
use crate::server::tasks::InFlight;
use crate::server::transport::Mailbox;
use crate::server::uploads::UploadAggregator;
use crate::util::time::unix_ms_ago;

/// Deferred chat send.
type Deferred = Box<dyn FnOnce() + Send + 'static>;

/// FIFO of deferred sends plus the bucket that paces them.
struct CommandQueue {
	jobs: VecDeque<Deferred>,
	bucket: TokenBucket,
}

/// Info query kinds answered by the bridge.
pub mod info_kind {
	pub const PRESENCE: &str = "presence";
	pub const ROOMS: &str = "rooms";
	pub const POLLS: &str = "polls";
}

/// Turns requests into chat operations and reports their outcome.
///
/// Info queries are answered right away. Commands are deferred onto the
/// command queue, which drains only while no upload is in progress and the
/// token bucket admits the next send.
pub struct Dispatcher {
	client: Arc<dyn ChatClient>,
	mailbox: Arc<dyn Mailbox>,
	settings: BridgeSettings,
	queue: Mutex<CommandQueue>,
	uploads: Arc<UploadAggregator>,
	rooms: Arc<RoomDirectory>,
	polls: Arc<PollTally>,
	tasks: InFlight,
}

impl Dispatcher {
	pub fn new(client: Arc<dyn ChatClient>, mailbox: Arc<dyn Mailbox>, settings: BridgeSettings) -> Arc<Self> {
		let tasks = InFlight::new();
		let uploads = Arc::new(UploadAggregator::new(
			Arc::clone(&client),
			settings.abandon_failed_uploads,
			tasks.clone(),
		));
		let bucket = TokenBucket::new(settings.bucket_capacity, settings.bucket_cost);

		Arc::new(Self {
			client,
			mailbox,
			settings,
			queue: Mutex::new(CommandQueue {
				jobs: VecDeque::new(),
				bucket,
			}),
			uploads,
			rooms: Arc::new(RoomDirectory::new()),
			polls: Arc::new(PollTally::new()),
			tasks,
		})
	}

	pub fn rooms(&self) -> &RoomDirectory {
		&self.rooms
	}

	pub fn polls(&self) -> &PollTally {
		&self.polls
	}

	pub fn uploads(&self) -> &UploadAggregator {
		&self.uploads
	}

	pub fn queue_len(&self) -> usize {
		self.queue.lock().jobs.len()
	}

	/// Wait for every in-flight chat operation (and anything it spawns) to finish.
	pub async fn settle(&self) {
		self.tasks.settle().await;
	}

	/// Drop every command still waiting in the queue. Returns how many were dropped.
	pub fn discard_queued(&self) -> usize {
		let mut queue = self.queue.lock();
		let dropped = queue.jobs.len();
		queue.jobs.clear();
		metrics::gauge!("katrix_command_queue_len").set(0.0);
		dropped
	}

	/// Route one request: answer queries now, defer commands.
	pub fn process_request(self: &Arc<Self>, req: Request) {
		if req.info {
			let this = Arc::clone(self);
			self.tasks.spawn(async move { this.answer_info(req).await });
			return;
		}

		let this = Arc::clone(self);
		let id = req.id.clone();
		let mut queue = self.queue.lock();
		queue.jobs.push_back(Box::new(move || this.execute(req)));
		debug!(id = %id, queued = queue.jobs.len(), "command deferred");
		metrics::gauge!("katrix_command_queue_len").set(queue.jobs.len() as f64);
	}

	/// Drain the command queue while nothing is uploading and tokens are available.
	///
	/// Returns how many commands were started.
	pub fn process_queue(&self) -> usize {
		let mut started = 0;
		loop {
			if self.uploads.is_uploading() {
				trace!("upload in progress; holding command queue");
				break;
			}

			let job = {
				let mut queue = self.queue.lock();
				if queue.jobs.is_empty() {
					break;
				}
				if !queue.bucket.request(1) {
					debug!(queued = queue.jobs.len(), "rate limited; resuming next tick");
					metrics::counter!("katrix_bucket_rejections_total").increment(1);
					break;
				}
				let job = queue.jobs.pop_front();
				metrics::gauge!("katrix_command_queue_len").set(queue.jobs.len() as f64);
				job
			};

			if let Some(job) = job {
				job();
				started += 1;
			}
		}
		started
	}

	/// Pop every queued inbound message and route it.
	pub fn drain_inbound(self: &Arc<Self>) -> usize {
		let mut routed = 0;
		while let Some(msg) = self.mailbox.get_msg() {
			if let Some(req) = normalize(&msg) {
				self.process_request(req);
				routed += 1;
			}
		}
		routed
	}

	/// One maintenance pass after a successful sync.
	pub fn maintenance(self: &Arc<Self>) {
		let routed = self.drain_inbound();
		let started = self.process_queue();
		self.refresh_aliases();
		self.mailbox.prune();
		if routed > 0 || started > 0 {
			debug!(routed, started, "maintenance pass");
		}
	}

	/// Record rooms from one sync response; with `with_timeline`, also log room
	/// messages, count votes and forward messages from other users.
	pub fn observe_sync(&self, resp: &SyncResponse, with_timeline: bool) {
		let me = self.client.user_id();
		for room in &resp.rooms {
			if self.rooms.record(&room.room_id) {
				info!(room = %room.room_id, known = self.rooms.len(), "discovered room");
			}
			if !with_timeline {
				continue;
			}

			for ev in room.timeline.iter().filter(|e| e.is_room_message()) {
				info!(room = %room.room_id, "{}: {}", ev.sender, ev.body());

				if let Some((poll, option)) = self.polls.apply_message(ev.body()) {
					debug!(%poll, %option, votes = self.polls.count(&poll, &option), "vote counted");
				}

				let from_me = me.as_ref().is_some_and(|u| u.as_str() == ev.sender);
				if self.settings.forward_room_messages && !from_me {
					self.mailbox.send(IpcMessage::Platform(pb::PlatformMessage {
						platform: self.settings.platform_name.clone(),
						id: ev.event_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
						user: ev.sender.clone(),
						content: ev.body().to_string(),
						args: room.room_id.to_string(),
						time: ev.time(),
						..Default::default()
					}));
					metrics::counter!("katrix_forwarded_messages_total").increment(1);
				}
			}
		}
	}

	fn refresh_aliases(&self) {
		for room in self.rooms.claim_unresolved() {
			let client = Arc::clone(&self.client);
			let rooms = Arc::clone(&self.rooms);
			self.tasks.spawn(async move {
				match client.list_aliases(&room).await {
					Ok(aliases) => {
						debug!(room = %room, count = aliases.len(), "room aliases resolved");
						rooms.set_aliases(&room, aliases);
					}
					Err(e) => {
						debug!(room = %room, error = %e, "alias lookup failed; will retry");
						rooms.release(&room);
					}
				}
			});
		}
	}

	fn target_room(&self, req: &Request) -> Option<RoomId> {
		let args = req.args.trim();
		if args.starts_with('!') {
			return RoomId::new(args).ok();
		}
		self.settings
			.default_room
			.as_deref()
			.and_then(|r| RoomId::new(r).ok())
	}

	/// Body of a deferred command.
	fn execute(self: Arc<Self>, req: Request) {
		let Some(room) = self.target_room(&req) else {
			warn!(id = %req.id, "command has no target room");
			self.mailbox.reply(&req, Outcome::failure("no target room"));
			return;
		};

		let locators = req.media_locators();
		if let Some(first) = locators.first() {
			if locators.len() > 1 {
				debug!(id = %req.id, extra = locators.len() - 1, "only the first resource is sent");
			}
			let mailbox = Arc::clone(&self.mailbox);
			let reply_req = req.clone();
			self.uploads.send_media_message(
				room,
				req.text.clone(),
				vec![first.clone()],
				Box::new(move |outcome| mailbox.reply(&reply_req, outcome)),
			);
			return;
		}

		let tasks = self.tasks.clone();
		tasks.spawn(async move {
			let result = self.client.send_message(&room, &MessageContent::text(req.text.clone())).await;
			match &result {
				Ok(event_id) => debug!(id = %req.id, %event_id, "command sent"),
				Err(e) => warn!(id = %req.id, error = %e, "command send failed"),
			}
			self.mailbox.reply(&req, result.map(|_| ()).into());
		});
	}

	async fn answer_info(&self, mut req: Request) {
		let answer = match req.text.as_str() {
			info_kind::PRESENCE => self.presence_json(&req.args).await,
			info_kind::ROOMS => Ok(self.rooms.snapshot_json()),
			info_kind::POLLS => Ok(self.polls.snapshot_json()),
			other => Err(format!("unknown info kind: {other}")),
		};

		match answer {
			Ok(text) => {
				trace!(kind = %req.id, "info query answered");
				req.text = text;
				self.mailbox.reply(&req, Outcome::Success);
			}
			Err(reason) => {
				warn!(kind = %req.id, %reason, "info query failed");
				self.mailbox.reply(&req, Outcome::Failure(reason));
			}
		}
	}

	async fn presence_json(&self, target: &str) -> Result<String, String> {
		let user = match target.trim() {
			"" => self.client.user_id().ok_or_else(|| ChatError::NotLoggedIn.to_string())?,
			t => UserId::new(t).map_err(|e| format!("invalid user id: {e}"))?,
		};
		let presence = self.client.presence(&user).await.map_err(|e| e.to_string())?;
		Ok(presence_to_json(&user, &presence).to_string())
	}
}

/// Presence answer: name, avatar, last, active, status, presence.
pub fn presence_to_json(user: &UserId, p: &Presence) -> serde_json::Value {
	serde_json::json!({
		"name": p.displayname.clone().unwrap_or_else(|| user.localpart().to_string()),
		"avatar": p.avatar_url.clone().unwrap_or_default(),
		"last": p.last_active_ago.map(unix_ms_ago),
		"active": p.currently_active.unwrap_or(false),
		"status": p.status_msg.clone().unwrap_or_default(),
		"presence": p.presence,
	})
}
