#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use bytes::Bytes;
use katrix_domain::{ContentUri, MediaKind, RoomId, guess_mime};
use katrix_platform::{ChatClient, MessageContent};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::server::request::Outcome;
use crate::server::tasks::InFlight;

/// Called once with the final outcome of an aggregated send.
pub type Completion = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Bytes of one resource plus what the homeserver needs to know about it.
#[derive(Debug, Clone)]
pub struct MediaFile {
	pub filename: String,
	pub mime: String,
	pub data: Bytes,
}

/// Fetch a resource named by a local path, a `file://` URI or an `http(s)://` URL.
pub async fn load_media(http: &reqwest::Client, locator: &str) -> anyhow::Result<MediaFile> {
	let locator = locator.trim();
	if locator.is_empty() {
		return Err(anyhow!("empty resource locator"));
	}

	if let Ok(url) = url::Url::parse(locator) {
		match url.scheme() {
			"http" | "https" => {
				let resp = http
					.get(url.clone())
					.send()
					.await
					.with_context(|| format!("fetch {url}"))?
					.error_for_status()
					.with_context(|| format!("fetch {url}"))?;
				let filename = url
					.path_segments()
					.and_then(|mut s| s.next_back())
					.filter(|s| !s.is_empty())
					.unwrap_or("upload")
					.to_string();
				let mime = resp
					.headers()
					.get(reqwest::header::CONTENT_TYPE)
					.and_then(|v| v.to_str().ok())
					.map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
					.filter(|v| !v.is_empty() && v != "application/octet-stream")
					.unwrap_or_else(|| guess_mime(&filename).to_string());
				let data = resp.bytes().await.with_context(|| format!("read body of {url}"))?;
				return Ok(MediaFile { filename, mime, data });
			}
			"file" => {
				let path = url
					.to_file_path()
					.map_err(|_| anyhow!("file uri is not a local path: {locator}"))?;
				return load_path(&path).await;
			}
			// Windows drive letters and the like parse as a scheme; fall through.
			_ => {}
		}
	}

	load_path(&PathBuf::from(locator)).await
}

async fn load_path(path: &Path) -> anyhow::Result<MediaFile> {
	let data = tokio::fs::read(path)
		.await
		.with_context(|| format!("read {}", path.display()))?;
	let filename = path
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_else(|| "upload".to_string());
	Ok(MediaFile {
		mime: guess_mime(&filename).to_string(),
		filename,
		data: Bytes::from(data),
	})
}

/// One attachment of an aggregated message.
#[derive(Debug, Clone)]
pub struct PendingFile {
	pub locator: String,
	pub filename: String,
	pub mime: String,
	pub size: u64,
	pub content_uri: Option<ContentUri>,
}

impl PendingFile {
	pub fn ready(&self) -> bool {
		self.content_uri.is_some()
	}
}

struct TxMessage {
	tx_id: u64,
	room: RoomId,
	message: String,
	files: Vec<PendingFile>,
	remaining: usize,
	done: Completion,
}

struct Uploaded {
	uri: ContentUri,
	file: MediaFile,
}

#[derive(Default)]
struct State {
	pending: VecDeque<TxMessage>,
	next_tx_id: u64,
	uploading: bool,
}

/// Tracks multi-file messages until every attachment has a content locator.
///
/// While a message is in progress the `uploading` flag is set, which holds the
/// command queue. Each upload carries `(tx_id, file_index)`, so its result is
/// attributed to the file that issued it.
pub struct UploadAggregator {
	client: Arc<dyn ChatClient>,
	http: reqwest::Client,
	abandon_failed: bool,
	state: Mutex<State>,
	tasks: InFlight,
}

impl UploadAggregator {
	pub fn new(client: Arc<dyn ChatClient>, abandon_failed: bool, tasks: InFlight) -> Self {
		Self {
			client,
			http: reqwest::Client::new(),
			abandon_failed,
			state: Mutex::new(State::default()),
			tasks,
		}
	}

	pub fn is_uploading(&self) -> bool {
		self.state.lock().uploading
	}

	/// Number of messages still waiting on uploads.
	pub fn pending_len(&self) -> usize {
		self.state.lock().pending.len()
	}

	/// Start uploading `locators`; once all are stored, send one message per
	/// file followed by `text`, then call `done`.
	pub fn send_media_message(self: &Arc<Self>, room: RoomId, text: String, locators: Vec<String>, done: Completion) -> u64 {
		let files: Vec<PendingFile> = locators
			.iter()
			.map(|l| PendingFile {
				locator: l.clone(),
				filename: String::new(),
				mime: String::new(),
				size: 0,
				content_uri: None,
			})
			.collect();
		let count = files.len();

		let tx_id = {
			let mut st = self.state.lock();
			st.next_tx_id += 1;
			let tx_id = st.next_tx_id;
			st.uploading = true;
			st.pending.push_back(TxMessage {
				tx_id,
				room,
				message: text,
				files,
				remaining: count,
				done,
			});
			tx_id
		};
		info!(tx_id, files = count, "media message started");

		if count == 0 {
			let this = Arc::clone(self);
			self.tasks.spawn(async move { this.complete_if_ready(tx_id).await });
		}

		for (index, locator) in locators.into_iter().enumerate() {
			let this = Arc::clone(self);
			self.tasks.spawn(async move {
				let result = this.upload_one(&locator).await;
				this.on_uploaded(tx_id, index, result).await;
			});
		}

		tx_id
	}

	async fn upload_one(&self, locator: &str) -> anyhow::Result<Uploaded> {
		let file = load_media(&self.http, locator).await?;
		let uri = self
			.client
			.upload(file.data.clone(), &file.mime, &file.filename)
			.await
			.with_context(|| format!("upload {}", file.filename))?;
		Ok(Uploaded { uri, file })
	}

	async fn on_uploaded(&self, tx_id: u64, index: usize, result: anyhow::Result<Uploaded>) {
		let abandoned = {
			let mut st = self.state.lock();
			let Some(pos) = st.pending.iter().position(|t| t.tx_id == tx_id) else {
				debug!(tx_id, index, "upload finished for a message no longer pending");
				return;
			};

			match result {
				Ok(up) => {
					metrics::counter!("katrix_uploads_total", "result" => "ok").increment(1);
					let tx = &mut st.pending[pos];
					if let Some(file) = tx.files.get_mut(index)
						&& !file.ready()
					{
						debug!(tx_id, index, uri = %up.uri, "upload stored");
						file.filename = up.file.filename;
						file.mime = up.file.mime;
						file.size = up.file.data.len() as u64;
						file.content_uri = Some(up.uri);
						tx.remaining = tx.remaining.saturating_sub(1);
					}
					trace!(tx_id, remaining = tx.remaining, "upload progress");
					None
				}
				Err(e) => {
					warn!(tx_id, index, error = %format!("{e:#}"), "upload failed");
					metrics::counter!("katrix_uploads_total", "result" => "error").increment(1);
					if !self.abandon_failed {
						return;
					}
					let tx = st.pending.remove(pos);
					st.uploading = false;
					tx.map(|tx| (tx, format!("{e:#}")))
				}
			}
		};

		match abandoned {
			Some((tx, reason)) => {
				warn!(tx_id = tx.tx_id, "abandoning media message after failed upload");
				(tx.done)(Outcome::Failure(reason));
			}
			None => self.complete_if_ready(tx_id).await,
		}
	}

	async fn complete_if_ready(&self, tx_id: u64) {
		let tx = {
			let mut st = self.state.lock();
			let Some(pos) = st.pending.iter().position(|t| t.tx_id == tx_id && t.remaining == 0) else {
				return;
			};
			st.pending.remove(pos)
		};
		if let Some(tx) = tx {
			self.flush(tx).await;
		}
	}

	/// Send every file, then the text; clear the uploading flag and report.
	async fn flush(&self, tx: TxMessage) {
		let TxMessage {
			tx_id,
			room,
			message,
			files,
			done,
			..
		} = tx;
		debug!(tx_id, files = files.len(), "all uploads stored; sending");

		let mut failure: Option<String> = None;
		for file in files {
			let Some(url) = file.content_uri else {
				continue;
			};
			let content = MessageContent::Media {
				kind: MediaKind::from_mime(&file.mime),
				body: file.filename.clone(),
				url,
				mime: file.mime,
				size: Some(file.size),
			};
			if let Err(e) = self.client.send_message(&room, &content).await {
				warn!(tx_id, file = %file.filename, error = %e, "failed to send media message");
				failure.get_or_insert_with(|| e.to_string());
			}
		}

		if !message.trim().is_empty()
			&& let Err(e) = self.client.send_message(&room, &MessageContent::text(message)).await
		{
			warn!(tx_id, error = %e, "failed to send message text");
			failure.get_or_insert_with(|| e.to_string());
		}

		self.state.lock().uploading = false;
		info!(tx_id, ok = failure.is_none(), "media message finished");
		done(failure.map(Outcome::Failure).unwrap_or(Outcome::Success));
	}
}
