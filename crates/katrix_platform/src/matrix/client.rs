#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use katrix_domain::{ContentUri, EventId, RoomId, UserId};
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info};

use super::MatrixConfig;
use super::wire::{self, AliasesBody, LoginBody, PresenceBody, ProfileBody, SendBody, SyncBody, UploadBody};
use crate::error::ChatError;
use crate::{ChatClient, LoginResponse, MessageContent, Presence, SecretString, SyncOptions, SyncResponse};

/// Extra time on top of the long-poll timeout before the HTTP request is abandoned.
const SYNC_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
struct Session {
	user_id: UserId,
	access_token: SecretString,
}

/// Client-server API over HTTPS.
#[derive(Debug)]
pub struct MatrixClient {
	config: MatrixConfig,
	http: reqwest::Client,
	session: RwLock<Option<Session>>,
}

impl MatrixClient {
	pub fn new(config: MatrixConfig) -> Result<Self, ChatError> {
		if config.homeserver.trim().is_empty() {
			return Err(ChatError::Invalid("homeserver url cannot be empty".to_string()));
		}
		let http = reqwest::Client::builder()
			.user_agent(concat!("katrix/", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(10))
			.build()?;
		Ok(Self {
			config,
			http,
			session: RwLock::new(None),
		})
	}

	fn client_url(&self, path: &str) -> String {
		format!("{}/_matrix/client/v3{}", self.config.homeserver.trim_end_matches('/'), path)
	}

	fn media_url(&self, path: &str) -> String {
		format!("{}/_matrix/media/v3{}", self.config.homeserver.trim_end_matches('/'), path)
	}

	fn token(&self) -> Result<String, ChatError> {
		self.session
			.read()
			.as_ref()
			.map(|s| s.access_token.expose().to_string())
			.ok_or(ChatError::NotLoggedIn)
	}

	async fn execute<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, ChatError> {
		let resp = req.send().await?;
		let status = resp.status().as_u16();
		let body = resp.bytes().await?;
		let out = wire::decode_body(status, &body);
		if let Err(ChatError::Http { errcode, .. }) = &out
			&& (errcode == "M_UNKNOWN_TOKEN" || status == 401)
		{
			// Stale token; the next call reports NotLoggedIn until a fresh login.
			self.session.write().take();
		}
		out
	}
}

#[async_trait::async_trait]
impl ChatClient for MatrixClient {
	fn user_id(&self) -> Option<UserId> {
		self.session.read().as_ref().map(|s| s.user_id.clone())
	}

	async fn login(&self, user: &str, password: &SecretString) -> Result<LoginResponse, ChatError> {
		let body = json!({
			"type": "m.login.password",
			"identifier": { "type": "m.id.user", "user": user },
			"password": password.expose(),
			"initial_device_display_name": self.config.device_name,
		});
		let resp: LoginBody = self.execute(self.http.post(self.client_url("/login")).json(&body)).await?;

		let user_id = UserId::new(resp.user_id).map_err(|e| ChatError::Invalid(format!("login user_id: {e}")))?;
		let access_token = SecretString::new(resp.access_token);
		*self.session.write() = Some(Session {
			user_id: user_id.clone(),
			access_token: access_token.clone(),
		});

		info!(user = %user_id, device = %resp.device_id, "logged in");
		Ok(LoginResponse {
			user_id,
			device_id: resp.device_id,
			access_token,
		})
	}

	async fn sync(&self, opts: &SyncOptions) -> Result<SyncResponse, ChatError> {
		let mut url = format!("{}?timeout={}", self.client_url("/sync"), opts.timeout.as_millis());
		if let Some(since) = opts.since.as_deref() {
			url.push_str("&since=");
			url.push_str(&urlencoding::encode(since));
		}

		let req = self
			.http
			.get(url)
			.bearer_auth(self.token()?)
			.timeout(opts.timeout + SYNC_GRACE);
		let body: SyncBody = self.execute(req).await?;
		Ok(body.into_response())
	}

	async fn send_message(&self, room: &RoomId, content: &MessageContent) -> Result<EventId, ChatError> {
		let txn_id = uuid::Uuid::new_v4().to_string();
		let url = self.client_url(&format!(
			"/rooms/{}/send/m.room.message/{txn_id}",
			urlencoding::encode(room.as_str())
		));

		let req = self.http.put(url).bearer_auth(self.token()?).json(&content.to_json());
		let resp: SendBody = self.execute(req).await?;
		debug!(room = %room, event_id = %resp.event_id, msgtype = content.msgtype(), "message sent");
		EventId::new(resp.event_id).map_err(|e| ChatError::Invalid(format!("event_id: {e}")))
	}

	async fn upload(&self, data: Bytes, mime: &str, filename: &str) -> Result<ContentUri, ChatError> {
		let url = format!("{}?filename={}", self.media_url("/upload"), urlencoding::encode(filename));
		let size = data.len();

		let req = self
			.http
			.post(url)
			.bearer_auth(self.token()?)
			.header(reqwest::header::CONTENT_TYPE, mime)
			.body(data);
		let resp: UploadBody = self.execute(req).await?;
		debug!(filename, mime, size, uri = %resp.content_uri, "media uploaded");
		ContentUri::parse_mxc(&resp.content_uri).map_err(|e| ChatError::Invalid(format!("content_uri: {e}")))
	}

	async fn presence(&self, user: &UserId) -> Result<Presence, ChatError> {
		let encoded = urlencoding::encode(user.as_str());
		let token = self.token()?;

		let req = self
			.http
			.get(self.client_url(&format!("/presence/{encoded}/status")))
			.bearer_auth(&token);
		let body: PresenceBody = self.execute(req).await?;

		// Profile is decoration; presence is still useful without it.
		let req = self.http.get(self.client_url(&format!("/profile/{encoded}"))).bearer_auth(&token);
		let profile = match self.execute::<ProfileBody>(req).await {
			Ok(p) => p,
			Err(e) => {
				debug!(user = %user, error = %e, "profile lookup failed");
				ProfileBody::default()
			}
		};

		Ok(wire::presence_from(body, profile))
	}

	async fn list_aliases(&self, room: &RoomId) -> Result<Vec<String>, ChatError> {
		let url = self.client_url(&format!("/rooms/{}/aliases", urlencoding::encode(room.as_str())));
		let req = self.http.get(url).bearer_auth(self.token()?);
		let body: AliasesBody = self.execute(req).await?;
		Ok(body.aliases)
	}
}
