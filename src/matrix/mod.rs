//! Matrix transport over the client-server HTTP API.
//!
//! The client joins the probed rooms at startup, sends probes as plain text
//! messages and runs an endless `/sync` long-poll as its ingestion loop.
//! Probe traffic is handed to the sink with the homeserver's
//! `origin_server_ts` as relay timestamp; `!ping` commands are answered
//! directly.

pub mod api;
pub mod command;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    configuration::MatrixConfig,
    probe::Kind,
    time::{from_unix_millis, now, to_unix_nanos},
    transport::{Envelope, EnvelopeSink, Room, Transport, TransportError},
};

use api::{ErrorResponse, JoinResponse, RoomEvent, SendResponse, SyncResponse, TextMessage};
use command::{ping_reply, PING_COMMAND};

/// HTML format used for formatted messages.
pub const HTML_FORMAT: &str = "org.matrix.custom.html";

/// Message type of notices; notices never trigger commands.
pub const NOTICE_MESSAGE_TYPE: &str = "m.notice";

/// Long-poll timeout passed to `/sync`.
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Request timeout for everything except `/sync`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed sync before retrying.
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Errors returned by the Matrix client.
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Invalid homeserver URL: {0}")]
    Url(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Homeserver returned {status}: {errcode} {error}")]
    Api {
        status: StatusCode,
        errcode: String,
        error: String,
    },
}

impl From<MatrixError> for TransportError {
    fn from(e: MatrixError) -> Self {
        TransportError::Connection(e.to_string())
    }
}

/// A Matrix client usable as the probe transport.
#[derive(Clone)]
pub struct MatrixClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    homeserver: Url,
    token: String,
    user: String,
    message_type: String,
    txn_prefix: i64,
    txn_counter: AtomicU64,
}

impl MatrixClient {
    /// Creates a client without contacting the homeserver.
    pub fn new(config: &MatrixConfig) -> Result<MatrixClient, MatrixError> {
        let homeserver =
            Url::parse(&config.homeserver).map_err(|e| MatrixError::Url(e.to_string()))?;
        if homeserver.cannot_be_a_base() {
            return Err(MatrixError::Url(config.homeserver.clone()));
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(MatrixClient {
            inner: Arc::new(Inner {
                http,
                homeserver,
                token: config.token.clone(),
                user: config.user.clone(),
                message_type: config.message_type.clone(),
                txn_prefix: to_unix_nanos(now()),
                txn_counter: AtomicU64::new(0),
            }),
        })
    }

    /// Creates a client and joins every configured room.
    ///
    /// Returns the client and the rooms with their destinations resolved to
    /// room ids, so aliases in the configuration work.
    pub async fn connect(config: &MatrixConfig) -> Result<(MatrixClient, Vec<Room>), MatrixError> {
        let client = MatrixClient::new(config)?;

        let mut rooms = Vec::with_capacity(config.rooms.len());
        for (name, room) in &config.rooms {
            let room_id = client.join_room(room).await?;
            log::info!("Joined {} ({}) as {}", name, room_id, client.inner.user);
            rooms.push(Room::new(name.clone(), room_id));
        }

        Ok((client, rooms))
    }

    /// Joins a room by id or alias and returns its id.
    pub async fn join_room(&self, room: &str) -> Result<String, MatrixError> {
        let url = self.endpoint(&["join", room])?;
        let resp: JoinResponse = self
            .request(Method::POST, url, Some(&serde_json::json!({})), REQUEST_TIMEOUT)
            .await?;
        Ok(resp.room_id)
    }

    /// Sends a plain text message with the configured message type.
    pub async fn send_text(&self, room_id: &str, text: &str) -> Result<String, MatrixError> {
        let content = TextMessage {
            msgtype: &self.inner.message_type,
            body: text,
        };
        self.send_message(room_id, &content).await
    }

    /// Sends an `m.room.message` event with arbitrary content.
    pub async fn send_message<T: Serialize + ?Sized>(
        &self,
        room_id: &str,
        content: &T,
    ) -> Result<String, MatrixError> {
        let txn_id = format!(
            "{}.{}",
            self.inner.txn_prefix,
            self.inner.txn_counter.fetch_add(1, Ordering::Relaxed)
        );
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", &txn_id])?;
        let resp: SendResponse = self
            .request(Method::PUT, url, Some(content), REQUEST_TIMEOUT)
            .await?;
        Ok(resp.event_id)
    }

    /// Performs one `/sync` request.
    pub async fn sync(
        &self,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncResponse, MatrixError> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout.as_millis().to_string());
            match since {
                Some(since) => {
                    query.append_pair("since", since);
                }
                None => {
                    // History is not interesting, only the position
                    query.append_pair("filter", r#"{"room":{"timeline":{"limit":1}}}"#);
                }
            }
        }

        self.request::<SyncResponse, ()>(Method::GET, url, None, timeout + REQUEST_TIMEOUT)
            .await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, MatrixError> {
        let mut url = self.inner.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| MatrixError::Url(self.inner.homeserver.to_string()))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    async fn request<R, B>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<R, MatrixError>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut req = self
            .inner
            .http
            .request(method, url)
            .bearer_auth(&self.inner.token)
            .timeout(timeout);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let err: ErrorResponse = resp.json().await.unwrap_or_default();
            return Err(MatrixError::Api {
                status,
                errcode: err.errcode,
                error: err.error,
            });
        }

        Ok(resp.json().await?)
    }

    /// Dispatches one timeline event.
    fn handle_event(
        &self,
        room_id: &str,
        event: &RoomEvent,
        received_at: chrono::DateTime<chrono::Utc>,
        sink: &dyn EnvelopeSink,
    ) {
        let Some(msg) = event.message() else {
            return;
        };
        if msg.body.is_empty() {
            log::debug!("Ignoring message {} in {}", event.event_id, room_id);
            return;
        }

        let cmd = msg.body.split(' ').next().unwrap_or_default();
        log::debug!("Received message with command {:?} in {}", cmd, room_id);
        let is_probe = cmd.parse::<Kind>().is_ok();
        let is_command = cmd == PING_COMMAND;

        if is_probe {
            sink.deliver(Envelope {
                destination: room_id.to_string(),
                text: msg.body,
                relayed_at: from_unix_millis(event.origin_server_ts),
                received_at,
            });
        } else if is_command {
            if msg.msgtype == NOTICE_MESSAGE_TYPE {
                log::debug!("Ignoring notice message {} in {}", event.event_id, room_id);
                return;
            }
            self.answer_ping_command(room_id, event, &msg.body, received_at);
        }
    }

    fn answer_ping_command(
        &self,
        room_id: &str,
        event: &RoomEvent,
        body: &str,
        received_at: chrono::DateTime<chrono::Utc>,
    ) {
        let delay = match from_unix_millis(event.origin_server_ts) {
            Some(sent) => received_at - sent,
            None => chrono::TimeDelta::zero(),
        };
        let content = ping_reply(
            &self.inner.message_type,
            &event.sender,
            room_id,
            &event.event_id,
            body,
            delay,
        );

        let client = self.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.send_message(&room_id, &content).await {
                log::error!("Error sending response to {}: {}", PING_COMMAND, e);
            }
        });
    }
}

#[async_trait]
impl Transport for MatrixClient {
    fn name(&self) -> &str {
        "matrix"
    }

    async fn send(&self, destination: &str, text: &str) -> Result<(), TransportError> {
        self.send_text(destination, text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send {
                destination: destination.to_string(),
                reason: e.to_string(),
            })
    }

    async fn listen(&self, sink: Arc<dyn EnvelopeSink>) -> Result<(), TransportError> {
        // Skip everything that happened before startup
        let mut since = loop {
            match self.sync(None, Duration::ZERO).await {
                Ok(resp) => break resp.next_batch,
                Err(e) => {
                    log::error!("Initial sync error: {}", e);
                    tokio::time::sleep(SYNC_RETRY_DELAY).await;
                }
            }
        };

        loop {
            match self.sync(Some(&since), SYNC_TIMEOUT).await {
                Ok(resp) => {
                    let received_at = now();
                    for (room_id, room) in &resp.rooms.join {
                        for event in &room.timeline.events {
                            self.handle_event(room_id, event, received_at, sink.as_ref());
                        }
                    }
                    since = resp.next_batch;
                }
                Err(e) => {
                    log::error!("Sync error: {}", e);
                    tokio::time::sleep(SYNC_RETRY_DELAY).await;
                }
            }
        }
    }
}
