//! Registration handshake with the task broker.
//!
//! The launcher connects over a WebSocket, registers as a runner, sends a
//! non-expiring task offer, and waits for the broker to accept it. Only then
//! has the broker committed to sending a task, and the real runner can be
//! started to pick it up.
//!
//! ```text
//!   broker                         launcher
//!     │ ── broker:inforequest ──────► │
//!     │ ◄───────────── runner:info ── │
//!     │ ── broker:runnerregistered ─► │
//!     │ ◄──────── runner:taskoffer ── │  (validFor = -1)
//!     │ ── broker:taskofferaccept ──► │
//!     │ ◄───── runner:taskdeferred ── │
//! ```

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};
use tungstenite::client::IntoClientRequest;
use tungstenite::error::{CapacityError, ProtocolError};
use tungstenite::http::{HeaderValue, Uri, header::AUTHORIZATION};
use tungstenite::protocol::WebSocketConfig;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

pub const MSG_RUNNER_INFO: &str = "runner:info";
pub const MSG_RUNNER_TASK_OFFER: &str = "runner:taskoffer";
pub const MSG_RUNNER_TASK_DEFERRED: &str = "runner:taskdeferred";
pub const MSG_BROKER_INFO_REQUEST: &str = "broker:inforequest";
pub const MSG_BROKER_RUNNER_REGISTERED: &str = "broker:runnerregistered";
pub const MSG_BROKER_TASK_OFFER_ACCEPT: &str = "broker:taskofferaccept";

/// Name the launcher registers under.
pub const RUNNER_NAME: &str = "Launcher";

/// Offer validity that tells the broker the offer never expires.
pub const NON_EXPIRING: i64 = -1;

/// Default cap on a single inbound message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("received invalid handshake config: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid task broker URI: {0}")]
    InvalidUri(String),

    #[error("websocket connection failed: {0}")]
    Connect(#[source] tungstenite::Error),

    /// The broker closed the connection; it may be restarting.
    #[error("task broker is down")]
    BrokerDown,

    /// An inbound message did not fit the receive limit.
    #[error("websocket message too large for buffer (limit {limit} bytes)")]
    MessageTooLarge { limit: usize },

    #[error("failed to read message: {0}")]
    Receive(#[source] tungstenite::Error),

    #[error("failed to send `{kind}`: {source}")]
    Send {
        kind: &'static str,
        #[source]
        source: tungstenite::Error,
    },

    #[error("handshake thread exited without reporting a result")]
    Aborted,
}

/// JSON envelope shared by every message in both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_for: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub task_type: String,
    pub broker_uri: String,
    pub grant_token: String,
    pub max_message_size: usize,
}

impl HandshakeConfig {
    pub fn new(task_type: &str, broker_uri: &str, grant_token: &str) -> Self {
        Self {
            task_type: task_type.to_string(),
            broker_uri: broker_uri.to_string(),
            grant_token: grant_token.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    fn validate(&self) -> Result<(), HandshakeError> {
        if self.task_type.is_empty() {
            return Err(HandshakeError::InvalidConfig("runner type is missing"));
        }
        if self.broker_uri.is_empty() {
            return Err(HandshakeError::InvalidConfig("task broker URI is missing"));
        }
        if self.grant_token.is_empty() {
            return Err(HandshakeError::InvalidConfig("grant token is missing"));
        }
        Ok(())
    }
}

/// `launcher-` plus 16 random hex characters.
pub fn random_id() -> String {
    let bytes: [u8; 8] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("launcher-{hex}")
}

/// Build `ws(s)://{authority}/runners/_ws?id={runner_id}` from the broker URI.
pub fn websocket_url(broker_uri: &str, runner_id: &str) -> Result<String, HandshakeError> {
    let with_scheme = if broker_uri.starts_with("http://") || broker_uri.starts_with("https://") {
        broker_uri.to_string()
    } else {
        format!("http://{broker_uri}")
    };

    let uri: Uri = with_scheme
        .parse()
        .map_err(|e| HandshakeError::InvalidUri(format!("{broker_uri}: {e}")))?;
    if uri.query().is_some() {
        return Err(HandshakeError::InvalidUri(
            "task broker URI must have no query params".into(),
        ));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| HandshakeError::InvalidUri(format!("{broker_uri}: missing host")))?;
    let scheme = if uri.scheme_str() == Some("https") {
        "wss"
    } else {
        "ws"
    };
    Ok(format!("{scheme}://{authority}/runners/_ws?id={runner_id}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingInfoRequest,
    AwaitingRegistrationAck,
    AwaitingOfferAccept,
    Complete,
}

/// Protocol state for one handshake, independent of the transport.
#[derive(Debug)]
pub struct HandshakeSession {
    runner_id: String,
    task_type: String,
    state: HandshakeState,
}

impl HandshakeSession {
    pub fn new(runner_id: &str, task_type: &str) -> Self {
        Self {
            runner_id: runner_id.to_string(),
            task_type: task_type.to_string(),
            state: HandshakeState::AwaitingInfoRequest,
        }
    }

    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Advance on an inbound message, returning the reply to send. Messages
    /// that don't match the current state are ignored.
    pub fn on_message(&mut self, msg: &Envelope) -> Option<Envelope> {
        match (self.state, msg.kind.as_str()) {
            (HandshakeState::AwaitingInfoRequest, MSG_BROKER_INFO_REQUEST) => {
                self.state = HandshakeState::AwaitingRegistrationAck;
                Some(Envelope {
                    types: vec![self.task_type.clone()],
                    name: Some(RUNNER_NAME.to_string()),
                    ..Envelope::new(MSG_RUNNER_INFO)
                })
            }
            (HandshakeState::AwaitingRegistrationAck, MSG_BROKER_RUNNER_REGISTERED) => {
                self.state = HandshakeState::AwaitingOfferAccept;
                Some(Envelope {
                    task_type: Some(self.task_type.clone()),
                    offer_id: Some(random_id()),
                    valid_for: Some(NON_EXPIRING),
                    ..Envelope::new(MSG_RUNNER_TASK_OFFER)
                })
            }
            (HandshakeState::AwaitingOfferAccept, MSG_BROKER_TASK_OFFER_ACCEPT) => {
                self.state = HandshakeState::Complete;
                Some(Envelope {
                    task_id: msg.task_id.clone(),
                    ..Envelope::new(MSG_RUNNER_TASK_DEFERRED)
                })
            }
            (state, kind) => {
                tracing::debug!(?state, kind, "ignoring unexpected message");
                None
            }
        }
    }

    /// Drive the protocol over `ws` until it completes or the connection fails.
    pub fn run<S: Read + Write>(
        &mut self,
        ws: &mut WebSocket<S>,
        max_message_size: usize,
    ) -> Result<(), HandshakeError> {
        while self.state != HandshakeState::Complete {
            let text = match ws.read() {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "broker closed connection");
                    return Err(HandshakeError::BrokerDown);
                }
                // Pings are answered by tungstenite on the next read/write.
                Ok(_) => continue,
                Err(e) => return Err(classify_read_error(e, max_message_size)),
            };

            let msg: Envelope = match serde_json::from_str(text.as_str()) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unparseable message");
                    continue;
                }
            };
            tracing::debug!(kind = %msg.kind, "<- received message");

            let Some(reply) = self.on_message(&msg) else {
                continue;
            };
            send(ws, &reply)?;

            match reply.kind.as_str() {
                MSG_RUNNER_INFO => {
                    tracing::debug!(kind = %reply.kind, runner_id = %self.runner_id, "-> sent message");
                }
                MSG_RUNNER_TASK_OFFER => {
                    tracing::debug!(kind = %reply.kind, offer_id = ?reply.offer_id, "-> sent message");
                    tracing::info!("waiting for task offer to be accepted");
                }
                _ => {
                    tracing::debug!(kind = %reply.kind, task_id = ?reply.task_id, "-> sent message");
                }
            }
        }
        Ok(())
    }
}

fn send<S: Read + Write>(ws: &mut WebSocket<S>, msg: &Envelope) -> Result<(), HandshakeError> {
    let kind = match msg.kind.as_str() {
        MSG_RUNNER_INFO => MSG_RUNNER_INFO,
        MSG_RUNNER_TASK_OFFER => MSG_RUNNER_TASK_OFFER,
        _ => MSG_RUNNER_TASK_DEFERRED,
    };
    let json = serde_json::to_string(msg).map_err(|e| HandshakeError::Send {
        kind,
        source: tungstenite::Error::Io(e.into()),
    })?;
    ws.send(Message::text(json))
        .map_err(|source| HandshakeError::Send { kind, source })
}

/// Closure of any kind means the broker went away; oversized input is fatal.
fn classify_read_error(err: tungstenite::Error, max_message_size: usize) -> HandshakeError {
    use std::io::ErrorKind;

    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            HandshakeError::BrokerDown
        }
        tungstenite::Error::Io(ref io)
            if matches!(
                io.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ) =>
        {
            HandshakeError::BrokerDown
        }
        tungstenite::Error::Capacity(CapacityError::MessageTooLong { .. }) => {
            HandshakeError::MessageTooLarge {
                limit: max_message_size,
            }
        }
        other => HandshakeError::Receive(other),
    }
}

/// Best-effort close; the broker may already be gone.
fn close<S: Read + Write>(ws: &mut WebSocket<S>) {
    let _ = ws.close(None);
    let _ = ws.flush();
}

/// Register with the broker and block until it accepts our task offer.
///
/// The connection is always closed before this returns.
pub fn handshake(cfg: &HandshakeConfig) -> Result<(), HandshakeError> {
    cfg.validate()?;

    let runner_id = random_id();
    let url = websocket_url(&cfg.broker_uri, &runner_id)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(HandshakeError::Connect)?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", cfg.grant_token))
        .map_err(|e| HandshakeError::Connect(tungstenite::Error::HttpFormat(e.into())))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(cfg.max_message_size))
        .max_frame_size(Some(cfg.max_message_size));
    let (ws, _) = tungstenite::client::connect_with_config(request, Some(ws_config), 0)
        .map_err(HandshakeError::Connect)?;
    tracing::info!(url = %url, "connected to task broker");

    run_on_thread(ws, HandshakeSession::new(&runner_id, &cfg.task_type), cfg.max_message_size)
}

/// Run the receive loop on its own thread and wait for its single result.
fn run_on_thread(
    mut ws: WebSocket<MaybeTlsStream<TcpStream>>,
    mut session: HandshakeSession,
    max_message_size: usize,
) -> Result<(), HandshakeError> {
    let (done_tx, done_rx) = mpsc::sync_channel::<Result<(), HandshakeError>>(1);

    let reader = thread::spawn(move || {
        let result = session.run(&mut ws, max_message_size);
        close(&mut ws);
        drop(ws);
        let _ = done_tx.send(result);
    });

    let result = done_rx.recv().unwrap_or(Err(HandshakeError::Aborted));
    let _ = reader.join();

    if result.is_ok() {
        tracing::info!("completed handshake");
    }
    result
}
