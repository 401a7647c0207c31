//! # Session Server
//!
//! Hosts one drawing session. Clients connect over WebSocket, prove they know
//! the passphrase, receive the full stroke log, and from then on trade
//! strokes and deletes with everyone else in the session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  submit/delete  ┌──────────────────────────┐  stroke/deleted  ┌─────────────┐
//! │  Client A   │────────────────►│  Session                 │─────────────────►│  Client B   │
//! │  (ws task)  │◄────────────────│  - AuthGate              │                  │  (ws task)  │
//! └─────────────┘  stroke+token   │  - SessionLog ┐ one lock │                  └─────────────┘
//!                                 │  - Hub        ┘          │
//!                                 └──────────────────────────┘
//! ```
//!
//! Every connection runs in its own task and walks
//! `Connecting → Authenticating → Joined → Closed`. Once joined it gets an
//! outbound queue in the hub, drained by a dedicated writer task; the reader
//! side feeds submissions and deletes into the [`Session`].
//!
//! ## Endpoints
//!
//! - `WS /ws` - drawing protocol, see [`crate::protocol`]
//! - `GET /health` - liveness check
//! - `GET /api/status` - log and connection overview (passphrase header)
//! - `POST /api/export` - write the log to the state file (passphrase header)
//!
//! ## Example Usage
//!
//! ```bash
//! # Fresh session with a generated passphrase
//! dispaint server --host 0.0.0.0 --port 8088
//!
//! # Resume a saved drawing and keep saving to the same file
//! dispaint server --passphrase wisdom --import board.json
//! ```

mod session;

pub use session::{ConnectionInfo, ConnectionState, Session, SessionStatus};

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthGate, AuthState};
use crate::error::{Error, Result};
use crate::hub::MemberId;
use crate::log::{SessionLog, snapshot};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::stroke::NewStroke;

/// Header carrying the passphrase on the HTTP API.
pub const PASSPHRASE_HEADER: &str = "x-dispaint-passphrase";

/// How long a closing connection gets to flush its queue.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments for the session server
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "dispaint server - host a shared drawing session"
)]
pub struct Args {
    /// Host to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the server
    #[arg(long, default_value_t = 8088)]
    pub port: u16,

    /// Session passphrase
    ///
    /// Clients must present this exact string to join. A random one is
    /// generated and printed when omitted.
    #[arg(long)]
    pub passphrase: Option<String>,

    /// File the session is exported to
    ///
    /// Written on `dispaint export` and when the server shuts down.
    /// Defaults to the `--import` file when that is given.
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Saved session to resume before accepting connections
    #[arg(long)]
    pub import: Option<PathBuf>,

    /// Seconds a new connection has to present the passphrase
    #[arg(long, default_value_t = 10)]
    pub auth_timeout_secs: u64,

    /// Wrong passphrases allowed per connection before it is closed
    #[arg(long, default_value_t = 1)]
    pub max_auth_attempts: u32,
}

/// Plain configuration for embedding a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub passphrase: String,
    pub import: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub auth_timeout: Duration,
    pub max_auth_attempts: u32,
    pub bcrypt_cost: u32,
}

impl ServerConfig {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            import: None,
            state_file: None,
            auth_timeout: Duration::from_secs(10),
            max_auth_attempts: 1,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl From<&Args> for ServerConfig {
    fn from(args: &Args) -> Self {
        let passphrase = args.passphrase.clone().unwrap_or_else(generate_passphrase);
        Self {
            passphrase,
            import: args.import.clone(),
            state_file: args.state_file.clone().or_else(|| args.import.clone()),
            auth_timeout: Duration::from_secs(args.auth_timeout_secs),
            max_auth_attempts: args.max_auth_attempts,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

/// Three short random groups, e.g. `3f9a-c041-77be`.
pub fn generate_passphrase() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", &hex[0..4], &hex[4..8], &hex[8..12])
}

#[derive(Clone)]
struct AppState {
    session: Arc<Session>,
    state_file: Option<PathBuf>,
}

/// A bound, not yet serving, session server.
pub struct SessionServer {
    listener: TcpListener,
    state: AppState,
}

impl SessionServer {
    /// Imports the saved log (if configured), hashes the passphrase and binds.
    /// A corrupt import fails here, before any connection is accepted.
    pub async fn bind(addr: &str, config: ServerConfig) -> Result<Self> {
        let log = match &config.import {
            Some(path) => snapshot::import_from(path).await?,
            None => SessionLog::new(),
        };
        let gate = AuthGate::new(&config.passphrase, config.bcrypt_cost, config.max_auth_attempts)?;
        let session = Arc::new(Session::new(gate, log, config.auth_timeout));
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: AppState {
                session,
                state_file: config.state_file,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.state.session)
    }

    /// Runs the accept loop until `shutdown` resolves, then closes the
    /// session. Once this returns the log no longer changes, so a snapshot
    /// taken afterwards is final.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let session = Arc::clone(&self.state.session);
        let app = router(self.state);
        tokio::select! {
            result = axum::serve(
                self.listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            ) => result?,
            _ = shutdown => info!("Shutdown requested"),
        }
        let notified = session.close().await;
        info!("Told {} members the session is closing", notified);
        Ok(())
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/export", post(export_session))
        .with_state(state)
}

/// Starts a session server and runs it until Ctrl-C, exporting the log on the
/// way out when a state file is configured.
///
/// # Example
///
/// ```rust,no_run
/// use dispaint::server::{Args, run_server};
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = Args {
///     host: "0.0.0.0".to_string(),
///     port: 8088,
///     passphrase: Some("wisdom".to_string()),
///     state_file: Some("board.json".into()),
///     import: None,
///     auth_timeout_secs: 10,
///     max_auth_attempts: 1,
/// };
///
/// run_server(args).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_server(args: Args) -> anyhow::Result<()> {
    let config = ServerConfig::from(&args);
    let passphrase = config.passphrase.clone();
    let state_file = config.state_file.clone();
    let addr = format!("{}:{}", args.host, args.port);

    let server = SessionServer::bind(&addr, config)
        .await
        .with_context(|| format!("failed to start session server on {addr}"))?;
    let session = server.session();

    info!("Session server starting");
    info!("Listening on {}", server.local_addr()?);
    warn!("Session passphrase: {}", passphrase);

    println!("=== dispaint session ===");
    println!("Address:    ws://{addr}/ws");
    println!("Passphrase: {passphrase}");
    println!("========================");

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    // The session is closed by now, so this snapshot is the last word.
    if let Some(path) = state_file {
        let count = session
            .export_to(&path)
            .await
            .with_context(|| format!("failed to export session to {}", path.display()))?;
        println!("Saved {count} strokes to {}", path.display());
    }

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), StatusCode> {
    let supplied = headers
        .get(PASSPHRASE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if state.session.gate().verify(supplied).await {
        Ok(())
    } else {
        warn!("Wrong passphrase on HTTP API");
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn get_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<SessionStatus>, StatusCode> {
    authorize(&state, &headers).await?;
    Ok(Json(state.session.status().await))
}

/// Body of `POST /api/export`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportResponse {
    pub strokes: usize,
    pub path: PathBuf,
}

async fn export_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<ExportResponse>, StatusCode> {
    authorize(&state, &headers).await?;
    let path = state.state_file.clone().ok_or_else(|| {
        warn!("Export requested but no state file is configured");
        StatusCode::CONFLICT
    })?;
    let strokes = state.session.export_to(&path).await.map_err(|e| {
        error!("Failed to export session to {}: {}", path.display(), e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(ExportResponse { strokes, path }))
}

async fn handle_ws(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.session, peer))
}

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

async fn handle_socket(socket: WebSocket, session: Arc<Session>, peer: SocketAddr) {
    let connection_id = Uuid::new_v4();
    session.track(connection_id, peer.to_string());
    info!("Connection {} opened from {}", connection_id, peer);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    session.transition(connection_id, ConnectionState::Authenticating);
    let handshake = tokio::time::timeout(
        session.auth_timeout(),
        authenticate(&session, &mut ws_sender, &mut ws_receiver),
    )
    .await;

    match handshake {
        Ok(Ok(())) => {
            session.transition(connection_id, ConnectionState::Joined);
            run_member(&session, connection_id, ws_sender, ws_receiver).await;
        }
        Ok(Err(e)) => {
            warn!("Connection {} failed to join: {}", connection_id, e);
            close(&mut ws_sender, close_code::POLICY, &e.to_string()).await;
        }
        Err(_) => {
            warn!("Connection {} did not authenticate in time", connection_id);
            let rejected = ServerMessage::Rejected {
                reason: "authentication timed out".to_string(),
            };
            let _ = send(&mut ws_sender, &rejected).await;
            close(&mut ws_sender, close_code::POLICY, "authentication timed out").await;
        }
    }

    session.transition(connection_id, ConnectionState::Closed);
    info!("Connection {} closed", connection_id);
}

/// Runs the passphrase handshake. `Ok` means the connection may join.
async fn authenticate(
    session: &Session,
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
) -> Result<()> {
    let mut attempt = session.gate().attempt();
    loop {
        let passphrase = match next_message(ws_receiver).await? {
            ClientMessage::Join { passphrase } => passphrase,
            other => {
                return Err(Error::ProtocolError(format!(
                    "expected join, got {}",
                    message_kind(&other)
                )));
            }
        };

        match attempt.authenticate(&passphrase).await {
            AuthState::Accepted => return Ok(()),
            AuthState::AwaitingPassphrase => {
                let retry = ServerMessage::WrongPassphrase {
                    attempts_left: attempt.attempts_left(),
                };
                send(ws_sender, &retry).await?;
            }
            AuthState::Rejected => {
                let rejected = ServerMessage::Rejected {
                    reason: "wrong passphrase".to_string(),
                };
                send(ws_sender, &rejected).await?;
                return Err(Error::AuthenticationFailed("wrong passphrase".to_string()));
            }
        }
    }
}

/// Serves an authenticated member until it leaves, misbehaves or the
/// session closes.
async fn run_member(
    session: &Arc<Session>,
    member: MemberId,
    mut ws_sender: WsSender,
    mut ws_receiver: WsReceiver,
) {
    let (outbox, queue) = mpsc::unbounded_channel();
    let snapshot_len = match session.join(member, outbox.clone()).await {
        Ok(len) => len,
        Err(e) => {
            warn!("Member {} could not join: {}", member, e);
            close(&mut ws_sender, close_code::AWAY, &e.to_string()).await;
            return;
        }
    };
    info!(
        "Member {} joined with a snapshot of {} strokes",
        member, snapshot_len
    );

    let mut writer = tokio::spawn(write_queue(Arc::clone(session), member, ws_sender, queue));
    let mut writer_done = false;

    let outcome = tokio::select! {
        outcome = read_member(session, member, &mut ws_receiver, &outbox) => outcome,
        _ = session.closed() => Err(Error::SessionClosed),
        _ = &mut writer => {
            writer_done = true;
            Err(Error::ConnectionLost("outbound stream closed".to_string()))
        }
    };

    session.leave(member).await;

    let (code, reason) = match &outcome {
        Ok(()) => {
            info!("Member {} left", member);
            (close_code::NORMAL, "session closed".to_string())
        }
        Err(Error::ProtocolError(reason)) => {
            warn!("Closing member {} after protocol error: {}", member, reason);
            let _ = outbox.send(ServerMessage::Error {
                message: reason.clone(),
            });
            (close_code::PROTOCOL, reason.clone())
        }
        Err(Error::SessionClosed) => {
            info!("Closing member {} for shutdown", member);
            (close_code::AWAY, "server is shutting down".to_string())
        }
        Err(e) => {
            warn!("Member {} dropped: {}", member, e);
            (close_code::ERROR, e.to_string())
        }
    };

    // The hub's copy is gone; dropping ours lets the writer drain and stop.
    drop(outbox);
    if writer_done {
        return;
    }
    match tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await {
        Ok(Ok(Some(mut ws_sender))) => close(&mut ws_sender, code, &reason).await,
        Ok(_) => {}
        Err(_) => {
            warn!("Member {} did not drain its queue in time", member);
            writer.abort();
        }
    }
}

async fn read_member(
    session: &Session,
    member: MemberId,
    ws_receiver: &mut WsReceiver,
    outbox: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<()> {
    loop {
        let message = match next_message(ws_receiver).await {
            Ok(message) => message,
            Err(Error::ConnectionLost(reason)) if reason == CLOSED_BY_PEER => return Ok(()),
            Err(e) => return Err(e),
        };

        match message {
            ClientMessage::Submit { token, stroke } => {
                let submitted = match NewStroke::try_from(stroke) {
                    Ok(stroke) => session.submit(member, token, stroke).await,
                    Err(e) => Err(e.into()),
                };
                match submitted {
                    Ok(stored) => info!("Member {} drew stroke {}", member, stored.id),
                    Err(e @ (Error::InvalidStroke(_) | Error::IdsExhausted(_))) => {
                        warn!("Member {} sent a stroke that was refused: {}", member, e);
                        let _ = outbox.send(ServerMessage::Invalid {
                            token,
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            ClientMessage::Delete { id } => {
                if session.delete(id).await? {
                    info!("Member {} deleted stroke {}", member, id);
                }
            }
            ClientMessage::Clear => {
                let cleared = session.clear().await?;
                info!("Member {} cleared {} strokes", member, cleared.len());
            }
            ClientMessage::Join { .. } => {
                return Err(Error::ProtocolError("already joined".to_string()));
            }
        }
    }
}

/// Drains one member's queue into its socket, in order. Hands the socket
/// back once the queue is closed so the caller can pick the close frame;
/// `None` if the socket failed first.
async fn write_queue(
    session: Arc<Session>,
    member: MemberId,
    mut ws_sender: WsSender,
    mut queue: mpsc::UnboundedReceiver<ServerMessage>,
) -> Option<WsSender> {
    while let Some(message) = queue.recv().await {
        if let Err(e) = send(&mut ws_sender, &message).await {
            warn!("Failed to send to member {}: {}", member, e);
            return None;
        }
        let through = match &message {
            ServerMessage::Stroke { stroke, .. } => Some(stroke.id),
            ServerMessage::Accepted { snapshot, .. } => snapshot.last().map(|s| s.id),
            _ => None,
        };
        if let Some(id) = through {
            session.delivered(member, id);
        }
    }
    Some(ws_sender)
}

const CLOSED_BY_PEER: &str = "closed by peer";

/// Reads the next protocol message, skipping pings and pongs.
async fn next_message(ws_receiver: &mut WsReceiver) -> Result<ClientMessage> {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| Error::ProtocolError(format!("malformed message: {e}")));
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(Error::ProtocolError(
                    "binary frames are not part of the protocol".to_string(),
                ));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::ConnectionLost(CLOSED_BY_PEER.to_string()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::ConnectionLost(e.to_string())),
        }
    }
}

async fn send(ws_sender: &mut WsSender, message: &ServerMessage) -> Result<()> {
    let json = message.to_json()?;
    ws_sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| Error::ConnectionLost(e.to_string()))
}

/// Close frames are control frames, so the reason must fit in 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

async fn close(ws_sender: &mut WsSender, code: u16, reason: &str) {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let frame = CloseFrame {
        code,
        reason: reason[..end].to_string().into(),
    };
    let _ = ws_sender.send(Message::Close(Some(frame))).await;
    let _ = ws_sender.close().await;
}

fn message_kind(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::Join { .. } => "join",
        ClientMessage::Submit { .. } => "submit",
        ClientMessage::Delete { .. } => "delete",
        ClientMessage::Clear => "clear",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_passphrases_are_usable() {
        let phrase = generate_passphrase();
        assert_eq!(phrase.len(), 14);
        assert_eq!(phrase.matches('-').count(), 2);
        assert_ne!(phrase, generate_passphrase());
    }

    #[test]
    fn state_file_defaults_to_the_import() {
        let args = Args {
            host: "127.0.0.1".to_string(),
            port: 0,
            passphrase: None,
            state_file: None,
            import: Some("board.json".into()),
            auth_timeout_secs: 3,
            max_auth_attempts: 2,
        };
        let config = ServerConfig::from(&args);
        assert_eq!(config.state_file, Some(PathBuf::from("board.json")));
        assert_eq!(config.auth_timeout, Duration::from_secs(3));
        assert!(!config.passphrase.is_empty());
    }

    #[tokio::test]
    async fn corrupt_import_stops_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, r#"{"version":1,"strokes":[{"id":2,"points":[],"color":{"r":0,"g":0,"b":0},"width":1,"author":"00000000-0000-0000-0000-000000000000"}]}"#)
            .await
            .unwrap();

        let mut config = ServerConfig::new("wisdom");
        config.bcrypt_cost = 4;
        config.import = Some(path);
        let result = SessionServer::bind("127.0.0.1:0", config).await;
        assert!(matches!(result, Err(Error::CorruptState(_))));
    }
}
