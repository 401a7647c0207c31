//! # Client Sync
//!
//! The client half of a session. [`ClientSync`] joins a server with the
//! passphrase, builds a [`Replica`] from the snapshot it is sent, and then
//! trades events with the server over one WebSocket:
//!
//! ```text
//! ┌─────────────┐  submit(token)   ┌─────────────┐
//! │  Drawing    │─────────────────►│   Session   │
//! │  surface    │                  │   Server    │
//! │      ▲      │◄─────────────────│             │
//! └──────┼──────┘  stroke/deleted  └─────────────┘
//!        │
//!   SyncEvent from ClientSync::next_event
//! ```
//!
//! Rendering is up to the caller: draw locally as the pointer moves, call
//! [`ClientSync::submit`], and let [`SyncEvent`]s tell you what else to draw
//! or erase. Deletes are never applied locally until the server confirms them.
//!
//! ## Example Usage
//!
//! ```bash
//! # Follow a session and log every stroke
//! dispaint watch --host 127.0.0.1 --port 8088 --passphrase wisdom
//!
//! # Ask the server for its connection overview
//! dispaint status --passphrase wisdom
//! ```

mod replica;

pub use replica::{Replica, SyncEvent};

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::{ExportResponse, PASSPHRASE_HEADER, SessionStatus};
use crate::stroke::{Color, NewStroke, Point, StrokeId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Command-line arguments shared by the client subcommands
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "dispaint client - talk to a running session")]
pub struct Args {
    /// Session server host to connect to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Session server port to connect to
    #[arg(long, default_value_t = 8088)]
    pub port: u16,

    /// Session passphrase
    #[arg(long)]
    pub passphrase: String,
}

impl Args {
    fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// A joined, synced connection to a session.
pub struct ClientSync {
    member_id: Uuid,
    ws: WsStream,
    replica: Replica,
    /// Set once the connection has been dropped over a protocol error.
    failed: Option<String>,
    unconfirmed: Vec<(Uuid, NewStroke)>,
}

impl ClientSync {
    /// Connects to `address` (`host:port` or a full `ws://` URL), presents the
    /// passphrase and applies the initial snapshot.
    pub async fn join(address: &str, passphrase: &str) -> Result<Self> {
        let url = ws_url(address);
        info!("Connecting to session at {}", url);
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::ConnectionLost(format!("failed to connect to {url}: {e}")))?;

        send(
            &mut ws,
            &ClientMessage::Join {
                passphrase: passphrase.to_string(),
            },
        )
        .await?;

        let response = next_server_message(&mut ws).await?.ok_or_else(|| {
            Error::AuthenticationFailed("server closed the connection during join".to_string())
        })?;

        match response {
            ServerMessage::Accepted {
                member_id,
                snapshot,
            } => {
                let replica = Replica::from_snapshot(snapshot)?;
                info!(
                    "Joined as {} with {} strokes",
                    member_id,
                    replica.strokes().len()
                );
                Ok(Self {
                    member_id,
                    ws,
                    replica,
                    failed: None,
                    unconfirmed: Vec::new(),
                })
            }
            ServerMessage::WrongPassphrase { .. } => {
                let _ = ws.close(None).await;
                Err(Error::AuthenticationFailed("wrong passphrase".to_string()))
            }
            ServerMessage::Rejected { reason } => Err(Error::AuthenticationFailed(reason)),
            other => Err(Error::ProtocolError(format!(
                "unexpected reply to join: {other:?}"
            ))),
        }
    }

    /// Sends a freshly drawn stroke. The returned token comes back on the
    /// server's confirmation, see [`SyncEvent::StrokeConfirmed`].
    pub async fn submit_stroke(&mut self, points: Vec<Point>, color: Color, width: u32) -> Result<Uuid> {
        self.submit(NewStroke::new(points, color, width)).await
    }

    pub async fn submit(&mut self, stroke: NewStroke) -> Result<Uuid> {
        self.ensure_open()?;
        let token = Uuid::new_v4();
        self.replica.track_pending(token, stroke.clone());
        let message = ClientMessage::Submit {
            token,
            stroke: stroke.into(),
        };
        send(&mut self.ws, &message).await?;
        Ok(token)
    }

    /// Asks the server to tombstone `id`. Nothing changes locally until the
    /// matching [`SyncEvent::Deleted`] arrives.
    pub async fn request_delete(&mut self, id: StrokeId) -> Result<()> {
        self.ensure_open()?;
        send(&mut self.ws, &ClientMessage::Delete { id }).await
    }

    /// Asks the server to tombstone every visible stroke.
    pub async fn request_clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        send(&mut self.ws, &ClientMessage::Clear).await
    }

    /// Waits for the next server event and applies it to the replica.
    ///
    /// `Ok(None)` once the server has closed the session. A protocol error
    /// closes the connection, since the replica can no longer be trusted to
    /// match the server; every later call fails with
    /// [`Error::ConnectionLost`]. Either way, strokes still waiting for their
    /// echo move to [`ClientSync::unconfirmed`].
    pub async fn next_event(&mut self) -> Result<Option<SyncEvent>> {
        self.ensure_open()?;
        let applied = match next_server_message(&mut self.ws).await {
            Ok(Some(message)) => self.replica.apply(message).map(Some),
            Ok(None) => {
                self.give_up_pending();
                return Ok(None);
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &applied {
            warn!("Dropping session connection: {}", e);
            self.failed = Some(e.to_string());
            self.give_up_pending();
            let _ = self.ws.close(None).await;
        }
        applied
    }

    /// Strokes the server never answered for before the connection ended,
    /// in no particular order. A renderer should take these off the screen
    /// or resubmit them on a new connection.
    pub fn unconfirmed(&self) -> &[(Uuid, NewStroke)] {
        &self.unconfirmed
    }

    fn give_up_pending(&mut self) {
        self.unconfirmed.extend(self.replica.take_pending());
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.failed {
            Some(reason) => Err(Error::ConnectionLost(format!(
                "connection was closed after: {reason}"
            ))),
            None => Ok(()),
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn member_id(&self) -> Uuid {
        self.member_id
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| Error::ConnectionLost(e.to_string()))
    }
}

fn ws_url(address: &str) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{address}/ws")
    }
}

async fn send(ws: &mut WsStream, message: &ClientMessage) -> Result<()> {
    let json = message.to_json()?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| Error::ConnectionLost(e.to_string()))
}

async fn next_server_message(ws: &mut WsStream) -> Result<Option<ServerMessage>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map(Some)
                    .map_err(|e| Error::ProtocolError(format!("malformed server message: {e}")));
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(Error::ProtocolError(
                    "unexpected binary frame from server".to_string(),
                ));
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::ConnectionLost(e.to_string())),
        }
    }
}

/// Checks the server answers before we try the WebSocket.
async fn check_server(client: &Client, args: &Args) -> anyhow::Result<()> {
    let url = format!("{}/health", args.http_base());
    info!("Validating connection to session server at {}", url);
    let response = client.get(&url).send().await.map_err(|e| {
        anyhow::anyhow!(
            "session server is unreachable at {}:{}: {e}",
            args.host,
            args.port
        )
    })?;
    anyhow::ensure!(
        response.status().is_success(),
        "session server returned unexpected status: {}",
        response.status()
    );
    info!("Successfully validated session server connection");
    Ok(())
}

/// Joins a session and logs every event until the server goes away.
///
/// Stands in for a drawing surface: it keeps a replica but renders nothing.
pub async fn run_watch(args: Args) -> anyhow::Result<()> {
    check_server(&Client::new(), &args).await?;

    let address = format!("{}:{}", args.host, args.port);
    let mut sync = ClientSync::join(&address, &args.passphrase).await?;

    println!("=== Joined dispaint session ===");
    println!("Member ID: {}", sync.member_id());
    println!(
        "Strokes:   {} ({} visible)",
        sync.replica().strokes().len(),
        sync.replica().visible().count()
    );
    println!("===============================");

    while let Some(event) = sync.next_event().await? {
        match event {
            SyncEvent::RemoteStroke(stroke) => {
                info!(
                    "Stroke {} by {}: {} points, width {}{}",
                    stroke.id,
                    stroke.author,
                    stroke.points.len(),
                    stroke.width,
                    if stroke.erase { " (eraser)" } else { "" }
                );
                println!("stroke {}", stroke.id);
            }
            SyncEvent::Deleted(id) => {
                info!("Stroke {} deleted", id);
                println!("deleted {id}");
            }
            SyncEvent::StrokeConfirmed { stroke, .. } => {
                info!("Own stroke confirmed as {}", stroke.id);
            }
            SyncEvent::StrokeRejected { reason, .. } => {
                warn!("Own stroke rejected: {}", reason);
            }
        }
    }

    println!("Session closed by server.");
    Ok(())
}

/// Prints the server's status overview as JSON.
pub async fn run_status(args: Args) -> anyhow::Result<()> {
    let client = Client::new();
    let response = client
        .get(format!("{}/api/status", args.http_base()))
        .header(PASSPHRASE_HEADER, &args.passphrase)
        .send()
        .await?;
    anyhow::ensure!(
        response.status().is_success(),
        "status request failed: {}",
        response.status()
    );
    let status: SessionStatus = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Asks the server to write its log to the configured state file.
pub async fn run_export(args: Args) -> anyhow::Result<()> {
    let client = Client::new();
    let response = client
        .post(format!("{}/api/export", args.http_base()))
        .header(PASSPHRASE_HEADER, &args.passphrase)
        .send()
        .await?;
    anyhow::ensure!(
        response.status() != reqwest::StatusCode::CONFLICT,
        "server has no state file configured; restart it with --state-file"
    );
    anyhow::ensure!(
        response.status().is_success(),
        "export request failed: {}",
        response.status()
    );
    let export: ExportResponse = response.json().await?;
    println!(
        "Exported {} strokes to {}",
        export.strokes,
        export.path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::Stroke;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    #[test]
    fn bare_address_gets_the_ws_path() {
        assert_eq!(ws_url("127.0.0.1:8088"), "ws://127.0.0.1:8088/ws");
        assert_eq!(ws_url("ws://example.com/ws"), "ws://example.com/ws");
    }

    fn stroke(id: StrokeId) -> ServerMessage {
        ServerMessage::Stroke {
            stroke: Stroke {
                id,
                points: vec![Point::new(0.0, 0.0)],
                color: Color::BLACK,
                width: 1,
                erase: false,
                deleted: false,
                author: Uuid::nil(),
            },
            token: None,
        }
    }

    /// A one-connection server that accepts the join, plays `script`, then
    /// reads `reads` more frames and hangs up. `None` keeps it open until
    /// the client leaves.
    async fn scripted_server(script: Vec<ServerMessage>, reads: Option<usize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _join = ws.next().await;
            let accepted = ServerMessage::Accepted {
                member_id: Uuid::new_v4(),
                snapshot: Vec::new(),
            };
            for message in std::iter::once(accepted).chain(script) {
                ws.send(Message::Text(message.to_json().unwrap().into()))
                    .await
                    .unwrap();
            }
            match reads {
                Some(n) => {
                    for _ in 0..n {
                        let _ = ws.next().await;
                    }
                    let _ = ws.close(None).await;
                }
                None => while let Some(Ok(_)) = ws.next().await {},
            }
        });
        addr
    }

    #[tokio::test]
    async fn out_of_order_stroke_closes_the_connection() {
        let addr = scripted_server(vec![stroke(2), stroke(1), stroke(3)], None).await;
        let mut sync = ClientSync::join(&addr.to_string(), "wisdom").await.unwrap();

        assert!(matches!(
            sync.next_event().await,
            Ok(Some(SyncEvent::RemoteStroke(s))) if s.id == 2
        ));
        assert!(matches!(sync.next_event().await, Err(Error::ProtocolError(_))));
        // Stroke 3 is never applied on top of a replica that skipped one.
        assert!(matches!(sync.next_event().await, Err(Error::ConnectionLost(_))));
        assert!(matches!(
            sync.request_delete(2).await,
            Err(Error::ConnectionLost(_))
        ));
        assert_eq!(sync.replica().last_id(), 2);
    }

    #[tokio::test]
    async fn unanswered_strokes_are_handed_back_when_the_server_leaves() {
        let addr = scripted_server(Vec::new(), Some(1)).await;
        let mut sync = ClientSync::join(&addr.to_string(), "wisdom").await.unwrap();

        let token = sync
            .submit_stroke(vec![Point::new(1.0, 2.0)], Color::GREEN, 4)
            .await
            .unwrap();
        assert!(matches!(sync.next_event().await, Ok(None)));
        assert_eq!(sync.replica().pending_count(), 0);
        assert_eq!(sync.unconfirmed().len(), 1);
        assert_eq!(sync.unconfirmed()[0].0, token);
        assert_eq!(sync.unconfirmed()[0].1.color, Color::GREEN);
    }
}
