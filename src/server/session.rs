//! Shared state of one running session.
//!
//! The stroke log and the broadcast hub sit behind a single mutex. Every
//! operation that touches either takes the lock once, does its in-memory work
//! (append, tombstone, queue pushes) and lets go; no socket I/O ever happens
//! while it is held. That gives the ordering guarantees members rely on:
//!
//! - ids are assigned one at a time, so they are unique and gap-free;
//! - appending a stroke and queueing it for every member is one step, so no
//!   member sees a later stroke before an earlier one or misses one appended
//!   while it was registered;
//! - a joining member is registered and handed its snapshot in the same step,
//!   so the stroke at the boundary is delivered exactly once;
//! - [`Session::close`] flips the session to closed under the same lock, so
//!   nothing is appended after the final snapshot is taken.

use std::path::Path;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::error::{Error, Result};
use crate::hub::{BroadcastHub, MemberId, Outbox};
use crate::log::{SessionLog, snapshot};
use crate::protocol::ServerMessage;
use crate::stroke::{NewStroke, Stroke, StrokeId};

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Joined,
    Closed,
}

/// One live connection, as reported by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Doubles as the member id once joined.
    pub connection_id: Uuid,
    pub peer: String,
    pub state: ConnectionState,
    /// Human-readable connection timestamp
    pub connected_at: String,
    /// Highest stroke id written to this connection's socket.
    #[serde(default)]
    pub delivered_through: StrokeId,
    /// Strokes in the log this member has not been sent yet.
    #[serde(default)]
    pub lag: u64,
}

struct Shared {
    log: SessionLog,
    hub: BroadcastHub,
    closed: bool,
}

pub struct Session {
    gate: AuthGate,
    auth_timeout: Duration,
    shared: Mutex<Shared>,
    /// Every open connection, authenticated or not. Kept apart from the hub
    /// so status reads never contend with strokes.
    connections: DashMap<Uuid, ConnectionInfo>,
    closing: watch::Sender<bool>,
}

impl Session {
    pub fn new(gate: AuthGate, log: SessionLog, auth_timeout: Duration) -> Self {
        Self {
            gate,
            auth_timeout,
            shared: Mutex::new(Shared {
                log,
                hub: BroadcastHub::new(),
                closed: false,
            }),
            connections: DashMap::new(),
            closing: watch::Sender::new(false),
        }
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn auth_timeout(&self) -> Duration {
        self.auth_timeout
    }

    /// Registers `member` and queues its `Accepted` message, snapshot
    /// included, ahead of any live event. Returns the snapshot length.
    pub async fn join(&self, member: MemberId, outbox: Outbox) -> Result<usize> {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(Error::SessionClosed);
        }
        let snapshot = shared.log.snapshot();
        let len = snapshot.len();
        // Queued before registering, so nothing can overtake it.
        let _ = outbox.send(ServerMessage::Accepted {
            member_id: member,
            snapshot,
        });
        shared.hub.register(member, outbox);
        Ok(len)
    }

    pub async fn leave(&self, member: MemberId) -> bool {
        self.shared.lock().await.hub.unregister(member)
    }

    /// Validates, appends and fans out a stroke. Everyone but the submitter
    /// gets a plain copy; the submitter gets one carrying its `token`.
    pub async fn submit(&self, member: MemberId, token: Uuid, stroke: NewStroke) -> Result<Stroke> {
        stroke.validate()?;
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(Error::SessionClosed);
        }
        let stored = shared.log.append(stroke, member)?;
        shared.hub.broadcast_stroke(&stored, Some(member));
        shared.hub.send_to(
            member,
            ServerMessage::Stroke {
                stroke: stored.clone(),
                token: Some(token),
            },
        );
        Ok(stored)
    }

    /// Tombstones `id` and tells every member, but only if something changed.
    pub async fn delete(&self, id: StrokeId) -> Result<bool> {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(Error::SessionClosed);
        }
        let changed = shared.log.mark_deleted(id);
        if changed {
            shared.hub.broadcast_delete(id);
        }
        Ok(changed)
    }

    /// Tombstones every visible stroke, oldest first.
    pub async fn clear(&self) -> Result<Vec<StrokeId>> {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Err(Error::SessionClosed);
        }
        let ids = shared.log.live_ids();
        for &id in &ids {
            shared.log.mark_deleted(id);
            shared.hub.broadcast_delete(id);
        }
        Ok(ids)
    }

    /// Stops taking changes and tells every member the session is over.
    /// Returns how many members were told. Calling it again does nothing.
    pub async fn close(&self) -> usize {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return 0;
        }
        shared.closed = true;
        let notified = shared.hub.close_all("server is shutting down");
        self.closing.send_replace(true);
        info!("Session closed with {} strokes", shared.log.len());
        notified
    }

    /// Resolves once [`Session::close`] has run.
    pub async fn closed(&self) {
        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|closed| *closed).await;
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.lock().await.closed
    }

    pub async fn snapshot(&self) -> Vec<Stroke> {
        self.shared.lock().await.log.snapshot()
    }

    /// Writes the current log to `path`. The lock is only held for the copy.
    pub async fn export_to(&self, path: &Path) -> Result<usize> {
        let strokes = self.snapshot().await;
        snapshot::export_to(path, &strokes).await?;
        Ok(strokes.len())
    }

    pub async fn member_count(&self) -> usize {
        self.shared.lock().await.hub.len()
    }

    pub async fn status(&self) -> SessionStatus {
        let (strokes, live_strokes, last_id, members) = {
            let shared = self.shared.lock().await;
            (
                shared.log.len(),
                shared.log.live_ids().len(),
                shared.log.last_id(),
                shared.hub.len(),
            )
        };
        let mut connections: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| {
                let mut info = entry.value().clone();
                if info.state == ConnectionState::Joined {
                    info.lag = last_id.saturating_sub(info.delivered_through);
                }
                info
            })
            .collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        SessionStatus {
            strokes,
            live_strokes,
            last_id,
            members,
            connections,
        }
    }

    pub(crate) fn track(&self, connection_id: Uuid, peer: String) {
        let connected_at = chrono::Utc::now()
            .format("%Y-%m-%d %H:%M:%S%.3f UTC")
            .to_string();
        self.connections.insert(
            connection_id,
            ConnectionInfo {
                connection_id,
                peer,
                state: ConnectionState::Connecting,
                connected_at,
                delivered_through: 0,
                lag: 0,
            },
        );
    }

    /// Records that strokes up to `id` reached the connection's socket.
    pub(crate) fn delivered(&self, connection_id: Uuid, id: StrokeId) {
        if let Some(mut info) = self.connections.get_mut(&connection_id) {
            info.delivered_through = info.delivered_through.max(id);
        }
    }

    pub(crate) fn transition(&self, connection_id: Uuid, state: ConnectionState) {
        if state == ConnectionState::Closed {
            self.connections.remove(&connection_id);
        } else if let Some(mut info) = self.connections.get_mut(&connection_id) {
            info.state = state;
        }
        info!("Connection {} is now {:?}", connection_id, state);
    }
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub strokes: usize,
    pub live_strokes: usize,
    pub last_id: StrokeId,
    pub members: usize,
    pub connections: Vec<ConnectionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::{Color, Point};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn session() -> Session {
        let gate = AuthGate::new("wisdom", 4, 1).unwrap();
        Session::new(gate, SessionLog::new(), Duration::from_secs(5))
    }

    fn red_line() -> NewStroke {
        NewStroke::new(
            vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
            Color::RED,
            3,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn snapshot_is_the_first_thing_a_member_sees() {
        let session = session();
        let a = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        session.join(a, tx_a).await.unwrap();
        session.submit(a, Uuid::new_v4(), red_line()).await.unwrap();

        let b = Uuid::new_v4();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        assert_eq!(session.join(b, tx_b).await.unwrap(), 1);
        session.submit(a, Uuid::new_v4(), red_line()).await.unwrap();

        let seen = drain(&mut rx_b);
        assert_eq!(seen.len(), 2);
        match &seen[0] {
            ServerMessage::Accepted { member_id, snapshot } => {
                assert_eq!(*member_id, b);
                assert_eq!(snapshot.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);
            }
            other => panic!("expected accepted, got {other:?}"),
        }
        assert!(matches!(&seen[1], ServerMessage::Stroke { stroke, token: None } if stroke.id == 2));
        assert_eq!(drain(&mut rx_a).len(), 3);
    }

    #[tokio::test]
    async fn submitter_gets_its_token_back() {
        let session = session();
        let a = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.join(a, tx).await.unwrap();
        let token = Uuid::new_v4();
        let stored = session.submit(a, token, red_line()).await.unwrap();
        assert_eq!(stored.author, a);

        let seen = drain(&mut rx);
        assert_eq!(
            seen[1],
            ServerMessage::Stroke {
                stroke: stored,
                token: Some(token)
            }
        );
    }

    #[tokio::test]
    async fn invalid_stroke_leaves_the_log_alone() {
        let session = session();
        let a = Uuid::new_v4();
        let err = session
            .submit(a, Uuid::new_v4(), NewStroke::new(vec![], Color::RED, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStroke(_)));
        assert!(session.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_delete_broadcasts_once() {
        let session = session();
        let a = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.join(a, tx).await.unwrap();
        session.submit(a, Uuid::new_v4(), red_line()).await.unwrap();
        drain(&mut rx);

        assert!(session.delete(1).await.unwrap());
        assert!(!session.delete(1).await.unwrap());
        assert!(!session.delete(99).await.unwrap());
        assert_eq!(drain(&mut rx), vec![ServerMessage::Deleted { id: 1 }]);
    }

    #[tokio::test]
    async fn clear_tombstones_only_visible_strokes() {
        let session = session();
        let a = Uuid::new_v4();
        for _ in 0..3 {
            session.submit(a, Uuid::new_v4(), red_line()).await.unwrap();
        }
        session.delete(2).await.unwrap();
        assert_eq!(session.clear().await.unwrap(), vec![1, 3]);
        assert!(session.snapshot().await.iter().all(|s| s.deleted));
        assert!(session.clear().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_submissions_get_gap_free_ids() {
        let session = Arc::new(session());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                let member = Uuid::new_v4();
                for _ in 0..25 {
                    session.submit(member, Uuid::new_v4(), red_line()).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let ids: Vec<_> = session.snapshot().await.iter().map(|s| s.id).collect();
        assert_eq!(ids, (1..=200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn leave_stops_delivery() {
        let session = session();
        let a = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.join(a, tx).await.unwrap();
        assert!(session.leave(a).await);
        assert!(!session.leave(a).await);
        session.submit(Uuid::new_v4(), Uuid::new_v4(), red_line()).await.unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(session.member_count().await, 0);
    }

    #[tokio::test]
    async fn registry_follows_connection_state() {
        let session = session();
        let id = Uuid::new_v4();
        session.track(id, "127.0.0.1:5000".to_string());
        session.transition(id, ConnectionState::Authenticating);
        let status = session.status().await;
        assert_eq!(status.connections.len(), 1);
        assert_eq!(status.connections[0].state, ConnectionState::Authenticating);

        session.transition(id, ConnectionState::Closed);
        assert!(session.status().await.connections.is_empty());
    }

    #[tokio::test]
    async fn status_reports_how_far_behind_a_member_is() {
        let session = session();
        let a = Uuid::new_v4();
        session.track(a, "127.0.0.1:5001".to_string());
        session.transition(a, ConnectionState::Joined);
        for _ in 0..3 {
            session.submit(Uuid::new_v4(), Uuid::new_v4(), red_line()).await.unwrap();
        }
        session.delivered(a, 1);

        let status = session.status().await;
        assert_eq!(status.connections[0].delivered_through, 1);
        assert_eq!(status.connections[0].lag, 2);

        session.delivered(a, 3);
        session.delivered(a, 2);
        assert_eq!(session.status().await.connections[0].lag, 0);
    }

    #[tokio::test]
    async fn closed_session_takes_no_more_changes() {
        let session = session();
        let a = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.join(a, tx).await.unwrap();
        session.submit(a, Uuid::new_v4(), red_line()).await.unwrap();
        drain(&mut rx);

        assert_eq!(session.close().await, 1);
        session.closed().await;
        assert!(session.is_closed().await);
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "server is shutting down".to_string()
            }]
        );

        let refused = session.submit(a, Uuid::new_v4(), red_line()).await;
        assert!(matches!(refused, Err(Error::SessionClosed)));
        assert!(matches!(session.delete(1).await, Err(Error::SessionClosed)));
        assert!(matches!(session.clear().await, Err(Error::SessionClosed)));
        let (late, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            session.join(Uuid::new_v4(), late).await,
            Err(Error::SessionClosed)
        ));
        assert_eq!(session.snapshot().await.len(), 1);
        assert_eq!(session.member_count().await, 0);
        assert_eq!(session.close().await, 0);
    }
}
