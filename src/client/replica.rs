//! Client-side copy of the session log.
//!
//! The replica starts from the snapshot handed out on join and then applies
//! server events strictly in delivery order. Because the server queues events
//! per member in log order, stroke ids must keep increasing and a delete can
//! only name a stroke the replica already holds; anything else means the
//! connection is out of step and is reported as [`Error::ProtocolError`].
//!
//! Strokes drawn locally are shown right away by the caller and parked here as
//! pending under their correlation token. When the authoritative copy comes
//! back carrying that token the pending entry is retired and the event says
//! "confirmed" rather than "draw this", so nothing is drawn twice.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::ServerMessage;
use crate::stroke::{NewStroke, Stroke, StrokeId};

/// What applying one server message meant for the local canvas.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Someone else drew this; render it.
    RemoteStroke(Stroke),
    /// Our own stroke came back with its id; it is already on screen.
    StrokeConfirmed { token: Uuid, stroke: Stroke },
    /// The stroke is tombstoned; stop rendering it.
    Deleted(StrokeId),
    /// The server refused one of our strokes; take it off the screen.
    StrokeRejected {
        token: Uuid,
        reason: String,
        stroke: Option<NewStroke>,
    },
}

#[derive(Debug, Default)]
pub struct Replica {
    strokes: Vec<Stroke>,
    pending: HashMap<Uuid, NewStroke>,
}

impl Replica {
    pub fn from_snapshot(snapshot: Vec<Stroke>) -> Result<Self> {
        let mut previous = 0;
        for stroke in &snapshot {
            if stroke.id <= previous {
                return Err(Error::ProtocolError(format!(
                    "snapshot stroke {} follows {}",
                    stroke.id, previous
                )));
            }
            previous = stroke.id;
        }
        Ok(Self {
            strokes: snapshot,
            pending: HashMap::new(),
        })
    }

    /// Remembers a submitted stroke until the server answers for it.
    pub fn track_pending(&mut self, token: Uuid, stroke: NewStroke) {
        self.pending.insert(token, stroke);
    }

    /// Applies one live server message.
    pub fn apply(&mut self, message: ServerMessage) -> Result<SyncEvent> {
        match message {
            ServerMessage::Stroke { stroke, token } => self.on_stroke_received(stroke, token),
            ServerMessage::Deleted { id } => self.on_delete_received(id),
            ServerMessage::Invalid { token, reason } => Ok(SyncEvent::StrokeRejected {
                stroke: self.pending.remove(&token),
                token,
                reason,
            }),
            ServerMessage::Error { message } => {
                Err(Error::ProtocolError(format!("server closed the session: {message}")))
            }
            ServerMessage::Accepted { .. }
            | ServerMessage::WrongPassphrase { .. }
            | ServerMessage::Rejected { .. } => Err(Error::ProtocolError(
                "join response received after joining".to_string(),
            )),
        }
    }

    pub fn on_stroke_received(&mut self, stroke: Stroke, token: Option<Uuid>) -> Result<SyncEvent> {
        if stroke.id <= self.last_id() {
            return Err(Error::ProtocolError(format!(
                "stroke {} arrived after stroke {}",
                stroke.id,
                self.last_id()
            )));
        }
        self.strokes.push(stroke.clone());

        match token {
            Some(token) if self.pending.remove(&token).is_some() => {
                Ok(SyncEvent::StrokeConfirmed { token, stroke })
            }
            _ => Ok(SyncEvent::RemoteStroke(stroke)),
        }
    }

    pub fn on_delete_received(&mut self, id: StrokeId) -> Result<SyncEvent> {
        let index = self
            .strokes
            .binary_search_by_key(&id, |s| s.id)
            .map_err(|_| Error::ProtocolError(format!("delete for unknown stroke {id}")))?;
        self.strokes[index].deleted = true;
        Ok(SyncEvent::Deleted(id))
    }

    /// Every stroke, tombstones included, in log order.
    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    /// Strokes a renderer should draw, in log order.
    pub fn visible(&self) -> impl Iterator<Item = &Stroke> {
        self.strokes.iter().filter(|s| !s.deleted)
    }

    pub fn get(&self, id: StrokeId) -> Option<&Stroke> {
        self.strokes
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|index| &self.strokes[index])
    }

    pub fn last_id(&self) -> StrokeId {
        self.strokes.last().map_or(0, |s| s.id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Removes and returns every stroke still waiting for its echo.
    pub fn take_pending(&mut self) -> Vec<(Uuid, NewStroke)> {
        self.pending.drain().collect()
    }
}
