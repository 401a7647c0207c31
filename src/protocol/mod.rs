//! Wire messages.
//!
//! Every WebSocket frame is one JSON text message tagged by `"type"`:
//!
//! ```json
//! { "type": "join", "passphrase": "tinge-latte-rotunda" }
//! { "type": "submit", "token": "<uuid>", "points": [{"x": 0, "y": 0}], "color": {"r": 255, "g": 0, "b": 0}, "width": 3 }
//! { "type": "delete", "id": 1 }
//! { "type": "stroke", "stroke": { "id": 1, ... }, "token": "<uuid>" }
//! { "type": "deleted", "id": 1 }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stroke::{Stroke, StrokeDraft, StrokeId};

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection.
    Join { passphrase: String },
    /// A freshly drawn stroke. `token` lets the sender recognise its echo.
    /// The stroke is range checked after decoding, so bad values get an
    /// `invalid` reply instead of closing the connection.
    Submit {
        token: Uuid,
        #[serde(flatten)]
        stroke: StrokeDraft,
    },
    /// Tombstone one stroke.
    Delete { id: StrokeId },
    /// Tombstone every visible stroke.
    Clear,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join succeeded; `snapshot` is the whole log at the moment of joining.
    Accepted {
        member_id: Uuid,
        snapshot: Vec<Stroke>,
    },
    /// Wrong passphrase, but the connection may try again.
    WrongPassphrase { attempts_left: u32 },
    /// Join refused. The server closes the connection right after.
    Rejected { reason: String },
    /// A stroke was accepted. `token` is only set on the submitter's copy.
    Stroke {
        stroke: Stroke,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<Uuid>,
    },
    /// A submission failed validation and was dropped.
    Invalid { token: Uuid, reason: String },
    /// A stroke was tombstoned.
    Deleted { id: StrokeId },
    /// The server is about to close the connection.
    Error { message: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
