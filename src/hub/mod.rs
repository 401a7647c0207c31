//! # Broadcast Hub
//!
//! Keeps the outbound queue of every session member and fans accepted events
//! out to them. Each member has exactly one unbounded queue, drained in order
//! by that member's socket writer, so whatever order events are pushed here is
//! the order the member sees them in.
//!
//! The hub never blocks and never touches a socket. Pushing into a queue whose
//! connection has already gone away just fails quietly; the connection's own
//! cleanup will call [`BroadcastHub::unregister`] shortly.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::stroke::{Stroke, StrokeId};

pub type MemberId = Uuid;

/// Sending half of a member's outbound queue.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Default)]
pub struct BroadcastHub {
    members: HashMap<MemberId, Outbox>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member. From here on it receives every broadcast.
    pub fn register(&mut self, member: MemberId, outbox: Outbox) {
        self.members.insert(member, outbox);
        debug!("Registered member {} ({} total)", member, self.members.len());
    }

    /// Removes a member. Safe to call more than once.
    pub fn unregister(&mut self, member: MemberId) -> bool {
        let removed = self.members.remove(&member).is_some();
        if removed {
            debug!("Unregistered member {} ({} left)", member, self.members.len());
        }
        removed
    }

    /// Queues `stroke` for every member except `excluding`. Returns how many
    /// queues took it.
    pub fn broadcast_stroke(&self, stroke: &Stroke, excluding: Option<MemberId>) -> usize {
        self.members
            .iter()
            .filter(|(id, _)| Some(**id) != excluding)
            .filter(|(_, outbox)| {
                outbox
                    .send(ServerMessage::Stroke {
                        stroke: stroke.clone(),
                        token: None,
                    })
                    .is_ok()
            })
            .count()
    }

    /// Queues a delete notice for every member, the requester included.
    pub fn broadcast_delete(&self, id: StrokeId) -> usize {
        self.members
            .values()
            .filter(|outbox| outbox.send(ServerMessage::Deleted { id }).is_ok())
            .count()
    }

    /// Queues a message for one member. `false` if it is gone.
    pub fn send_to(&self, member: MemberId, message: ServerMessage) -> bool {
        self.members
            .get(&member)
            .is_some_and(|outbox| outbox.send(message).is_ok())
    }

    /// Sends every member a final `error` notice and drops all queues, so
    /// each writer drains what it has and stops.
    pub fn close_all(&mut self, message: &str) -> usize {
        let notified = self
            .members
            .values()
            .filter(|outbox| {
                outbox
                    .send(ServerMessage::Error {
                        message: message.to_string(),
                    })
                    .is_ok()
            })
            .count();
        self.members.clear();
        notified
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.members.contains_key(&member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
