//! # dispaint - Shared Canvas Sessions
//!
//! dispaint lets several people draw on one canvas at the same time. A
//! session server keeps the authoritative stroke log, admits clients that
//! know the session passphrase, and relays every stroke and delete to all
//! members in one consistent order. The log can be exported to a file and
//! imported again to pick a drawing back up later.
//!
//! ## Quick Start
//!
//! ```bash
//! # Host a session; the passphrase is printed on startup
//! dispaint server --host 0.0.0.0 --port 8088 --state-file board.json
//!
//! # Follow it from another terminal
//! dispaint watch --passphrase <passphrase>
//!
//! # Save the drawing without stopping the server
//! dispaint export --passphrase <passphrase>
//! ```
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use dispaint::client::ClientSync;
//! use dispaint::server::{ServerConfig, SessionServer};
//! use dispaint::stroke::{Color, Point};
//!
//! # async fn example() -> dispaint::Result<()> {
//! let server = SessionServer::bind("127.0.0.1:0", ServerConfig::new("wisdom")).await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(server.serve());
//!
//! let mut alice = ClientSync::join(&addr.to_string(), "wisdom").await?;
//! alice
//!     .submit_stroke(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)], Color::RED, 3)
//!     .await?;
//! let confirmed = alice.next_event().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[Stroke](stroke)**: the stroke data model and its validation
//! - **[Log](log)**: append-only stroke log with tombstones, plus the export file format
//! - **[Auth](auth)**: passphrase gate for joining connections
//! - **[Hub](hub)**: per-member outbound queues and fan-out
//! - **[Server](server)**: connection handling around one shared session
//! - **[Client](client)**: joining, submitting and replaying on the client side
//!
//! ## Ordering
//!
//! The log and the member set share one lock. Appending a stroke and queueing
//! it for every member happen together, and each member drains its own queue
//! in order, so every client sees strokes in id order, exactly once. Ordering
//! between different members is not coordinated.

pub mod auth;
pub mod client;
pub mod error;
pub mod hub;
pub mod log;
pub mod protocol;
pub mod server;
pub mod stroke;

pub use error::{Error, Result};
