//! Export file format.
//!
//! A saved session is a small JSON document:
//!
//! ```json
//! { "version": 1, "strokes": [ { "id": 1, "points": [...], ... } ] }
//! ```
//!
//! Strokes are written in log order with tombstones kept, which is everything
//! [`SessionLog::load_snapshot`](super::SessionLog::load_snapshot) needs to
//! rebuild the log exactly.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::SessionLog;
use crate::error::{Error, Result};
use crate::stroke::Stroke;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SavedSession {
    version: u32,
    strokes: Vec<Stroke>,
}

pub fn to_json(strokes: &[Stroke]) -> Result<String> {
    #[derive(Serialize)]
    struct SavedSessionRef<'a> {
        version: u32,
        strokes: &'a [Stroke],
    }

    Ok(serde_json::to_string_pretty(&SavedSessionRef {
        version: FORMAT_VERSION,
        strokes,
    })?)
}

/// Parses and validates a saved session. Any problem with the content is
/// reported as [`Error::CorruptState`].
pub fn from_json(json: &str) -> Result<SessionLog> {
    let saved: SavedSession = serde_json::from_str(json)
        .map_err(|e| Error::CorruptState(format!("unreadable session file: {e}")))?;
    if saved.version != FORMAT_VERSION {
        return Err(Error::CorruptState(format!(
            "unsupported session file version {} (expected {})",
            saved.version, FORMAT_VERSION
        )));
    }
    SessionLog::from_snapshot(saved.strokes)
}

/// Writes the strokes next to `path` and renames over it, so a crash mid-write
/// never leaves a truncated file behind.
pub async fn export_to(path: &Path, strokes: &[Stroke]) -> Result<()> {
    let json = to_json(strokes)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    info!("Exported {} strokes to {}", strokes.len(), path.display());
    Ok(())
}

pub async fn import_from(path: &Path) -> Result<SessionLog> {
    let json = tokio::fs::read_to_string(path).await?;
    let log = from_json(&json)?;
    info!(
        "Imported {} strokes from {} (last id {})",
        log.len(),
        path.display(),
        log.last_id()
    );
    Ok(log)
}
