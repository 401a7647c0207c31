//! # Session Log
//!
//! The authoritative, append-only record of every stroke accepted in a
//! session. Ids are handed out here and nowhere else: each append takes the
//! current maximum id plus one, so a live session's ids are gap-free and
//! strictly increasing. Deleting only sets a tombstone, which keeps exports
//! and replays a faithful copy of what happened.
//!
//! The log itself does no locking and no I/O. The server keeps it behind the
//! same lock as the broadcast hub (see [`crate::server`]); the on-disk format
//! lives in [`snapshot`].

pub mod snapshot;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::stroke::{NewStroke, Stroke, StrokeId};

#[derive(Debug, Default, Clone)]
pub struct SessionLog {
    strokes: Vec<Stroke>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from saved strokes. See [`SessionLog::load_snapshot`].
    pub fn from_snapshot(strokes: Vec<Stroke>) -> Result<Self> {
        let mut log = Self::new();
        log.load_snapshot(strokes)?;
        Ok(log)
    }

    /// Assigns the next id and stores the stroke. The caller validates first.
    pub fn append(&mut self, stroke: NewStroke, author: Uuid) -> Result<Stroke> {
        let last = self.last_id();
        let id = last.checked_add(1).ok_or(Error::IdsExhausted(last))?;
        let stored = Stroke::accept(id, stroke, author);
        self.strokes.push(stored.clone());
        Ok(stored)
    }

    /// Tombstones `id`. Returns `false` for unknown or already deleted ids so
    /// a retried delete is harmless.
    pub fn mark_deleted(&mut self, id: StrokeId) -> bool {
        match self.position(id) {
            Some(index) if !self.strokes[index].deleted => {
                self.strokes[index].deleted = true;
                true
            }
            _ => false,
        }
    }

    /// The full ordered log, tombstones included.
    pub fn snapshot(&self) -> Vec<Stroke> {
        self.strokes.clone()
    }

    /// Replaces the whole log. Only meant for startup import, before anyone
    /// has joined. Nothing is replaced unless every stroke checks out.
    pub fn load_snapshot(&mut self, strokes: Vec<Stroke>) -> Result<()> {
        let mut previous = 0;
        for stroke in &strokes {
            if stroke.id <= previous {
                return Err(Error::CorruptState(format!(
                    "stroke id {} follows id {}; ids must be unique and strictly increasing",
                    stroke.id, previous
                )));
            }
            stroke.validate().map_err(|e| {
                Error::CorruptState(format!("stroke {} is invalid: {}", stroke.id, e))
            })?;
            previous = stroke.id;
        }
        self.strokes = strokes;
        Ok(())
    }

    /// Every stroke with an id above `after_id`, in order.
    pub fn replay_from(&self, after_id: StrokeId) -> Vec<Stroke> {
        let start = self.strokes.partition_point(|s| s.id <= after_id);
        self.strokes[start..].to_vec()
    }

    /// Ids of strokes that are still visible.
    pub fn live_ids(&self) -> Vec<StrokeId> {
        self.strokes
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.id)
            .collect()
    }

    pub fn get(&self, id: StrokeId) -> Option<&Stroke> {
        self.position(id).map(|index| &self.strokes[index])
    }

    pub fn last_id(&self) -> StrokeId {
        self.strokes.last().map_or(0, |s| s.id)
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    fn position(&self, id: StrokeId) -> Option<usize> {
        self.strokes.binary_search_by_key(&id, |s| s.id).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::{Color, Point};

    fn dab(x: f64) -> NewStroke {
        NewStroke::new(vec![Point::new(x, x)], Color::BLACK, 2)
    }

    fn log_of(n: usize) -> SessionLog {
        let mut log = SessionLog::new();
        for i in 0..n {
            log.append(dab(i as f64), Uuid::nil()).unwrap();
        }
        log
    }

    #[test]
    fn append_assigns_ids_from_one() {
        let mut log = SessionLog::new();
        let author = Uuid::new_v4();
        let first = log.append(dab(0.0), author).unwrap();
        let second = log.append(dab(1.0), author).unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.author, author);
        assert!(!first.deleted);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn mark_deleted_is_idempotent() {
        let mut log = log_of(1);
        assert!(log.mark_deleted(1));
        assert!(!log.mark_deleted(1));
        assert!(log.get(1).is_some_and(|s| s.deleted));
    }

    #[test]
    fn deleting_an_unknown_id_reports_false() {
        let mut log = log_of(2);
        assert!(!log.mark_deleted(3));
        assert!(!log.mark_deleted(0));
        assert!(log.snapshot().iter().all(|s| !s.deleted));
    }

    #[test]
    fn snapshot_keeps_tombstones_in_order() {
        let mut log = log_of(3);
        log.mark_deleted(2);
        let ids: Vec<_> = log.snapshot().iter().map(|s| (s.id, s.deleted)).collect();
        assert_eq!(ids, vec![(1, false), (2, true), (3, false)]);
        assert_eq!(log.live_ids(), vec![1, 3]);
    }

    #[test]
    fn replay_from_returns_the_tail() {
        let log = log_of(5);
        let tail: Vec<_> = log.replay_from(3).iter().map(|s| s.id).collect();
        assert_eq!(tail, vec![4, 5]);
        assert_eq!(log.replay_from(0), log.snapshot());
        assert!(log.replay_from(9).is_empty());
    }

    #[test]
    fn ids_resume_after_imported_maximum() {
        let mut saved = log_of(3).snapshot();
        saved.remove(1);
        let mut log = SessionLog::from_snapshot(saved).unwrap();
        assert_eq!(log.append(dab(9.0), Uuid::nil()).unwrap().id, 4);
        assert_eq!(log.replay_from(1).iter().map(|s| s.id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn load_rejects_duplicate_or_decreasing_ids() {
        let mut saved = log_of(3).snapshot();
        saved.swap(0, 1);
        let mut log = log_of(1);
        let err = log.load_snapshot(saved).unwrap_err();
        assert!(matches!(err, Error::CorruptState(_)));
        // Nothing was replaced.
        assert_eq!(log.len(), 1);

        let mut dup = log_of(2).snapshot();
        dup[1].id = 1;
        assert!(matches!(
            SessionLog::from_snapshot(dup),
            Err(Error::CorruptState(_))
        ));
    }

    #[test]
    fn append_after_the_largest_id_fails_cleanly() {
        let mut saved = log_of(1).snapshot();
        saved[0].id = StrokeId::MAX;
        let mut log = SessionLog::from_snapshot(saved).unwrap();

        let err = log.append(dab(1.0), Uuid::nil()).unwrap_err();
        assert!(matches!(err, Error::IdsExhausted(last) if last == StrokeId::MAX));
        assert_eq!(log.len(), 1);
        assert_eq!(log.last_id(), StrokeId::MAX);
    }

    #[test]
    fn load_rejects_invalid_strokes() {
        let mut saved = log_of(2).snapshot();
        saved[1].points.clear();
        assert!(matches!(
            SessionLog::from_snapshot(saved),
            Err(Error::CorruptState(_))
        ));
    }
}
