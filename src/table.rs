// Session table: the set of upstream sessions a single tunnel currently owns.

use crate::session::SessionHandle;
use std::collections::HashMap;

/// Error returned when a table operation violates the one-session-per-id invariant.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("duplicate session id {0}")]
    Duplicate(u32),
}

/// Owns every live upstream session for one tunnel, keyed by session id.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<u32, SessionHandle>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Insert a newly created session. Fails if `session_id` is already present.
    pub fn insert(&mut self, session_id: u32, handle: SessionHandle) -> Result<(), TableError> {
        if self.sessions.contains_key(&session_id) {
            return Err(TableError::Duplicate(session_id));
        }
        self.sessions.insert(session_id, handle);
        Ok(())
    }

    pub fn find(&self, session_id: u32) -> Option<&SessionHandle> {
        self.sessions.get(&session_id)
    }

    pub fn remove(&mut self, session_id: u32) -> Option<SessionHandle> {
        self.sessions.remove(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove and return every session, e.g. for tunnel teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, SessionHandle)> + '_ {
        self.sessions.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle() -> SessionHandle {
        SessionHandle::new_for_test()
    }

    #[test]
    fn insert_then_find() {
        let mut table = SessionTable::new();
        table.insert(1, dummy_handle()).unwrap();
        assert!(table.find(1).is_some());
        assert!(table.find(2).is_none());
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut table = SessionTable::new();
        table.insert(1, dummy_handle()).unwrap();
        let err = table.insert(1, dummy_handle()).unwrap_err();
        assert!(matches!(err, TableError::Duplicate(1)));
    }

    #[test]
    fn remove_returns_owned_session() {
        let mut table = SessionTable::new();
        table.insert(7, dummy_handle()).unwrap();
        assert!(table.remove(7).is_some());
        assert!(table.remove(7).is_none());
    }

    #[test]
    fn drain_empties_table() {
        let mut table = SessionTable::new();
        table.insert(1, dummy_handle()).unwrap();
        table.insert(2, dummy_handle()).unwrap();
        let drained: Vec<_> = table.drain().collect();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
