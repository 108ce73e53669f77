//! Session persistence
//!
//! The session manager writes through to a [`SessionStore`] after every
//! mutation. Store failures are logged by the caller and never fail the
//! chat operation that triggered them.

use crate::session::ChatSession;
use modelpool_common::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

pub trait SessionStore: Send + Sync {
    fn save(&self, session: &ChatSession) -> Result<()>;
    fn load(&self, session_id: &str) -> Result<Option<ChatSession>>;
    fn delete(&self, session_id: &str) -> Result<()>;
}

/// Keeps sessions as serialized JSON documents in memory
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    documents: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &ChatSession) -> Result<()> {
        let document = serde_json::to_string(session)?;
        self.documents.write().insert(session.id.clone(), document);
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<ChatSession>> {
        match self.documents.read().get(session_id) {
            Some(document) => Ok(Some(serde_json::from_str(document)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        self.documents.write().remove(session_id);
        Ok(())
    }
}
