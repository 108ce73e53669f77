//! Model lookup by user id

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Maps a user id to that user's fine-tuned model
pub trait ModelLocator: Send + Sync {
    /// `None` when the user has no model
    fn locate(&self, user_id: &str) -> Option<PathBuf>;
}

/// Looks for `<root>/<user_id>`
#[derive(Debug, Clone)]
pub struct DirectoryLocator {
    root: PathBuf,
}

impl DirectoryLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// User ids become path components, so nothing that could escape the root
fn is_safe_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && !user_id.starts_with('.')
        && !user_id.contains("..")
        && !user_id.contains(['/', '\\', '\0'])
}

impl ModelLocator for DirectoryLocator {
    fn locate(&self, user_id: &str) -> Option<PathBuf> {
        if !is_safe_id(user_id) {
            debug!("Rejecting unsafe user id {:?}", user_id);
            return None;
        }

        let path = self.root.join(user_id);
        if path.exists() {
            Some(path)
        } else {
            debug!("No model for {} under {}", user_id, self.root.display());
            None
        }
    }
}

/// Fixed in-memory mapping, for embedding and tests
#[derive(Debug, Default)]
pub struct StaticLocator {
    models: RwLock<HashMap<String, PathBuf>>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: impl Into<String>, path: impl Into<PathBuf>) {
        self.models.write().insert(user_id.into(), path.into());
    }

    pub fn remove(&self, user_id: &str) -> Option<PathBuf> {
        self.models.write().remove(user_id)
    }
}

impl ModelLocator for StaticLocator {
    fn locate(&self, user_id: &str) -> Option<PathBuf> {
        self.models.read().get(user_id).cloned()
    }
}
