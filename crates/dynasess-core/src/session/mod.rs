pub mod store;
pub mod kv_store;

pub use kv_store::KvSessionStore;
pub use store::SessionHandler;

use crate::record::{SessionAttributes, SessionId, Version};

/// A session as handed to the host for one request.
///
/// Carries the attributes the host mutates, the snapshot they were read as,
/// and the version token of the stored row. The token is what makes the next
/// write conditional; it lives here rather than in the store so the store
/// keeps no per-session state between calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: SessionId,
    attributes: SessionAttributes,
    snapshot: SessionAttributes,
    version: Option<Version>,
}

impl Session {
    pub(crate) fn loaded(id: SessionId, attributes: SessionAttributes, version: Option<Version>) -> Self {
        Self {
            id,
            snapshot: attributes.clone(),
            attributes,
            version,
        }
    }

    /// A session with nothing stored behind it.
    pub fn fresh(id: SessionId) -> Self {
        Self::loaded(id, SessionAttributes::new(), None)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn attributes(&self) -> &SessionAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut SessionAttributes {
        &mut self.attributes
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        self.attributes.insert(key, value)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.attributes.remove(key)
    }

    /// Replace every attribute at once.
    pub fn replace(&mut self, attributes: SessionAttributes) {
        self.attributes = attributes;
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Whether attributes differ from what was last read or written.
    pub fn is_dirty(&self) -> bool {
        self.attributes != self.snapshot
    }

    /// Version of the stored row this session was read from, if any.
    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub(crate) fn snapshot(&self) -> &SessionAttributes {
        &self.snapshot
    }

    /// Record a successful write of `attributes` under `version`.
    pub(crate) fn committed(&mut self, attributes: SessionAttributes, version: Version) {
        self.snapshot = attributes.clone();
        self.attributes = attributes;
        self.version = Some(version);
    }
}

/// Three-way merge of attribute maps.
///
/// Applies the keys `ours` changed relative to `base` on top of `theirs`.
/// Returns `None` when both sides changed the same key to different values.
pub(crate) fn merge(
    base: &SessionAttributes,
    ours: &SessionAttributes,
    theirs: &SessionAttributes,
) -> Option<SessionAttributes> {
    let mut merged = theirs.clone();
    let touched: Vec<&String> = base.keys().chain(ours.keys()).collect();

    for key in touched {
        let mine = ours.get(key);
        let was = base.get(key);
        if mine == was {
            continue;
        }
        let other = theirs.get(key);
        if other != was && other != mine {
            return None;
        }
        match mine {
            Some(v) => {
                merged.insert(key.clone(), v.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    Some(merged)
}
