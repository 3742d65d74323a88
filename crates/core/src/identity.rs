use std::fmt;

use uuid::Uuid;

/// Opaque identity of one attachment. Two handles opened on the same
/// collection name never share an id; clones of one handle always do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Collection name used when the caller does not supply one.
    pub fn default_collection_name(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}
