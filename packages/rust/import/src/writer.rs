use std::path::Path;

use serde::{Deserialize, Serialize};

use datalib_shared::{Entity, Result};

/// Identifier the content store assigned to an imported record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The content store the importer writes into.
///
/// Entities arrive in document order with URLs already migrated.
pub trait ContentWriter {
    fn import_entity(&mut self, entity: &Entity) -> Result<RecordId>;

    /// Register a downloaded file as an attachment of `parent`.
    fn import_attachment(&mut self, path: &Path, parent: RecordId) -> Result<RecordId>;
}
