//! The external-iterator contract every entity reader implements.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::types::Entity;

/// A pausable, pull-based source of entities in document order.
///
/// `pause()` captures the position *after* the most recently returned
/// entity; a fresh source resumed from that cursor yields exactly the
/// entities that would have followed.
pub trait EntitySource {
    /// Serializable checkpoint type.
    type Cursor: Clone + std::fmt::Debug + Serialize + DeserializeOwned;

    /// Return the next entity, or `None` once the source is exhausted.
    fn next_entity(&mut self) -> Result<Option<Entity>>;

    /// Capture the current position.
    fn pause(&self) -> Result<Self::Cursor>;

    /// Continue from a previously captured position.
    fn resume(&mut self, cursor: &Self::Cursor) -> Result<()>;
}
