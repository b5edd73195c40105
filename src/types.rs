//! Core identifiers for the pipewright execution engine.
//!
//! This module defines the small, cheaply-clonable identity types used
//! throughout the crate: stage identifiers, run identifiers, and the
//! sequence ordinal that orders items inside a stage.
//!
//! For execution-time structures (queue entries, worker results), see
//! [`crate::queue`] and [`crate::reorder`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Monotonically increasing ordinal assigned to each item entering a stage.
///
/// Assigned by the producer task in upstream order; it is the sole ordering
/// key used by the reorder buffer.
pub type Seq = u64;

/// Identifies a stage within a pipeline.
///
/// Stage ids are interned strings: cloning is an `Arc` bump, making them
/// cheap to thread through contexts, metrics, and error surfaces.
///
/// # Examples
///
/// ```rust
/// use pipewright::types::StageId;
///
/// let id = StageId::from("tokenize");
/// assert_eq!(id.as_str(), "tokenize");
/// assert_eq!(id.to_string(), "tokenize");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(Arc<str>);

impl StageId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StageId {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl Serialize for StageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s))
    }
}

/// Identifies a single execution of a pipeline.
///
/// Every call to [`Pipeline::run`](crate::pipeline::Pipeline::run) mints a
/// fresh run id; metrics snapshots and failure surfaces carry it so that
/// overlapping runs remain distinguishable in logs and sinks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_id_round_trips_through_strings() {
        let id = StageId::from("parse");
        assert_eq!(id.as_str(), "parse");
        assert_eq!(StageId::from(id.to_string()), id);
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }
}
