use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ctlplane_core::Entity;

/// Kind of mutation that produced a change event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl core::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed entity mutation.
///
/// Events are immutable facts: created once after the base store commits,
/// delivered to the listeners registered at that moment, then kept only in the
/// retention-bounded log.
#[derive(Debug, Clone)]
pub struct ChangeEvent<E: Entity> {
    pub entity_id: E::Id,
    pub change_type: ChangeType,
    /// Post-mutation state; `None` for deletions.
    pub snapshot: Option<E>,
    /// Pre-mutation state; `None` for creations.
    pub previous: Option<E>,
    /// Strictly increasing, never reused.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl<E: Entity> ChangeEvent<E> {
    pub fn created(entity: E, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity.id().clone(),
            change_type: ChangeType::Created,
            snapshot: Some(entity),
            previous: None,
            sequence,
            timestamp,
        }
    }

    pub fn updated(previous: E, entity: E, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity.id().clone(),
            change_type: ChangeType::Updated,
            snapshot: Some(entity),
            previous: Some(previous),
            sequence,
            timestamp,
        }
    }

    pub fn deleted(previous: E, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id: previous.id().clone(),
            change_type: ChangeType::Deleted,
            snapshot: None,
            previous: Some(previous),
            sequence,
            timestamp,
        }
    }
}
