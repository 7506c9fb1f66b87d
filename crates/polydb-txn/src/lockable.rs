//! Identities of resources under lock control.

use polydb_common::prelude::*;
use std::fmt;

/// A resource that can be locked.
///
/// Only identity matters here; lock modes and owner sets belong to the lock
/// manager.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockableId {
    /// Process-wide lock (e.g. DDL)
    Global,
    /// A whole namespace
    Namespace(NamespaceId),
    /// A table, collection or graph
    Entity(EntityId),
    /// One partition of an entity
    Partition(EntityId, PartitionId),
    /// An inclusive range of rows within an entity
    RowRange {
        entity: EntityId,
        start: RowId,
        end: RowId,
    },
}

impl LockableId {
    /// The entity this lockable belongs to, if any.
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            LockableId::Global | LockableId::Namespace(_) => None,
            LockableId::Entity(e) | LockableId::Partition(e, _) => Some(*e),
            LockableId::RowRange { entity, .. } => Some(*entity),
        }
    }
}

impl fmt::Display for LockableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockableId::Global => write!(f, "global"),
            LockableId::Namespace(ns) => write!(f, "{}", ns),
            LockableId::Entity(e) => write!(f, "{}", e),
            LockableId::Partition(e, p) => write!(f, "{}/part:{}", e, p.0),
            LockableId::RowRange { entity, start, end } => {
                write!(f, "{}/rows:{}..={}", entity, start.0, end.0)
            }
        }
    }
}
