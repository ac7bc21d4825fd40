use std::fmt;

use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;
use crate::store::StoreError;

/// Which kind of referenced record was missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Employee,
    Project,
    Phase,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefKind::Employee => "employee",
            RefKind::Project => "project",
            RefKind::Phase => "phase",
        })
    }
}

/// Why the executor refused to apply an override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// These allocations strictly contain the candidate and would need splitting.
    Unresolvable(Vec<Ulid>),
    /// The live plan differs from the one the caller confirmed.
    StalePlan,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::Unresolvable(ids) => {
                write!(f, "allocations {} contain the interval", join_ids(ids))
            }
            ConflictReason::StalePlan => f.write_str("plan no longer matches current allocations"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval [{start}, {end}): start must be before end")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("unknown {0}: {1}")]
    InvalidReference(RefKind, Ulid),
    #[error("allocation not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("overlaps existing allocations: {}", join_ids(.0))]
    Overlap(Vec<Ulid>),
    #[error("override conflict for employee {employee_id}: {reason}")]
    Conflict {
        employee_id: Ulid,
        reason: ConflictReason,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            other => EngineError::Store(other),
        }
    }
}

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter()
        .map(Ulid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
