//! Allocation conflict engine: classify, detect, plan, override.
//!
//! Detection and planning read store snapshots without locking. Every write
//! takes the employee's lock from [`EmployeeLocks`] and re-reads the live
//! allocations under it, so a plan computed earlier is never applied blindly.

mod detector;
mod error;
mod executor;
mod interval;
mod locks;
mod planner;
mod queries;
mod workflows;

pub use detector::{detect, validate_span, Overlap};
pub use error::{ConflictReason, EngineError, RefKind};
pub use executor::OverrideOutcome;
pub use interval::{classify, merge_overlapping, subtract_intervals, OverlapKind};
pub use locks::EmployeeLocks;
pub use planner::{plan_from_overlaps, OverridePlan, Truncation};
pub use queries::free_spans;
pub use workflows::ConflictPolicy;

use std::sync::Arc;

use crate::store::{AllocationStore, Directory};

pub struct Engine {
    store: Arc<dyn AllocationStore>,
    directory: Arc<dyn Directory>,
    locks: EmployeeLocks,
}

impl Engine {
    /// Engine over a store that also keeps the reference directory.
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: AllocationStore + Directory + 'static,
    {
        Self::with_parts(store.clone(), store)
    }

    pub fn with_parts(store: Arc<dyn AllocationStore>, directory: Arc<dyn Directory>) -> Self {
        Self {
            store,
            directory,
            locks: EmployeeLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn AllocationStore> {
        &self.store
    }

    pub fn locks(&self) -> &EmployeeLocks {
        &self.locks
    }
}
