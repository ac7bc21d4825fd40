use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// One calendar day. Allocations are whole-day ranges, so callers pass midnight instants.
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor: `None` for empty or inverted ranges.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

/// One employee assigned to a project (and optionally a phase) for a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub employee_id: Ulid,
    pub project_id: Ulid,
    pub phase_id: Option<Ulid>,
    pub span: Span,
}

/// Creation request. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAllocation {
    pub employee_id: Ulid,
    pub project_id: Ulid,
    pub phase_id: Option<Ulid>,
    pub span: Span,
}

impl NewAllocation {
    pub fn into_allocation(self, id: Ulid) -> Allocation {
        Allocation {
            id,
            employee_id: self.employee_id,
            project_id: self.project_id,
            phase_id: self.phase_id,
            span: self.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Employee {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub id: Ulid,
    pub project_id: Ulid,
    pub name: String,
}

/// All allocations of one employee.
#[derive(Debug, Clone)]
pub struct EmployeeState {
    pub id: Ulid,
    /// Sorted by `(span.start, id)`.
    pub allocations: Vec<Allocation>,
}

impl EmployeeState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            allocations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `(span.start, id)`.
    pub fn insert(&mut self, allocation: Allocation) {
        let key = (allocation.span.start, allocation.id);
        let pos = self
            .allocations
            .binary_search_by_key(&key, |a| (a.span.start, a.id))
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.id == id)?;
        Some(self.allocations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    /// Return only allocations whose span overlaps the query window.
    /// Uses binary search to skip allocations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.span.start < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

/// Flat event types, no nesting. This is the WAL record format and the
/// change-feed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EmployeeRegistered {
        id: Ulid,
        name: String,
    },
    ProjectRegistered {
        id: Ulid,
        name: String,
    },
    PhaseRegistered {
        id: Ulid,
        project_id: Ulid,
        name: String,
    },
    AllocationCreated {
        id: Ulid,
        employee_id: Ulid,
        project_id: Ulid,
        phase_id: Option<Ulid>,
        span: Span,
    },
    AllocationUpdated {
        id: Ulid,
        employee_id: Ulid,
        span: Span,
        phase_id: Option<Ulid>,
    },
    AllocationDeleted {
        id: Ulid,
        employee_id: Ulid,
    },
}

impl Event {
    pub fn created(allocation: &Allocation) -> Self {
        Event::AllocationCreated {
            id: allocation.id,
            employee_id: allocation.employee_id,
            project_id: allocation.project_id,
            phase_id: allocation.phase_id,
            span: allocation.span,
        }
    }

    /// Employee whose allocations this event touches, if any.
    pub fn employee_id(&self) -> Option<Ulid> {
        match self {
            Event::AllocationCreated { employee_id, .. }
            | Event::AllocationUpdated { employee_id, .. }
            | Event::AllocationDeleted { employee_id, .. } => Some(*employee_id),
            Event::EmployeeRegistered { id, .. } => Some(*id),
            Event::ProjectRegistered { .. } | Event::PhaseRegistered { .. } => None,
        }
    }
}
