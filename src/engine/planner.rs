use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::detector::{validate_span, Overlap};
use super::interval::OverlapKind;
use super::{Engine, EngineError};

/// An allocation to shrink in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Truncation {
    pub allocation: Allocation,
    pub new_start: Ms,
    pub new_end: Ms,
}

impl Truncation {
    pub fn new_span(&self) -> Span {
        Span::new(self.new_start, self.new_end)
    }
}

/// What overriding a candidate interval would do to existing allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OverridePlan {
    pub can_override: bool,
    /// Allocations that strictly contain the candidate. Non-empty blocks the override.
    pub conflicts: Vec<Allocation>,
    pub would_delete: Vec<Allocation>,
    pub would_modify: Vec<Truncation>,
}

impl OverridePlan {
    /// True when applying the plan would change nothing.
    pub fn is_noop(&self) -> bool {
        self.would_delete.is_empty() && self.would_modify.is_empty()
    }

    pub fn conflict_ids(&self) -> Vec<Ulid> {
        self.conflicts.iter().map(|a| a.id).collect()
    }
}

/// Turn classified overlaps into a plan. Pure.
pub fn plan_from_overlaps(candidate: &Span, overlaps: &[Overlap]) -> OverridePlan {
    let mut plan = OverridePlan::default();
    for overlap in overlaps {
        let existing = &overlap.allocation;
        match overlap.kind {
            OverlapKind::NoOverlap => {}
            OverlapKind::Contains => plan.would_delete.push(existing.clone()),
            OverlapKind::OverlapsStart => plan.would_modify.push(Truncation {
                allocation: existing.clone(),
                new_start: existing.span.start,
                new_end: candidate.start,
            }),
            OverlapKind::OverlapsEnd => plan.would_modify.push(Truncation {
                allocation: existing.clone(),
                new_start: candidate.end,
                new_end: existing.span.end,
            }),
            OverlapKind::ContainedBy => plan.conflicts.push(existing.clone()),
        }
    }
    plan.can_override = plan.conflicts.is_empty();
    plan
}

impl Engine {
    /// Dry run of an override. Never mutates.
    pub async fn check_override_possibility(
        &self,
        employee_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    ) -> Result<OverridePlan, EngineError> {
        let candidate = validate_span(start, end)?;
        let overlaps = self
            .find_overlaps(employee_id, start, end, exclude_id)
            .await?;
        let plan = plan_from_overlaps(&candidate, &overlaps);
        debug!(
            %employee_id,
            can_override = plan.can_override,
            delete = plan.would_delete.len(),
            modify = plan.would_modify.len(),
            "override planned"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::detect;

    fn alloc(start: Ms, end: Ms) -> Allocation {
        Allocation {
            id: Ulid::new(),
            employee_id: Ulid::nil(),
            project_id: Ulid::nil(),
            phase_id: Some(Ulid::new()),
            span: Span::new(start, end),
        }
    }

    fn plan(existing: &[Allocation], start: Ms, end: Ms) -> OverridePlan {
        let candidate = Span::new(start, end);
        plan_from_overlaps(&candidate, &detect(existing, &candidate, None))
    }

    #[test]
    fn containing_allocation_blocks() {
        let outer = alloc(10, 20);
        let p = plan(std::slice::from_ref(&outer), 12, 15);
        assert!(!p.can_override);
        assert_eq!(p.conflicts, vec![outer.clone()]);
        assert_eq!(p.conflict_ids(), vec![outer.id]);
        assert!(p.is_noop());
    }

    #[test]
    fn head_and_tail_truncation() {
        let tail = alloc(5, 10);
        let p = plan(std::slice::from_ref(&tail), 1, 8);
        assert!(p.can_override);
        assert_eq!(p.would_modify.len(), 1);
        assert_eq!(p.would_modify[0].new_span(), Span::new(8, 10));
        assert_eq!(p.would_modify[0].allocation, tail);

        let head = alloc(1, 6);
        let p = plan(std::slice::from_ref(&head), 4, 9);
        assert_eq!(p.would_modify[0].new_span(), Span::new(1, 4));
    }

    #[test]
    fn enclosed_allocation_deleted() {
        let inner = alloc(5, 6);
        let p = plan(std::slice::from_ref(&inner), 1, 10);
        assert!(p.can_override);
        assert_eq!(p.would_delete, vec![inner]);
        assert!(p.would_modify.is_empty());
    }

    #[test]
    fn empty_plan_for_free_interval() {
        let p = plan(&[alloc(0, 5)], 5, 10);
        assert!(p.can_override);
        assert!(p.is_noop());
    }

    #[test]
    fn planning_is_idempotent() {
        let existing = vec![alloc(0, 4), alloc(5, 6), alloc(8, 12), alloc(20, 30)];
        assert_eq!(plan(&existing, 2, 10), plan(&existing, 2, 10));
    }
}
