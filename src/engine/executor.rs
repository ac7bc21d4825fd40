use serde::Serialize;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{CONFLICTS_TOTAL, OVERRIDES_TOTAL, OVERRIDE_ROLLBACKS_TOTAL};
use crate::store::AllocationStore;

use super::detector::{detect, validate_span};
use super::planner::{plan_from_overlaps, OverridePlan};
use super::{ConflictReason, Engine, EngineError};

/// What an applied override changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OverrideOutcome {
    pub deleted: Vec<Ulid>,
    /// Post-truncation state of every shrunk allocation.
    pub modified: Vec<Allocation>,
}

/// Inverse of one applied step.
enum Undo {
    /// Re-create a deleted allocation under its original id.
    Restore(Allocation),
    /// Put a truncated allocation back to its original span.
    Revert(Allocation),
}

/// An override that has been written to the store and can still be undone.
#[derive(Default)]
pub(crate) struct AppliedOverride {
    undo: Vec<Undo>,
    pub(crate) outcome: OverrideOutcome,
}

impl AppliedOverride {
    /// Undo every applied step, newest first. Failures are logged, not returned:
    /// the caller is already propagating the error that triggered the rollback.
    pub(crate) async fn rollback(self, store: &dyn AllocationStore) {
        metrics::counter!(OVERRIDE_ROLLBACKS_TOTAL).increment(1);
        for step in self.undo.into_iter().rev() {
            let (id, result) = match step {
                Undo::Restore(allocation) => {
                    (allocation.id, store.restore_allocation(allocation).await)
                }
                Undo::Revert(allocation) => (
                    allocation.id,
                    store
                        .update_allocation(allocation.id, allocation.span, allocation.phase_id)
                        .await
                        .map(|_| ()),
                ),
            };
            if let Err(e) = result {
                error!(allocation_id = %id, "rollback step failed: {e}");
            }
        }
    }
}

impl Engine {
    /// Clear `[start, end)` for `employee_id` by deleting enclosed allocations
    /// and truncating partial ones. Does not insert anything.
    pub async fn override_conflicting_allocations(
        &self,
        employee_id: Ulid,
        start: Ms,
        end: Ms,
        current_allocation_id: Option<Ulid>,
    ) -> Result<OverrideOutcome, EngineError> {
        let candidate = validate_span(start, end)?;
        self.ensure_employee(employee_id).await?;
        let _guard = self.locks.lock(employee_id).await;
        let allocations = self.store.get_employee_allocations(employee_id).await?;
        let applied = self
            .apply_override(employee_id, &allocations, &candidate, current_allocation_id, None)
            .await?;
        Ok(applied.outcome)
    }

    /// Like [`Engine::override_conflicting_allocations`], but fails with
    /// [`ConflictReason::StalePlan`] unless the live plan equals `confirmed`.
    pub async fn override_with_plan(
        &self,
        employee_id: Ulid,
        start: Ms,
        end: Ms,
        current_allocation_id: Option<Ulid>,
        confirmed: &OverridePlan,
    ) -> Result<OverrideOutcome, EngineError> {
        let candidate = validate_span(start, end)?;
        self.ensure_employee(employee_id).await?;
        let _guard = self.locks.lock(employee_id).await;
        let allocations = self.store.get_employee_allocations(employee_id).await?;
        let applied = self
            .apply_override(
                employee_id,
                &allocations,
                &candidate,
                current_allocation_id,
                Some(confirmed),
            )
            .await?;
        Ok(applied.outcome)
    }

    /// Re-plan against `allocations` and apply. Caller holds the employee lock
    /// and read `allocations` under it. On failure everything applied so far
    /// is rolled back before the error is returned.
    pub(super) async fn apply_override(
        &self,
        employee_id: Ulid,
        allocations: &[Allocation],
        candidate: &Span,
        exclude_id: Option<Ulid>,
        confirmed: Option<&OverridePlan>,
    ) -> Result<AppliedOverride, EngineError> {
        let plan = plan_from_overlaps(candidate, &detect(allocations, candidate, exclude_id));

        if confirmed.is_some_and(|c| *c != plan) {
            metrics::counter!(CONFLICTS_TOTAL, "reason" => "stale_plan").increment(1);
            return Err(EngineError::Conflict {
                employee_id,
                reason: ConflictReason::StalePlan,
            });
        }
        if !plan.can_override {
            metrics::counter!(CONFLICTS_TOTAL, "reason" => "contained").increment(1);
            return Err(EngineError::Conflict {
                employee_id,
                reason: ConflictReason::Unresolvable(plan.conflict_ids()),
            });
        }

        let mut applied = AppliedOverride::default();
        if let Err(e) = self.apply_plan(&plan, &mut applied).await {
            warn!(%employee_id, "override failed, rolling back: {e}");
            applied.rollback(self.store.as_ref()).await;
            return Err(e);
        }

        if !plan.is_noop() {
            metrics::counter!(OVERRIDES_TOTAL).increment(1);
            info!(
                %employee_id,
                start = candidate.start,
                end = candidate.end,
                deleted = applied.outcome.deleted.len(),
                modified = applied.outcome.modified.len(),
                "override applied"
            );
        }
        Ok(applied)
    }

    /// Deletions first, then truncations. Each step is recorded in `applied`
    /// only after the store accepted it.
    async fn apply_plan(
        &self,
        plan: &OverridePlan,
        applied: &mut AppliedOverride,
    ) -> Result<(), EngineError> {
        for victim in &plan.would_delete {
            self.store.delete_allocation(victim.id).await?;
            applied.undo.push(Undo::Restore(victim.clone()));
            applied.outcome.deleted.push(victim.id);
        }
        for truncation in &plan.would_modify {
            let original = &truncation.allocation;
            let updated = self
                .store
                .update_allocation(original.id, truncation.new_span(), original.phase_id)
                .await?;
            applied.undo.push(Undo::Revert(original.clone()));
            applied.outcome.modified.push(updated);
        }
        Ok(())
    }
}
