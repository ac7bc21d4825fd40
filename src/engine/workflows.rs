use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::CONFLICTS_TOTAL;

use super::detector::{detect, validate_span};
use super::executor::AppliedOverride;
use super::{Engine, EngineError, RefKind};

/// What to do when a write overlaps existing allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail with [`EngineError::Overlap`].
    #[default]
    Reject,
    /// Clear the interval first; fails with [`EngineError::Conflict`] when it can't.
    Override,
}

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Reference records ─────────────────────────────────

    pub async fn register_employee(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        self.directory
            .register_employee(Employee { id, name })
            .await?;
        Ok(())
    }

    pub async fn register_project(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        self.directory.register_project(Project { id, name }).await?;
        Ok(())
    }

    pub async fn register_phase(
        &self,
        id: Ulid,
        project_id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        check_name(&name)?;
        if !self.directory.project_exists(project_id).await? {
            return Err(EngineError::InvalidReference(RefKind::Project, project_id));
        }
        self.directory
            .register_phase(Phase {
                id,
                project_id,
                name,
            })
            .await?;
        Ok(())
    }

    async fn check_phase(&self, project_id: Ulid, phase_id: Option<Ulid>) -> Result<(), EngineError> {
        if let Some(phase_id) = phase_id
            && self.directory.phase_project(phase_id).await? != Some(project_id)
        {
            return Err(EngineError::InvalidReference(RefKind::Phase, phase_id));
        }
        Ok(())
    }

    /// Fails with [`EngineError::InvalidReference`] for an unregistered employee.
    pub(super) async fn ensure_employee(&self, employee_id: Ulid) -> Result<(), EngineError> {
        if !self.directory.employee_exists(employee_id).await? {
            return Err(EngineError::InvalidReference(RefKind::Employee, employee_id));
        }
        Ok(())
    }

    async fn check_references(&self, new: &NewAllocation) -> Result<(), EngineError> {
        self.ensure_employee(new.employee_id).await?;
        if !self.directory.project_exists(new.project_id).await? {
            return Err(EngineError::InvalidReference(
                RefKind::Project,
                new.project_id,
            ));
        }
        self.check_phase(new.project_id, new.phase_id).await
    }

    // ── Allocation writes ─────────────────────────────────

    /// Make room for `span` according to `policy`. Caller holds the employee
    /// lock and read `allocations` under it.
    async fn admit(
        &self,
        employee_id: Ulid,
        allocations: &[Allocation],
        span: &Span,
        exclude_id: Option<Ulid>,
        policy: ConflictPolicy,
    ) -> Result<Option<AppliedOverride>, EngineError> {
        match policy {
            ConflictPolicy::Reject => {
                let overlaps = detect(allocations, span, exclude_id);
                if overlaps.is_empty() {
                    return Ok(None);
                }
                metrics::counter!(CONFLICTS_TOTAL, "reason" => "overlap").increment(1);
                Err(EngineError::Overlap(
                    overlaps.into_iter().map(|o| o.allocation.id).collect(),
                ))
            }
            ConflictPolicy::Override => {
                let applied = self
                    .apply_override(employee_id, allocations, span, exclude_id, None)
                    .await?;
                Ok(Some(applied))
            }
        }
    }

    /// Create an allocation. With [`ConflictPolicy::Override`] the override and
    /// the insert happen under one employee lock; a failed insert undoes the
    /// override.
    pub async fn allocate(
        &self,
        new: NewAllocation,
        policy: ConflictPolicy,
    ) -> Result<Allocation, EngineError> {
        let span = validate_span(new.span.start, new.span.end)?;
        self.check_references(&new).await?;

        let employee_id = new.employee_id;
        let _guard = self.locks.lock(employee_id).await;
        let allocations = self.store.get_employee_allocations(employee_id).await?;
        if allocations.len() >= MAX_ALLOCATIONS_PER_EMPLOYEE {
            return Err(EngineError::LimitExceeded("too many allocations for employee"));
        }

        let applied = self
            .admit(employee_id, &allocations, &span, None, policy)
            .await?;
        match self.store.create_allocation(new).await {
            Ok(allocation) => {
                info!(
                    allocation_id = %allocation.id,
                    %employee_id,
                    project_id = %allocation.project_id,
                    "allocation created"
                );
                Ok(allocation)
            }
            Err(e) => {
                if let Some(applied) = applied {
                    applied.rollback(self.store.as_ref()).await;
                }
                Err(e.into())
            }
        }
    }

    /// Move an allocation to `[start, end)`, checking only against the
    /// employee's other allocations. `phase_id` of `Some(p)` replaces the
    /// phase; `None` keeps it.
    pub async fn reallocate(
        &self,
        id: Ulid,
        start: Ms,
        end: Ms,
        phase_id: Option<Option<Ulid>>,
        policy: ConflictPolicy,
    ) -> Result<Allocation, EngineError> {
        let span = validate_span(start, end)?;
        let employee_id = self
            .store
            .get_allocation_by_id(id)
            .await?
            .ok_or(EngineError::NotFound(id))?
            .employee_id;

        let _guard = self.locks.lock(employee_id).await;
        let allocations = self.store.get_employee_allocations(employee_id).await?;
        // phase and project come from the copy read under the lock
        let current = allocations
            .iter()
            .find(|a| a.id == id)
            .ok_or(EngineError::NotFound(id))?;
        let phase_id = phase_id.unwrap_or(current.phase_id);
        self.check_phase(current.project_id, phase_id).await?;

        let applied = self
            .admit(employee_id, &allocations, &span, Some(id), policy)
            .await?;
        match self.store.update_allocation(id, span, phase_id).await {
            Ok(allocation) => Ok(allocation),
            Err(e) => {
                if let Some(applied) = applied {
                    applied.rollback(self.store.as_ref()).await;
                }
                Err(e.into())
            }
        }
    }

    pub async fn remove_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let current = self
            .store
            .get_allocation_by_id(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        let _guard = self.locks.lock(current.employee_id).await;
        Ok(self.store.delete_allocation(id).await?)
    }

    /// Remove every allocation of `employee_id` on `project_id`.
    pub async fn unassign_from_project(
        &self,
        employee_id: Ulid,
        project_id: Ulid,
    ) -> Result<Vec<Allocation>, EngineError> {
        let _guard = self.locks.lock(employee_id).await;
        let removed = self
            .store
            .delete_allocations_by_employee_and_project(employee_id, project_id)
            .await?;
        info!(%employee_id, %project_id, removed = removed.len(), "unassigned from project");
        Ok(removed)
    }

    /// Remove every allocation of `employee_id` on `phase_id`.
    pub async fn unassign_from_phase(
        &self,
        employee_id: Ulid,
        phase_id: Ulid,
    ) -> Result<Vec<Allocation>, EngineError> {
        let _guard = self.locks.lock(employee_id).await;
        let removed = self
            .store
            .delete_allocations_by_employee_and_phase(employee_id, phase_id)
            .await?;
        info!(%employee_id, %phase_id, removed = removed.len(), "unassigned from phase");
        Ok(removed)
    }
}
