use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::detector::validate_span;
use super::interval::{merge_overlapping, subtract_intervals};
use super::{Engine, EngineError};

/// Free sub-intervals of `window` once `allocations` are taken out.
pub fn free_spans(allocations: &[Allocation], window: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = allocations
        .iter()
        .filter_map(|a| a.span.intersection(window))
        .collect();
    busy.sort_by_key(|s| s.start);
    subtract_intervals(&[*window], &merge_overlapping(&busy))
}

impl Engine {
    pub async fn get_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        self.store
            .get_allocation_by_id(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn employee_allocations(
        &self,
        employee_id: Ulid,
    ) -> Result<Vec<Allocation>, EngineError> {
        Ok(self.store.get_employee_allocations(employee_id).await?)
    }

    pub async fn project_allocations(
        &self,
        project_id: Ulid,
    ) -> Result<Vec<Allocation>, EngineError> {
        Ok(self.store.get_project_allocations(project_id).await?)
    }

    pub async fn phase_allocations(&self, phase_id: Ulid) -> Result<Vec<Allocation>, EngineError> {
        Ok(self.store.get_phase_allocations(phase_id).await?)
    }

    pub async fn find_existing_allocations(
        &self,
        employee_id: Ulid,
        project_id: Ulid,
        phase_id: Option<Ulid>,
    ) -> Result<Vec<Allocation>, EngineError> {
        Ok(self
            .store
            .find_existing_allocations(employee_id, project_id, phase_id)
            .await?)
    }

    /// Parts of `[start, end)` where `employee_id` has no allocation.
    pub async fn employee_availability(
        &self,
        employee_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let window = validate_span(start, end)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let allocations = self.store.get_employee_allocations(employee_id).await?;
        Ok(free_spans(&allocations, &window))
    }
}
