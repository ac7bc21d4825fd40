use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::interval::{classify, OverlapKind};
use super::{Engine, EngineError};

/// An existing allocation that intersects a candidate interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overlap {
    pub allocation: Allocation,
    pub kind: OverlapKind,
}

/// Reject empty, inverted and out-of-range intervals.
pub fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidInterval { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// Classify every allocation in `allocations` against `candidate`, keeping
/// the intersecting ones ordered by `(start, id)`.
pub fn detect(allocations: &[Allocation], candidate: &Span, exclude: Option<Ulid>) -> Vec<Overlap> {
    let mut found: Vec<Overlap> = allocations
        .iter()
        .filter(|a| exclude != Some(a.id))
        .filter_map(|a| match classify(candidate, &a.span) {
            OverlapKind::NoOverlap => None,
            kind => Some(Overlap {
                allocation: a.clone(),
                kind,
            }),
        })
        .collect();
    found.sort_by_key(|o| (o.allocation.span.start, o.allocation.id));
    found
}

impl Engine {
    /// Allocations of `employee_id` intersecting `[start, end)`, with their kinds.
    pub async fn find_overlaps(
        &self,
        employee_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    ) -> Result<Vec<Overlap>, EngineError> {
        let candidate = validate_span(start, end)?;
        self.ensure_employee(employee_id).await?;
        let allocations = self.store.get_employee_allocations(employee_id).await?;
        Ok(detect(&allocations, &candidate, exclude_id))
    }

    pub async fn check_for_overlaps(
        &self,
        employee_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    ) -> Result<Vec<Allocation>, EngineError> {
        let overlaps = self.find_overlaps(employee_id, start, end, exclude_id).await?;
        Ok(overlaps.into_iter().map(|o| o.allocation).collect())
    }
}
