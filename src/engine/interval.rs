use serde::Serialize;

use crate::model::*;

/// How an existing allocation `B` relates to a candidate interval `A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OverlapKind {
    /// Disjoint (touching endpoints included).
    NoOverlap,
    /// `B` lies fully inside `A`, or `A == B`.
    Contains,
    /// `A` lies strictly inside `B`.
    ContainedBy,
    /// `B`'s tail overlaps `A`'s head: `b1 < a1 < b2 <= a2`.
    OverlapsStart,
    /// `B`'s head overlaps `A`'s tail: `a1 <= b1 < a2 < b2`.
    OverlapsEnd,
}

impl OverlapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlapKind::NoOverlap => "no_overlap",
            OverlapKind::Contains => "contains",
            OverlapKind::ContainedBy => "contained_by",
            OverlapKind::OverlapsStart => "overlaps_start",
            OverlapKind::OverlapsEnd => "overlaps_end",
        }
    }
}

/// Classify `existing` against `candidate`. Exactly one kind per pair.
pub fn classify(candidate: &Span, existing: &Span) -> OverlapKind {
    let (a1, a2) = (candidate.start, candidate.end);
    let (b1, b2) = (existing.start, existing.end);

    if a2 <= b1 || b2 <= a1 {
        OverlapKind::NoOverlap
    } else if a1 <= b1 && b2 <= a2 {
        OverlapKind::Contains
    } else if b1 <= a1 && a2 <= b2 {
        OverlapKind::ContainedBy
    } else if b1 < a1 {
        // not contained, so b2 < a2
        OverlapKind::OverlapsStart
    } else {
        OverlapKind::OverlapsEnd
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base \ to_remove`. Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
