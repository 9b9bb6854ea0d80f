use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, LedgerError};

/// Check a requested window before any lookup happens. An inverted or empty
/// window never reaches the conflict check.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, LedgerError> {
    if start >= end {
        return Err(LedgerError::Validation("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(LedgerError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(LedgerError::LimitExceeded("window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Lowest id among active reservations overlapping `span`, skipping `exclude`.
pub(crate) fn first_conflict(state: &AircraftState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    state
        .overlapping(span)
        .filter(|r| r.status.is_active() && Some(r.id) != exclude)
        .map(|r| r.id)
        .min()
}

pub(crate) fn check_no_conflict(
    state: &AircraftState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), LedgerError> {
    match first_conflict(state, span, exclude) {
        Some(id) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            Err(LedgerError::Conflict(id))
        }
        None => Ok(()),
    }
}

impl Engine {
    /// Would `[start, end)` collide with an active reservation on the aircraft?
    pub async fn has_conflict(
        &self,
        aircraft_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, LedgerError> {
        Ok(self.find_conflict(aircraft_id, start, end, exclude).await?.is_some())
    }

    /// The colliding reservation, if any. Read-only.
    pub async fn find_conflict(
        &self,
        aircraft_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, LedgerError> {
        let span = validate_window(start, end)?;
        let guard = self.read_aircraft(aircraft_id).await?;
        Ok(first_conflict(&guard, &span, exclude))
    }
}
