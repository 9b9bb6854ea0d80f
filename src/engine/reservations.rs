use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_window};
use super::{Engine, LedgerError};

fn validate_notes(notes: &Option<String>) -> Result<(), LedgerError> {
    if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(LedgerError::LimitExceeded("notes too long"));
    }
    Ok(())
}

impl Engine {
    /// Book an aircraft. The conflict check and the write happen under the
    /// aircraft's write lock, so two overlapping requests cannot both land.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, LedgerError> {
        let span = validate_window(req.start, req.end)?;
        validate_notes(&req.notes)?;

        let mut scope = self.write_aircraft(req.aircraft_id).await?;
        if scope.reservations.len() >= MAX_RESERVATIONS_PER_AIRCRAFT {
            return Err(LedgerError::LimitExceeded("too many reservations on aircraft"));
        }
        check_no_conflict(&scope, &span, None)?;
        self.claim_id(req.id, req.aircraft_id)?;

        let event = Event::ReservationCreated {
            id: req.id,
            aircraft_id: req.aircraft_id,
            holder_id: req.holder_id,
            span,
            notes: req.notes,
        };
        self.commit_retrying(&mut scope, vec![event], Some(req.id)).await?;
        debug!(reservation = %req.id, aircraft = %req.aircraft_id, start = span.start, end = span.end, "reservation booked");
        scope
            .reservation(req.id)
            .cloned()
            .ok_or(LedgerError::NotFound(req.id))
    }

    /// Wholesale replacement of window, status and notes.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        update: ReservationUpdate,
    ) -> Result<Reservation, LedgerError> {
        let span = validate_window(update.start, update.end)?;
        validate_notes(&update.notes)?;

        let mut scope = self.write_entity(id).await?;
        let current = scope.reservation(id).cloned().ok_or(LedgerError::NotFound(id))?;
        if !current.status.can_transition_to(update.status) {
            return Err(LedgerError::InvalidState {
                id,
                from: current.status,
                to: update.status,
            });
        }
        let moved = current.span() != span;
        if update.status.is_active() && moved {
            check_no_conflict(&scope, &span, Some(id))?;
        }

        let event = Event::ReservationUpdated {
            id,
            aircraft_id: current.aircraft_id,
            span,
            status: update.status,
            notes: update.notes,
        };
        self.commit_retrying(&mut scope, vec![event], None).await?;
        debug!(reservation = %id, status = %update.status, moved, "reservation updated");
        scope.reservation(id).cloned().ok_or(LedgerError::NotFound(id))
    }

    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, LedgerError> {
        self.finish_reservation(id, ReservationStatus::Cancelled).await
    }

    pub async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, LedgerError> {
        self.finish_reservation(id, ReservationStatus::Completed).await
    }

    /// Move a booked reservation to a terminal status. Already-terminal
    /// reservations are rejected, including repeats of the same transition.
    async fn finish_reservation(&self, id: Ulid, to: ReservationStatus) -> Result<Reservation, LedgerError> {
        let mut scope = self.write_entity(id).await?;
        let current = scope.reservation(id).cloned().ok_or(LedgerError::NotFound(id))?;
        if current.status.is_terminal() {
            return Err(LedgerError::InvalidState {
                id,
                from: current.status,
                to,
            });
        }

        let event = Event::ReservationUpdated {
            id,
            aircraft_id: current.aircraft_id,
            span: current.span(),
            status: to,
            notes: current.notes,
        };
        self.commit_retrying(&mut scope, vec![event], None).await?;
        debug!(reservation = %id, status = %to, "reservation closed");
        scope.reservation(id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Remove a reservation in any status, unless a usage record points at it.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<(), LedgerError> {
        let mut scope = self.write_entity(id).await?;
        let current = scope.reservation(id).cloned().ok_or(LedgerError::NotFound(id))?;
        if let Some(by) = scope.usage_referencing(id) {
            return Err(LedgerError::Referenced { id, by });
        }
        let event = Event::ReservationDeleted {
            id,
            aircraft_id: current.aircraft_id,
        };
        self.commit_retrying(&mut scope, vec![event], None).await?;
        debug!(reservation = %id, "reservation deleted");
        Ok(())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, LedgerError> {
        let guard = self.read_entity(id).await?;
        guard.reservation(id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Matching reservations, latest start first.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let mut out = Vec::new();
        for shared in self.states_for(filter.aircraft_id) {
            let guard = shared.read().await;
            if guard.retired {
                continue;
            }
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by(|a, b| b.start.cmp(&a.start).then(b.id.cmp(&a.id)));
        out
    }
}
