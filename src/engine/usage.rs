use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::directory::{reading_event, validate_reading};
use super::{Engine, LedgerError, WriteScope};

fn validate_readings(input: &UsageInput) -> Result<(), LedgerError> {
    validate_reading(input.start_reading)?;
    if let Some(end) = input.end_reading {
        validate_reading(end)?;
        if end < input.start_reading {
            return Err(LedgerError::Validation("end reading is below start reading"));
        }
    }
    Ok(())
}

impl Engine {
    /// Log a flight. A record that arrives complete also moves the aircraft's
    /// cumulative reading to its end reading, in the same WAL batch.
    pub async fn record_usage(&self, new: NewUsage) -> Result<UsageRecord, LedgerError> {
        let input = new.input();
        validate_readings(&input)?;

        let mut scope = self.write_aircraft(new.aircraft_id).await?;
        if let Some(reservation_id) = new.reservation_id {
            self.check_reservation_link(&scope, new.aircraft_id, reservation_id)?;
        }
        if scope.usage.len() >= MAX_USAGE_RECORDS_PER_AIRCRAFT {
            return Err(LedgerError::LimitExceeded("too many usage records on aircraft"));
        }
        self.claim_id(new.id, new.aircraft_id)?;

        let mut events = vec![Event::UsageRecorded {
            id: new.id,
            aircraft_id: new.aircraft_id,
            holder_id: new.holder_id,
            reservation_id: new.reservation_id,
            start_reading: input.start_reading,
            end_reading: input.end_reading,
            date: input.date,
            departure: input.departure,
            arrival: input.arrival,
        }];
        if let Some(end) = input.end_reading {
            events.push(reading_event(new.aircraft_id, end));
        }
        self.commit(&mut scope, events, Some(new.id)).await?;
        debug!(usage = %new.id, aircraft = %new.aircraft_id, complete = input.end_reading.is_some(), "usage recorded");
        scope.usage.get(&new.id).cloned().ok_or(LedgerError::NotFound(new.id))
    }

    /// The reservation must exist and sit on the same aircraft.
    fn check_reservation_link(
        &self,
        scope: &WriteScope,
        aircraft_id: Ulid,
        reservation_id: Ulid,
    ) -> Result<(), LedgerError> {
        match self.owner_of(&reservation_id) {
            None => Err(LedgerError::NotFound(reservation_id)),
            Some(owner) if owner != aircraft_id => Err(LedgerError::Validation(
                "reservation belongs to a different aircraft",
            )),
            Some(_) => scope
                .reservation(reservation_id)
                .map(|_| ())
                .ok_or(LedgerError::NotFound(reservation_id)),
        }
    }

    /// Replace readings, date and times. An end reading overwrites the
    /// aircraft's cumulative reading even if the aircraft has since moved on.
    pub async fn update_usage(&self, id: Ulid, input: UsageInput) -> Result<UsageRecord, LedgerError> {
        validate_readings(&input)?;

        let mut scope = self.write_entity(id).await?;
        let aircraft_id = scope.usage.get(&id).map(|u| u.aircraft_id).ok_or(LedgerError::NotFound(id))?;

        let mut events = vec![Event::UsageUpdated {
            id,
            aircraft_id,
            start_reading: input.start_reading,
            end_reading: input.end_reading,
            date: input.date,
            departure: input.departure,
            arrival: input.arrival,
        }];
        if let Some(end) = input.end_reading {
            events.push(reading_event(aircraft_id, end));
        }
        self.commit(&mut scope, events, None).await?;
        debug!(usage = %id, "usage updated");
        scope.usage.get(&id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Remove a usage record. The cumulative reading is left where it is.
    pub async fn delete_usage(&self, id: Ulid) -> Result<(), LedgerError> {
        let mut scope = self.write_entity(id).await?;
        let aircraft_id = scope.usage.get(&id).map(|u| u.aircraft_id).ok_or(LedgerError::NotFound(id))?;
        if let Some(by) = scope.billed_usage.get(&id).copied() {
            return Err(LedgerError::Referenced { id, by });
        }
        self.commit(&mut scope, vec![Event::UsageDeleted { id, aircraft_id }], None)
            .await?;
        debug!(usage = %id, "usage deleted");
        Ok(())
    }

    pub async fn get_usage(&self, id: Ulid) -> Result<UsageRecord, LedgerError> {
        let guard = self.read_entity(id).await?;
        guard.usage.get(&id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Matching usage records, most recent date (then departure) first.
    pub async fn list_usage(&self, filter: &UsageFilter) -> Vec<UsageRecord> {
        let mut out = Vec::new();
        for shared in self.states_for(filter.aircraft_id) {
            let guard = shared.read().await;
            if guard.retired {
                continue;
            }
            out.extend(guard.usage.values().filter(|u| filter.matches(u)).cloned());
        }
        out.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then(b.departure.cmp(&a.departure))
                .then(b.id.cmp(&a.id))
        });
        out
    }
}
