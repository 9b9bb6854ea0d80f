use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{first_conflict, validate_window};
use super::{Engine, LedgerError};

fn validate_new_aircraft(aircraft: &NewAircraft) -> Result<(), LedgerError> {
    let tail = aircraft.tail_number.trim();
    if tail.is_empty() {
        return Err(LedgerError::Validation("tail number is required"));
    }
    if tail.len() > MAX_TAIL_NUMBER_LEN {
        return Err(LedgerError::LimitExceeded("tail number too long"));
    }
    let descriptor_too_long = |s: &Option<String>| s.as_ref().is_some_and(|s| s.len() > MAX_DESCRIPTOR_LEN);
    if descriptor_too_long(&aircraft.make) || descriptor_too_long(&aircraft.model) {
        return Err(LedgerError::LimitExceeded("make or model too long"));
    }
    validate_rate(aircraft.hourly_rate)?;
    validate_reading(aircraft.cumulative_reading)
}

fn validate_rate(rate: Decimal) -> Result<(), LedgerError> {
    if rate <= Decimal::ZERO {
        return Err(LedgerError::Validation("hourly rate must be positive"));
    }
    Ok(())
}

pub(super) fn validate_reading(value: Decimal) -> Result<(), LedgerError> {
    if value < Decimal::ZERO {
        return Err(LedgerError::Validation("readings must not be negative"));
    }
    Ok(())
}

/// The explicit reading update the usage ledger issues on completion.
pub(super) fn reading_event(aircraft_id: Ulid, value: Decimal) -> Event {
    Event::ReadingSet { aircraft_id, value }
}

impl Engine {
    pub async fn register_aircraft(&self, aircraft: NewAircraft) -> Result<AircraftInfo, LedgerError> {
        validate_new_aircraft(&aircraft)?;
        let id = aircraft.id;
        let _gate = self.commit_gate.read().await;
        self.claim_id(id, id)?;
        if !self.take_aircraft_slot(MAX_AIRCRAFT) {
            self.owners.remove(&id);
            return Err(LedgerError::LimitExceeded("too many aircraft"));
        }

        let aircraft = NewAircraft {
            tail_number: aircraft.tail_number.trim().to_string(),
            ..aircraft
        };
        let event = Event::AircraftRegistered {
            id,
            tail_number: aircraft.tail_number.clone(),
            make: aircraft.make.clone(),
            model: aircraft.model.clone(),
            year: aircraft.year,
            hourly_rate: aircraft.hourly_rate,
            cumulative_reading: aircraft.cumulative_reading,
            available: true,
        };
        if let Err(e) = self.wal_append(&[event]).await {
            self.release_aircraft_slot();
            self.owners.remove(&id);
            return Err(e);
        }
        let state = AircraftState::new(aircraft, true);
        let info = state.info();
        self.state.insert(id, Arc::new(RwLock::new(state)));
        info!(aircraft = %id, tail = %info.tail_number, "aircraft registered");
        Ok(info)
    }

    /// Replace rate and availability. Billing already derived keeps its
    /// rate snapshot.
    pub async fn update_aircraft(
        &self,
        id: Ulid,
        hourly_rate: Decimal,
        available: bool,
    ) -> Result<AircraftInfo, LedgerError> {
        validate_rate(hourly_rate)?;
        let mut scope = self.write_aircraft(id).await?;
        let event = Event::AircraftUpdated {
            id,
            hourly_rate,
            available,
        };
        self.commit(&mut scope, vec![event], None).await?;
        debug!(aircraft = %id, %hourly_rate, available, "aircraft updated");
        Ok(scope.info())
    }

    pub async fn get_aircraft(&self, id: Ulid) -> Result<AircraftInfo, LedgerError> {
        Ok(self.read_aircraft(id).await?.info())
    }

    /// The whole fleet, ordered by tail number.
    pub async fn list_aircraft(&self) -> Vec<AircraftInfo> {
        let mut out = Vec::new();
        for shared in self.snapshot_states() {
            let guard = shared.read().await;
            if !guard.retired {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| a.tail_number.cmp(&b.tail_number).then(a.id.cmp(&b.id)));
        out
    }

    /// Absolute overwrite of the running usage total.
    pub async fn set_cumulative_reading(&self, id: Ulid, value: Decimal) -> Result<AircraftInfo, LedgerError> {
        validate_reading(value)?;
        let mut scope = self.write_aircraft(id).await?;
        self.commit(&mut scope, vec![reading_event(id, value)], None).await?;
        debug!(aircraft = %id, %value, "cumulative reading set");
        Ok(scope.info())
    }

    /// Remove an aircraft with no reservations, usage or billing left on it.
    pub async fn remove_aircraft(&self, id: Ulid) -> Result<(), LedgerError> {
        let mut scope = self.write_aircraft(id).await?;
        if let Some(by) = scope.first_dependent() {
            return Err(LedgerError::Referenced { id, by });
        }
        self.wal_append(&[Event::AircraftRemoved { id }]).await?;
        scope.retired = true;
        self.state.remove(&id);
        self.owners.remove(&id);
        self.release_aircraft_slot();
        info!(aircraft = %id, "aircraft removed");
        Ok(())
    }

    /// Aircraft flagged available with nothing active overlapping `[start, end)`.
    pub async fn available_aircraft(&self, start: Ms, end: Ms) -> Result<Vec<AircraftInfo>, LedgerError> {
        let span = validate_window(start, end)?;
        let mut out = Vec::new();
        for shared in self.snapshot_states() {
            let guard = shared.read().await;
            if !guard.retired && guard.available && first_conflict(&guard, &span, None).is_none() {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| a.tail_number.cmp(&b.tail_number).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}
