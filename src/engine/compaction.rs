use tokio::sync::oneshot;
use tracing::info;

use crate::model::*;

use super::{Engine, LedgerError, WalCommand};

/// The shortest event sequence that rebuilds one aircraft as it stands.
fn snapshot_events(state: &AircraftState) -> Vec<Event> {
    let mut events = vec![Event::AircraftRegistered {
        id: state.id,
        tail_number: state.tail_number.clone(),
        make: state.make.clone(),
        model: state.model.clone(),
        year: state.year,
        hourly_rate: state.hourly_rate,
        cumulative_reading: state.cumulative_reading,
        available: state.available,
    }];

    for r in &state.reservations {
        events.push(Event::ReservationCreated {
            id: r.id,
            aircraft_id: r.aircraft_id,
            holder_id: r.holder_id,
            span: r.span(),
            notes: r.notes.clone(),
        });
        if r.status != ReservationStatus::Booked {
            events.push(Event::ReservationUpdated {
                id: r.id,
                aircraft_id: r.aircraft_id,
                span: r.span(),
                status: r.status,
                notes: r.notes.clone(),
            });
        }
    }

    for u in state.usage.values() {
        events.push(Event::UsageRecorded {
            id: u.id,
            aircraft_id: u.aircraft_id,
            holder_id: u.holder_id,
            reservation_id: u.reservation_id,
            start_reading: u.start_reading,
            end_reading: u.end_reading,
            date: u.date,
            departure: u.departure,
            arrival: u.arrival,
        });
    }

    for b in state.billing.values() {
        events.push(Event::BillingDerived {
            id: b.id,
            aircraft_id: b.aircraft_id,
            holder_id: b.holder_id,
            usage_id: b.usage_id,
            duration: b.duration,
            hourly_rate: b.hourly_rate,
            amount: b.amount,
            billing_date: b.billing_date,
        });
        if let Some(payment_date) = b.payment_date.filter(|_| b.paid) {
            events.push(Event::BillingPaid {
                id: b.id,
                aircraft_id: b.aircraft_id,
                payment_date,
            });
        }
    }

    events
}

impl Engine {
    /// Rewrite the WAL as a snapshot of current state. Mutations wait on the
    /// commit gate for the duration.
    pub async fn compact_wal(&self) -> Result<(), LedgerError> {
        let _gate = self.commit_gate.write().await;

        let mut fleet: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        fleet.sort_by_key(|(id, _)| *id);
        let mut events = Vec::new();
        for (_, aircraft) in &fleet {
            let guard = aircraft.read().await;
            if !guard.retired {
                events.extend(snapshot_events(&guard));
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| LedgerError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        info!(events = count, "WAL compacted");
        Ok(())
    }

    /// Appends since the last compaction, as counted by the WAL writer.
    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
