mod billing;
mod compaction;
mod conflict;
mod directory;
mod error;
mod reservations;
mod usage;
#[cfg(test)]
mod tests;

pub use error::LedgerError;

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{error, info};
use ulid::Ulid;

use crate::model::*;
use crate::retry::{RetryConfig, with_retry};
use crate::wal::Wal;

pub type SharedAircraftState = Arc<RwLock<AircraftState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one mutation. They are flushed together or not at all.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes one append, drains whatever else is already queued,
/// then pays for a single fsync on behalf of the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (events, response) = match cmd {
            WalCommand::Append { events, response } => (events, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(events, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { events, response } => batch.push((events, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .flat_map(|(events, _)| events.iter())
        .try_for_each(|event| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // A failed batch must leave no bytes ahead of the next one.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        error!(path = %wal.path().display(), error = %e, "WAL rollback failed");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Apply ────────────────────────────────────────────────

/// Apply an event to the aircraft it belongs to. The caller holds the lock.
/// Registration and removal change the aircraft map itself and are handled
/// by the caller.
fn apply_to_aircraft(state: &mut AircraftState, event: &Event, owners: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AircraftUpdated {
            hourly_rate,
            available,
            ..
        } => {
            state.hourly_rate = *hourly_rate;
            state.available = *available;
        }
        Event::ReadingSet { value, .. } => state.cumulative_reading = *value,
        Event::ReservationCreated {
            id,
            aircraft_id,
            holder_id,
            span,
            notes,
        } => {
            state.insert_reservation(Reservation {
                id: *id,
                aircraft_id: *aircraft_id,
                holder_id: *holder_id,
                start: span.start,
                end: span.end,
                status: ReservationStatus::Booked,
                notes: notes.clone(),
            });
            owners.insert(*id, *aircraft_id);
        }
        Event::ReservationUpdated {
            id,
            span,
            status,
            notes,
            ..
        } => {
            if let Some(mut reservation) = state.remove_reservation(*id) {
                reservation.start = span.start;
                reservation.end = span.end;
                reservation.status = *status;
                reservation.notes = notes.clone();
                state.insert_reservation(reservation);
            }
        }
        Event::ReservationDeleted { id, .. } => {
            state.remove_reservation(*id);
            owners.remove(id);
        }
        Event::UsageRecorded {
            id,
            aircraft_id,
            holder_id,
            reservation_id,
            start_reading,
            end_reading,
            date,
            departure,
            arrival,
        } => {
            state.usage.insert(
                *id,
                UsageRecord {
                    id: *id,
                    aircraft_id: *aircraft_id,
                    holder_id: *holder_id,
                    reservation_id: *reservation_id,
                    start_reading: *start_reading,
                    end_reading: *end_reading,
                    date: *date,
                    departure: *departure,
                    arrival: *arrival,
                },
            );
            owners.insert(*id, *aircraft_id);
        }
        Event::UsageUpdated {
            id,
            start_reading,
            end_reading,
            date,
            departure,
            arrival,
            ..
        } => {
            if let Some(record) = state.usage.get_mut(id) {
                record.start_reading = *start_reading;
                record.end_reading = *end_reading;
                record.date = *date;
                record.departure = *departure;
                record.arrival = *arrival;
            }
        }
        Event::UsageDeleted { id, .. } => {
            state.usage.remove(id);
            owners.remove(id);
        }
        Event::BillingDerived {
            id,
            aircraft_id,
            holder_id,
            usage_id,
            duration,
            hourly_rate,
            amount,
            billing_date,
        } => {
            state.insert_billing(BillingRecord {
                id: *id,
                holder_id: *holder_id,
                usage_id: *usage_id,
                aircraft_id: *aircraft_id,
                duration: *duration,
                hourly_rate: *hourly_rate,
                amount: *amount,
                billing_date: *billing_date,
                paid: false,
                payment_date: None,
            });
            owners.insert(*id, *aircraft_id);
        }
        Event::BillingPaid {
            id, payment_date, ..
        } => {
            if let Some(record) = state.billing.get_mut(id) {
                record.paid = true;
                record.payment_date = Some(*payment_date);
            }
        }
        Event::BillingDeleted { id, .. } => {
            state.remove_billing(*id);
            owners.remove(id);
        }
        Event::AircraftRegistered { .. } | Event::AircraftRemoved { .. } => {}
    }
}

fn aircraft_from_event(event: &Event) -> Option<AircraftState> {
    let Event::AircraftRegistered {
        id,
        tail_number,
        make,
        model,
        year,
        hourly_rate,
        cumulative_reading,
        available,
    } = event
    else {
        return None;
    };
    let aircraft = NewAircraft {
        id: *id,
        tail_number: tail_number.clone(),
        make: make.clone(),
        model: model.clone(),
        year: *year,
        hourly_rate: *hourly_rate,
        cumulative_reading: *cumulative_reading,
    };
    Some(AircraftState::new(aircraft, *available))
}

// ── Engine ───────────────────────────────────────────────

/// Exclusive access to one aircraft for the length of a mutation. Also holds
/// the commit gate open so compaction never snapshots a half-applied write.
pub(super) struct WriteScope {
    aircraft: OwnedRwLockWriteGuard<AircraftState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for WriteScope {
    type Target = AircraftState;

    fn deref(&self) -> &AircraftState {
        &self.aircraft
    }
}

impl DerefMut for WriteScope {
    fn deref_mut(&mut self) -> &mut AircraftState {
        &mut self.aircraft
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedAircraftState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Every live id → the aircraft that owns it. Aircraft map to themselves,
    /// so ids are unique across all record kinds.
    pub(super) owners: DashMap<Ulid, Ulid>,
    /// Mutations hold the read side; compaction takes the write side.
    pub(super) commit_gate: Arc<RwLock<()>>,
    /// Registered aircraft, counted at claim time so the fleet cap is exact.
    aircraft_count: AtomicUsize,
    retry: RetryConfig,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from inside a tokio runtime.
    pub fn new(wal_path: PathBuf, retry: RetryConfig) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        Ok(Self::start(&wal_path, &events, wal, retry))
    }

    /// Rebuild state from `events` and hand `wal` to the writer task.
    fn start(wal_path: &Path, events: &[Event], wal: Wal, retry: RetryConfig) -> Self {
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let owners = DashMap::new();
        let mut fleet: HashMap<Ulid, AircraftState> = HashMap::new();
        for event in events {
            match event {
                Event::AircraftRegistered { id, .. } => {
                    if let Some(aircraft) = aircraft_from_event(event) {
                        owners.insert(*id, *id);
                        fleet.insert(*id, aircraft);
                    }
                }
                Event::AircraftRemoved { id } => {
                    fleet.remove(id);
                    owners.remove(id);
                }
                other => {
                    if let Some(aircraft) = fleet.get_mut(&other.aircraft_id()) {
                        apply_to_aircraft(aircraft, other, &owners);
                    }
                }
            }
        }

        info!(
            path = %wal_path.display(),
            events = events.len(),
            aircraft = fleet.len(),
            "ledger replayed"
        );

        let aircraft_count = AtomicUsize::new(fleet.len());
        let state = fleet
            .into_iter()
            .map(|(id, aircraft)| (id, Arc::new(RwLock::new(aircraft))))
            .collect();

        Self {
            state,
            wal_tx,
            owners,
            commit_gate: Arc::new(RwLock::new(())),
            aircraft_count,
            retry,
        }
    }

    /// Count one more aircraft unless the fleet already holds `limit`.
    pub(super) fn take_aircraft_slot(&self, limit: usize) -> bool {
        self.aircraft_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    pub(super) fn release_aircraft_slot(&self) {
        self.aircraft_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Hand events to the group-commit writer and wait for the fsync.
    async fn wal_append(&self, events: &[Event]) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    pub fn get_shared(&self, id: &Ulid) -> Option<SharedAircraftState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn owner_of(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.owners.get(entity_id).map(|e| *e.value())
    }

    /// Clones the handles out so no map shard stays locked across an await.
    pub(super) fn snapshot_states(&self) -> Vec<SharedAircraftState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    /// Handles to read for a listing: one aircraft if the filter names it,
    /// otherwise the whole fleet.
    pub(super) fn states_for(&self, aircraft_id: Option<Ulid>) -> Vec<SharedAircraftState> {
        match aircraft_id {
            Some(id) => self.get_shared(&id).into_iter().collect(),
            None => self.snapshot_states(),
        }
    }

    pub(super) async fn write_aircraft(&self, aircraft_id: Ulid) -> Result<WriteScope, LedgerError> {
        let gate = self.commit_gate.clone().read_owned().await;
        let shared = self
            .get_shared(&aircraft_id)
            .ok_or(LedgerError::NotFound(aircraft_id))?;
        let aircraft = shared.write_owned().await;
        if aircraft.retired {
            return Err(LedgerError::NotFound(aircraft_id));
        }
        Ok(WriteScope {
            aircraft,
            _gate: gate,
        })
    }

    /// Route an entity id to its aircraft and lock it for writing.
    pub(super) async fn write_entity(&self, entity_id: Ulid) -> Result<WriteScope, LedgerError> {
        let aircraft_id = self
            .owner_of(&entity_id)
            .ok_or(LedgerError::NotFound(entity_id))?;
        self.write_aircraft(aircraft_id)
            .await
            .map_err(|_| LedgerError::NotFound(entity_id))
    }

    pub(super) async fn read_aircraft(
        &self,
        aircraft_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<AircraftState>, LedgerError> {
        let shared = self
            .get_shared(&aircraft_id)
            .ok_or(LedgerError::NotFound(aircraft_id))?;
        let guard = shared.read_owned().await;
        if guard.retired {
            return Err(LedgerError::NotFound(aircraft_id));
        }
        Ok(guard)
    }

    pub(super) async fn read_entity(
        &self,
        entity_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<AircraftState>, LedgerError> {
        let aircraft_id = self
            .owner_of(&entity_id)
            .ok_or(LedgerError::NotFound(entity_id))?;
        self.read_aircraft(aircraft_id)
            .await
            .map_err(|_| LedgerError::NotFound(entity_id))
    }

    /// Reserve a fresh id for `aircraft_id`. Fails if the id is live anywhere.
    pub(super) fn claim_id(&self, id: Ulid, aircraft_id: Ulid) -> Result<(), LedgerError> {
        match self.owners.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LedgerError::AlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(aircraft_id);
                Ok(())
            }
        }
    }

    /// Append + apply. A claimed id is released if the append fails.
    pub(super) async fn commit(
        &self,
        scope: &mut WriteScope,
        events: Vec<Event>,
        claimed: Option<Ulid>,
    ) -> Result<(), LedgerError> {
        let appended = self.wal_append(&events).await;
        self.finish_commit(scope, &events, claimed, appended)
    }

    /// Like `commit`, but retries transient storage failures with backoff.
    pub(super) async fn commit_retrying(
        &self,
        scope: &mut WriteScope,
        events: Vec<Event>,
        claimed: Option<Ulid>,
    ) -> Result<(), LedgerError> {
        let appended = with_retry(|| self.wal_append(&events), &self.retry).await;
        self.finish_commit(scope, &events, claimed, appended)
    }

    fn finish_commit(
        &self,
        scope: &mut WriteScope,
        events: &[Event],
        claimed: Option<Ulid>,
        appended: Result<(), LedgerError>,
    ) -> Result<(), LedgerError> {
        if let Err(e) = appended {
            if let Some(id) = claimed {
                self.owners.remove(&id);
            }
            return Err(e);
        }
        for event in events {
            apply_to_aircraft(scope, event, &self.owners);
        }
        Ok(())
    }
}

/// Current UTC calendar date, used for billing and payment stamps.
pub(crate) fn today() -> chrono::NaiveDate {
    chrono::Utc::now().date_naive()
}
