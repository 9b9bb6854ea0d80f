use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Booked,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Completed)
    }

    /// Active reservations hold an exclusive claim on their aircraft.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Transition table. `booked` may move anywhere (staying `booked` is a
    /// reschedule); terminal states only "move" to themselves.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        match self {
            ReservationStatus::Booked => true,
            terminal => terminal == next,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Booked => "booked",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub aircraft_id: Ulid,
    pub holder_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    pub notes: Option<String>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// A booking request as the caller submits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub id: Ulid,
    pub aircraft_id: Ulid,
    pub holder_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Wholesale replacement for a reservation; unchanged fields must be resent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationUpdate {
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

// ── Usage (flight logs) ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Ulid,
    pub aircraft_id: Ulid,
    pub holder_id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub start_reading: Decimal,
    /// Absent while the flight is still in progress.
    pub end_reading: Option<Decimal>,
    pub date: NaiveDate,
    pub departure: Option<NaiveTime>,
    pub arrival: Option<NaiveTime>,
}

impl UsageRecord {
    pub fn is_complete(&self) -> bool {
        self.end_reading.is_some()
    }

    /// Tach hours flown, once the record is complete.
    pub fn duration(&self) -> Option<Decimal> {
        self.end_reading.map(|end| end - self.start_reading)
    }
}

/// Caller-supplied readings and times, shared by record and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInput {
    pub start_reading: Decimal,
    #[serde(default)]
    pub end_reading: Option<Decimal>,
    pub date: NaiveDate,
    #[serde(default)]
    pub departure: Option<NaiveTime>,
    #[serde(default)]
    pub arrival: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUsage {
    pub id: Ulid,
    pub aircraft_id: Ulid,
    pub holder_id: Ulid,
    #[serde(default)]
    pub reservation_id: Option<Ulid>,
    pub start_reading: Decimal,
    #[serde(default)]
    pub end_reading: Option<Decimal>,
    pub date: NaiveDate,
    #[serde(default)]
    pub departure: Option<NaiveTime>,
    #[serde(default)]
    pub arrival: Option<NaiveTime>,
}

impl NewUsage {
    pub fn input(&self) -> UsageInput {
        UsageInput {
            start_reading: self.start_reading,
            end_reading: self.end_reading,
            date: self.date,
            departure: self.departure,
            arrival: self.arrival,
        }
    }
}

// ── Billing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub id: Ulid,
    pub holder_id: Ulid,
    pub usage_id: Ulid,
    pub aircraft_id: Ulid,
    pub duration: Decimal,
    /// Rate in force when the record was derived.
    pub hourly_rate: Decimal,
    pub amount: Decimal,
    pub billing_date: NaiveDate,
    pub paid: bool,
    pub payment_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingSummary {
    pub holder_id: Ulid,
    pub count: u64,
    pub total_duration: Decimal,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub unpaid_amount: Decimal,
}

impl BillingSummary {
    pub fn empty(holder_id: Ulid) -> Self {
        Self {
            holder_id,
            count: 0,
            total_duration: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            unpaid_amount: Decimal::ZERO,
        }
    }

    /// Fold one record in. `None` if any total would overflow.
    pub fn checked_add(self, record: &BillingRecord) -> Option<Self> {
        let (paid_amount, unpaid_amount) = if record.paid {
            (self.paid_amount.checked_add(record.amount)?, self.unpaid_amount)
        } else {
            (self.paid_amount, self.unpaid_amount.checked_add(record.amount)?)
        };
        Some(Self {
            holder_id: self.holder_id,
            count: self.count + 1,
            total_duration: self.total_duration.checked_add(record.duration)?,
            total_amount: self.total_amount.checked_add(record.amount)?,
            paid_amount,
            unpaid_amount,
        })
    }
}

// ── Aircraft ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAircraft {
    pub id: Ulid,
    pub tail_number: String,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub year: Option<u16>,
    pub hourly_rate: Decimal,
    #[serde(default)]
    pub cumulative_reading: Decimal,
}

/// Directory view of an aircraft, without its ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AircraftInfo {
    pub id: Ulid,
    pub tail_number: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<u16>,
    pub hourly_rate: Decimal,
    pub cumulative_reading: Decimal,
    pub available: bool,
}

/// Everything the engine keeps for one aircraft. One lock guards all of it, so
/// conflict checks, reading updates and billing uniqueness are serialized per
/// aircraft.
#[derive(Debug, Clone)]
pub struct AircraftState {
    pub id: Ulid,
    pub tail_number: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<u16>,
    pub hourly_rate: Decimal,
    pub cumulative_reading: Decimal,
    pub available: bool,
    /// Sorted by `start`.
    pub reservations: Vec<Reservation>,
    pub usage: BTreeMap<Ulid, UsageRecord>,
    pub billing: BTreeMap<Ulid, BillingRecord>,
    /// usage id → billing id
    pub billed_usage: HashMap<Ulid, Ulid>,
    /// Set once the aircraft is removed; holders of a stale handle must bail.
    pub retired: bool,
}

impl AircraftState {
    pub fn new(aircraft: NewAircraft, available: bool) -> Self {
        Self {
            id: aircraft.id,
            tail_number: aircraft.tail_number,
            make: aircraft.make,
            model: aircraft.model,
            year: aircraft.year,
            hourly_rate: aircraft.hourly_rate,
            cumulative_reading: aircraft.cumulative_reading,
            available,
            reservations: Vec::new(),
            usage: BTreeMap::new(),
            billing: BTreeMap::new(),
            billed_usage: HashMap::new(),
            retired: false,
        }
    }

    pub fn info(&self) -> AircraftInfo {
        AircraftInfo {
            id: self.id,
            tail_number: self.tail_number.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            year: self.year,
            hourly_rate: self.hourly_rate,
            cumulative_reading: self.cumulative_reading,
            available: self.available,
        }
    }

    /// Insert keeping sort order by start. Replaces any reservation with the same id.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        self.remove_reservation(reservation.id);
        let pos = self
            .reservations
            .partition_point(|r| r.start <= reservation.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps the query window, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self.reservations.partition_point(|r| r.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.end > query.start)
    }

    pub fn insert_billing(&mut self, record: BillingRecord) {
        self.billed_usage.insert(record.usage_id, record.id);
        self.billing.insert(record.id, record);
    }

    pub fn remove_billing(&mut self, id: Ulid) -> Option<BillingRecord> {
        let record = self.billing.remove(&id)?;
        if self.billed_usage.get(&record.usage_id) == Some(&id) {
            self.billed_usage.remove(&record.usage_id);
        }
        Some(record)
    }

    /// First usage record pointing at the reservation, if any.
    pub fn usage_referencing(&self, reservation_id: Ulid) -> Option<Ulid> {
        self.usage
            .values()
            .find(|u| u.reservation_id == Some(reservation_id))
            .map(|u| u.id)
    }

    /// Any record still hanging off this aircraft.
    pub fn first_dependent(&self) -> Option<Ulid> {
        self.reservations
            .first()
            .map(|r| r.id)
            .or_else(|| self.usage.keys().next().copied())
            .or_else(|| self.billing.keys().next().copied())
    }
}

// ── Query filters ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationFilter {
    pub holder_id: Option<Ulid>,
    pub aircraft_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
    /// Reservations starting at or after this instant.
    pub start_from: Option<Ms>,
    /// Reservations ending at or before this instant.
    pub end_until: Option<Ms>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.holder_id.is_none_or(|h| r.holder_id == h)
            && self.aircraft_id.is_none_or(|a| r.aircraft_id == a)
            && self.status.is_none_or(|s| r.status == s)
            && self.start_from.is_none_or(|t| r.start >= t)
            && self.end_until.is_none_or(|t| r.end <= t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageFilter {
    pub holder_id: Option<Ulid>,
    pub aircraft_id: Option<Ulid>,
    pub date_from: Option<NaiveDate>,
    pub date_until: Option<NaiveDate>,
}

impl UsageFilter {
    pub fn matches(&self, u: &UsageRecord) -> bool {
        self.holder_id.is_none_or(|h| u.holder_id == h)
            && self.aircraft_id.is_none_or(|a| u.aircraft_id == a)
            && self.date_from.is_none_or(|d| u.date >= d)
            && self.date_until.is_none_or(|d| u.date <= d)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingFilter {
    pub holder_id: Option<Ulid>,
    pub paid: Option<bool>,
    pub date_from: Option<NaiveDate>,
    pub date_until: Option<NaiveDate>,
}

impl BillingFilter {
    pub fn matches(&self, b: &BillingRecord) -> bool {
        self.holder_id.is_none_or(|h| b.holder_id == h)
            && self.paid.is_none_or(|p| b.paid == p)
            && self.date_from.is_none_or(|d| b.billing_date >= d)
            && self.date_until.is_none_or(|d| b.billing_date <= d)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat event types, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AircraftRegistered {
        id: Ulid,
        tail_number: String,
        make: Option<String>,
        model: Option<String>,
        year: Option<u16>,
        hourly_rate: Decimal,
        cumulative_reading: Decimal,
        available: bool,
    },
    AircraftUpdated {
        id: Ulid,
        hourly_rate: Decimal,
        available: bool,
    },
    AircraftRemoved {
        id: Ulid,
    },
    ReadingSet {
        aircraft_id: Ulid,
        value: Decimal,
    },
    ReservationCreated {
        id: Ulid,
        aircraft_id: Ulid,
        holder_id: Ulid,
        span: Span,
        notes: Option<String>,
    },
    ReservationUpdated {
        id: Ulid,
        aircraft_id: Ulid,
        span: Span,
        status: ReservationStatus,
        notes: Option<String>,
    },
    ReservationDeleted {
        id: Ulid,
        aircraft_id: Ulid,
    },
    UsageRecorded {
        id: Ulid,
        aircraft_id: Ulid,
        holder_id: Ulid,
        reservation_id: Option<Ulid>,
        start_reading: Decimal,
        end_reading: Option<Decimal>,
        date: NaiveDate,
        departure: Option<NaiveTime>,
        arrival: Option<NaiveTime>,
    },
    UsageUpdated {
        id: Ulid,
        aircraft_id: Ulid,
        start_reading: Decimal,
        end_reading: Option<Decimal>,
        date: NaiveDate,
        departure: Option<NaiveTime>,
        arrival: Option<NaiveTime>,
    },
    UsageDeleted {
        id: Ulid,
        aircraft_id: Ulid,
    },
    BillingDerived {
        id: Ulid,
        aircraft_id: Ulid,
        holder_id: Ulid,
        usage_id: Ulid,
        duration: Decimal,
        hourly_rate: Decimal,
        amount: Decimal,
        billing_date: NaiveDate,
    },
    BillingPaid {
        id: Ulid,
        aircraft_id: Ulid,
        payment_date: NaiveDate,
    },
    BillingDeleted {
        id: Ulid,
        aircraft_id: Ulid,
    },
}

impl Event {
    /// The aircraft an event applies to.
    pub fn aircraft_id(&self) -> Ulid {
        match self {
            Event::AircraftRegistered { id, .. }
            | Event::AircraftUpdated { id, .. }
            | Event::AircraftRemoved { id } => *id,
            Event::ReadingSet { aircraft_id, .. }
            | Event::ReservationCreated { aircraft_id, .. }
            | Event::ReservationUpdated { aircraft_id, .. }
            | Event::ReservationDeleted { aircraft_id, .. }
            | Event::UsageRecorded { aircraft_id, .. }
            | Event::UsageUpdated { aircraft_id, .. }
            | Event::UsageDeleted { aircraft_id, .. }
            | Event::BillingDerived { aircraft_id, .. }
            | Event::BillingPaid { aircraft_id, .. }
            | Event::BillingDeleted { aircraft_id, .. } => *aircraft_id,
        }
    }
}
