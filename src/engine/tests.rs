use super::*;
use crate::limits::*;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
const T0: Ms = 1_767_261_600_000; // 2026-01-01T10:00:00Z

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("flightline_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), RetryConfig::none()).unwrap()
}

/// Engine over a fresh WAL whose syncs can be made to fail on demand.
fn faulty_engine(name: &str, max_retries: u32) -> (Engine, PathBuf, Arc<AtomicU32>) {
    let path = test_wal_path(name);
    let wal = Wal::open(&path).unwrap();
    let failures = wal.failure_switch();
    let retry = RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..RetryConfig::default()
    };
    (Engine::start(&path, &[], wal, retry), path, failures)
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
}

async fn add_aircraft(engine: &Engine, tail: &str, rate: Decimal) -> Ulid {
    let id = Ulid::new();
    engine
        .register_aircraft(NewAircraft {
            id,
            tail_number: tail.into(),
            make: Some("Cessna".into()),
            model: Some("172S".into()),
            year: Some(2004),
            hourly_rate: rate,
            cumulative_reading: dec!(0),
        })
        .await
        .unwrap();
    id
}

async fn book(engine: &Engine, aircraft_id: Ulid, start: Ms, end: Ms) -> Result<Reservation, LedgerError> {
    engine
        .create_reservation(NewReservation {
            id: Ulid::new(),
            aircraft_id,
            holder_id: Ulid::new(),
            start,
            end,
            notes: None,
        })
        .await
}

fn flight(aircraft_id: Ulid, holder_id: Ulid, start: Decimal, end: Option<Decimal>) -> NewUsage {
    NewUsage {
        id: Ulid::new(),
        aircraft_id,
        holder_id,
        reservation_id: None,
        start_reading: start,
        end_reading: end,
        date: day(2),
        departure: None,
        arrival: None,
    }
}

fn update_to(r: &Reservation, start: Ms, end: Ms, status: ReservationStatus) -> ReservationUpdate {
    ReservationUpdate {
        start,
        end,
        status,
        notes: r.notes.clone(),
    }
}

// ── Aircraft directory ───────────────────────────────────

#[tokio::test]
async fn register_and_get_aircraft() {
    let engine = engine("register_get.wal");
    let id = add_aircraft(&engine, "N172SP", dec!(145.50)).await;

    let info = engine.get_aircraft(id).await.unwrap();
    assert_eq!(info.tail_number, "N172SP");
    assert_eq!(info.hourly_rate, dec!(145.50));
    assert_eq!(info.cumulative_reading, dec!(0));
    assert!(info.available);
}

#[tokio::test]
async fn register_rejects_bad_input() {
    let engine = engine("register_bad.wal");
    let base = NewAircraft {
        id: Ulid::new(),
        tail_number: "N1".into(),
        make: None,
        model: None,
        year: None,
        hourly_rate: dec!(100),
        cumulative_reading: dec!(0),
    };

    let zero_rate = NewAircraft { hourly_rate: dec!(0), ..base.clone() };
    assert!(matches!(engine.register_aircraft(zero_rate).await, Err(LedgerError::Validation(_))));

    let blank_tail = NewAircraft { tail_number: "  ".into(), ..base.clone() };
    assert!(matches!(engine.register_aircraft(blank_tail).await, Err(LedgerError::Validation(_))));

    let long_tail = NewAircraft {
        tail_number: "N".repeat(MAX_TAIL_NUMBER_LEN + 1),
        ..base.clone()
    };
    assert!(matches!(engine.register_aircraft(long_tail).await, Err(LedgerError::LimitExceeded(_))));

    let negative = NewAircraft { cumulative_reading: dec!(-1), ..base.clone() };
    assert!(matches!(engine.register_aircraft(negative).await, Err(LedgerError::Validation(_))));

    engine.register_aircraft(base.clone()).await.unwrap();
    assert_eq!(
        engine.register_aircraft(base.clone()).await,
        Err(LedgerError::AlreadyExists(base.id))
    );
}

#[tokio::test]
async fn unknown_aircraft_is_not_found() {
    let engine = engine("unknown_aircraft.wal");
    let missing = Ulid::new();
    assert_eq!(engine.get_aircraft(missing).await, Err(LedgerError::NotFound(missing)));
    assert_eq!(
        book(&engine, missing, T0, T0 + H).await,
        Err(LedgerError::NotFound(missing))
    );
    assert_eq!(
        engine.set_cumulative_reading(missing, dec!(1)).await,
        Err(LedgerError::NotFound(missing))
    );
}

#[tokio::test]
async fn list_aircraft_sorted_by_tail() {
    let engine = engine("list_aircraft.wal");
    add_aircraft(&engine, "N900", dec!(100)).await;
    add_aircraft(&engine, "N100", dec!(100)).await;
    add_aircraft(&engine, "N500", dec!(100)).await;

    let tails: Vec<String> = engine
        .list_aircraft()
        .await
        .into_iter()
        .map(|a| a.tail_number)
        .collect();
    assert_eq!(tails, vec!["N100", "N500", "N900"]);
}

#[tokio::test]
async fn available_aircraft_skips_booked_and_grounded() {
    let engine = engine("available.wal");
    let free = add_aircraft(&engine, "N1", dec!(100)).await;
    let busy = add_aircraft(&engine, "N2", dec!(100)).await;
    let grounded = add_aircraft(&engine, "N3", dec!(100)).await;

    book(&engine, busy, T0, T0 + H).await.unwrap();
    engine.update_aircraft(grounded, dec!(100), false).await.unwrap();

    let ids: Vec<Ulid> = engine
        .available_aircraft(T0 + 30 * M, T0 + 2 * H)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(ids, vec![free]);

    // right after the booking, busy is free again
    let later = engine.available_aircraft(T0 + H, T0 + 2 * H).await.unwrap();
    assert_eq!(later.len(), 2);
}

#[tokio::test]
async fn remove_aircraft_blocked_by_records() {
    let engine = engine("remove_aircraft.wal");
    let id = add_aircraft(&engine, "N1", dec!(100)).await;
    let r = book(&engine, id, T0, T0 + H).await.unwrap();

    assert_eq!(
        engine.remove_aircraft(id).await,
        Err(LedgerError::Referenced { id, by: r.id })
    );

    engine.delete_reservation(r.id).await.unwrap();
    engine.remove_aircraft(id).await.unwrap();
    assert_eq!(engine.get_aircraft(id).await, Err(LedgerError::NotFound(id)));
    assert!(engine.list_aircraft().await.is_empty());
}

// ── Conflict checking ────────────────────────────────────

#[tokio::test]
async fn overlap_rejected_with_conflicting_id() {
    let engine = engine("overlap_conflict.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;

    let first = book(&engine, r1, T0, T0 + H).await.unwrap();
    assert_eq!(first.status, ReservationStatus::Booked);

    assert_eq!(
        book(&engine, r1, T0 + 30 * M, T0 + H + 30 * M).await,
        Err(LedgerError::Conflict(first.id))
    );

    // back-to-back is fine
    book(&engine, r1, T0 + H, T0 + 2 * H).await.unwrap();
}

#[tokio::test]
async fn inverted_window_rejected_before_conflict_check() {
    let engine = engine("inverted_window.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    book(&engine, r1, T0, T0 + H).await.unwrap();

    assert!(matches!(
        book(&engine, r1, T0 + H, T0).await,
        Err(LedgerError::Validation(_))
    ));
    assert!(matches!(
        book(&engine, r1, T0 + 10 * M, T0 + 10 * M).await,
        Err(LedgerError::Validation(_))
    ));
    // validation even precedes the aircraft lookup
    assert!(matches!(
        book(&engine, Ulid::new(), T0 + H, T0).await,
        Err(LedgerError::Validation(_))
    ));
}

#[tokio::test]
async fn terminal_reservations_free_the_slot() {
    let engine = engine("terminal_free.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;

    let cancelled = book(&engine, r1, T0, T0 + H).await.unwrap();
    engine.cancel_reservation(cancelled.id).await.unwrap();
    let completed = book(&engine, r1, T0, T0 + H).await.unwrap();
    engine.complete_reservation(completed.id).await.unwrap();

    book(&engine, r1, T0, T0 + H).await.unwrap();
}

#[tokio::test]
async fn conflicts_are_per_aircraft() {
    let engine = engine("per_aircraft.wal");
    let a = add_aircraft(&engine, "N1", dec!(100)).await;
    let b = add_aircraft(&engine, "N2", dec!(100)).await;

    book(&engine, a, T0, T0 + H).await.unwrap();
    book(&engine, b, T0, T0 + H).await.unwrap();
}

#[tokio::test]
async fn find_conflict_is_read_only() {
    let engine = engine("find_conflict.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let first = book(&engine, r1, T0, T0 + H).await.unwrap();

    assert_eq!(
        engine.find_conflict(r1, T0 + 10 * M, T0 + 20 * M, None).await.unwrap(),
        Some(first.id)
    );
    assert!(!engine.has_conflict(r1, T0 + 10 * M, T0 + 20 * M, Some(first.id)).await.unwrap());
    assert!(!engine.has_conflict(r1, T0 + H, T0 + 2 * H, None).await.unwrap());
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await.len(), 1);
}

#[tokio::test]
async fn concurrent_overlapping_creates_one_wins() {
    let engine = Arc::new(engine("concurrent_overlap.wal"));
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        // every window covers T0+30m..T0+45m
        let start = T0 + i * M;
        handles.push(tokio::spawn(async move { book(&eng, r1, start, start + H).await }));
    }

    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(LedgerError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await.len(), 1);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn reschedule_excludes_itself() {
    let engine = engine("reschedule_self.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let r = book(&engine, r1, T0, T0 + H).await.unwrap();

    let moved = engine
        .update_reservation(r.id, update_to(&r, T0 + 30 * M, T0 + H + 30 * M, ReservationStatus::Booked))
        .await
        .unwrap();
    assert_eq!(moved.start, T0 + 30 * M);
    assert_eq!(moved.status, ReservationStatus::Booked);
}

#[tokio::test]
async fn reschedule_into_other_booking_conflicts() {
    let engine = engine("reschedule_conflict.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let a = book(&engine, r1, T0, T0 + H).await.unwrap();
    let b = book(&engine, r1, T0 + 2 * H, T0 + 3 * H).await.unwrap();

    assert_eq!(
        engine
            .update_reservation(b.id, update_to(&b, T0 + 30 * M, T0 + 2 * H, ReservationStatus::Booked))
            .await,
        Err(LedgerError::Conflict(a.id))
    );
    // unchanged after the failed attempt
    assert_eq!(engine.get_reservation(b.id).await.unwrap().start, T0 + 2 * H);
}

#[tokio::test]
async fn update_replaces_notes_wholesale() {
    let engine = engine("update_notes.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let r = engine
        .create_reservation(NewReservation {
            id: Ulid::new(),
            aircraft_id: r1,
            holder_id: Ulid::new(),
            start: T0,
            end: T0 + H,
            notes: Some("checkride".into()),
        })
        .await
        .unwrap();
    assert_eq!(r.notes.as_deref(), Some("checkride"));

    let updated = engine
        .update_reservation(
            r.id,
            ReservationUpdate {
                start: T0,
                end: T0 + H,
                status: ReservationStatus::Booked,
                notes: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.notes, None);
}

#[tokio::test]
async fn terminal_states_are_final() {
    let engine = engine("terminal_final.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let r = book(&engine, r1, T0, T0 + H).await.unwrap();

    let cancelled = engine.cancel_reservation(r.id).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    let invalid = |to| LedgerError::InvalidState {
        id: r.id,
        from: ReservationStatus::Cancelled,
        to,
    };
    assert_eq!(engine.cancel_reservation(r.id).await, Err(invalid(ReservationStatus::Cancelled)));
    assert_eq!(engine.complete_reservation(r.id).await, Err(invalid(ReservationStatus::Completed)));
    assert_eq!(
        engine
            .update_reservation(r.id, update_to(&r, T0, T0 + H, ReservationStatus::Booked))
            .await,
        Err(invalid(ReservationStatus::Booked))
    );

    // same status, new window: allowed and never conflict-checked
    book(&engine, r1, T0 + 2 * H, T0 + 3 * H).await.unwrap();
    let moved = engine
        .update_reservation(r.id, update_to(&r, T0 + 2 * H, T0 + 3 * H, ReservationStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(moved.start, T0 + 2 * H);
    assert_eq!(moved.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn completing_via_update() {
    let engine = engine("complete_update.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let r = book(&engine, r1, T0, T0 + H).await.unwrap();

    let done = engine
        .update_reservation(r.id, update_to(&r, T0, T0 + H, ReservationStatus::Completed))
        .await
        .unwrap();
    assert_eq!(done.status, ReservationStatus::Completed);
    assert!(matches!(
        engine.complete_reservation(r.id).await,
        Err(LedgerError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn delete_reservation_blocked_by_usage() {
    let engine = engine("delete_referenced.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let r = book(&engine, r1, T0, T0 + H).await.unwrap();

    let mut log = flight(r1, r.holder_id, dec!(100), None);
    log.reservation_id = Some(r.id);
    let log = engine.record_usage(log).await.unwrap();

    assert_eq!(
        engine.delete_reservation(r.id).await,
        Err(LedgerError::Referenced { id: r.id, by: log.id })
    );
    engine.delete_usage(log.id).await.unwrap();
    engine.delete_reservation(r.id).await.unwrap();
    assert_eq!(engine.get_reservation(r.id).await, Err(LedgerError::NotFound(r.id)));
    assert_eq!(engine.delete_reservation(r.id).await, Err(LedgerError::NotFound(r.id)));
}

#[tokio::test]
async fn ids_are_unique_across_kinds() {
    let engine = engine("unique_ids.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let result = engine
        .create_reservation(NewReservation {
            id: r1,
            aircraft_id: r1,
            holder_id: Ulid::new(),
            start: T0,
            end: T0 + H,
            notes: None,
        })
        .await;
    assert_eq!(result, Err(LedgerError::AlreadyExists(r1)));
    // the rejected claim left nothing behind
    assert!(engine.list_reservations(&ReservationFilter::default()).await.is_empty());
}

#[tokio::test]
async fn notes_limit_enforced() {
    let engine = engine("notes_limit.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let result = engine
        .create_reservation(NewReservation {
            id: Ulid::new(),
            aircraft_id: r1,
            holder_id: Ulid::new(),
            start: T0,
            end: T0 + H,
            notes: Some("x".repeat(MAX_NOTES_LEN + 1)),
        })
        .await;
    assert!(matches!(result, Err(LedgerError::LimitExceeded(_))));
}

#[tokio::test]
async fn list_reservations_filters_and_orders() {
    let engine = engine("list_reservations.wal");
    let a = add_aircraft(&engine, "N1", dec!(100)).await;
    let b = add_aircraft(&engine, "N2", dec!(100)).await;
    let holder = Ulid::new();

    let mut ids = Vec::new();
    for (aircraft_id, start) in [(a, T0), (a, T0 + 2 * H), (b, T0 + H)] {
        let r = engine
            .create_reservation(NewReservation {
                id: Ulid::new(),
                aircraft_id,
                holder_id: holder,
                start,
                end: start + H,
                notes: None,
            })
            .await
            .unwrap();
        ids.push(r.id);
    }
    book(&engine, b, T0 + 5 * H, T0 + 6 * H).await.unwrap(); // someone else
    engine.cancel_reservation(ids[0]).await.unwrap();

    let mine = engine
        .list_reservations(&ReservationFilter {
            holder_id: Some(holder),
            ..Default::default()
        })
        .await;
    let starts: Vec<Ms> = mine.iter().map(|r| r.start).collect();
    assert_eq!(starts, vec![T0 + 2 * H, T0 + H, T0]);

    let booked_on_a = engine
        .list_reservations(&ReservationFilter {
            aircraft_id: Some(a),
            status: Some(ReservationStatus::Booked),
            ..Default::default()
        })
        .await;
    assert_eq!(booked_on_a.len(), 1);
    assert_eq!(booked_on_a[0].id, ids[1]);

    let window = engine
        .list_reservations(&ReservationFilter {
            start_from: Some(T0 + H),
            end_until: Some(T0 + 3 * H),
            ..Default::default()
        })
        .await;
    assert_eq!(window.len(), 2);
}

// ── Usage ledger ─────────────────────────────────────────

#[tokio::test]
async fn completed_usage_sets_reading() {
    let engine = engine("usage_reading.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let holder = Ulid::new();

    let open = engine.record_usage(flight(r1, holder, dec!(100), None)).await.unwrap();
    assert!(!open.is_complete());
    assert_eq!(engine.get_aircraft(r1).await.unwrap().cumulative_reading, dec!(0));

    engine
        .update_usage(
            open.id,
            UsageInput {
                start_reading: dec!(100),
                end_reading: Some(dec!(110)),
                date: day(2),
                departure: None,
                arrival: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(engine.get_aircraft(r1).await.unwrap().cumulative_reading, dec!(110));
}

#[tokio::test]
async fn usage_validation() {
    let engine = engine("usage_validation.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let holder = Ulid::new();

    let backwards = flight(r1, holder, dec!(110), Some(dec!(100)));
    assert!(matches!(engine.record_usage(backwards).await, Err(LedgerError::Validation(_))));

    let negative = flight(r1, holder, dec!(-1), None);
    assert!(matches!(engine.record_usage(negative).await, Err(LedgerError::Validation(_))));

    let missing = Ulid::new();
    let mut dangling = flight(r1, holder, dec!(1), None);
    dangling.reservation_id = Some(missing);
    assert_eq!(engine.record_usage(dangling).await, Err(LedgerError::NotFound(missing)));

    let other = add_aircraft(&engine, "N2", dec!(100)).await;
    let elsewhere = book(&engine, other, T0, T0 + H).await.unwrap();
    let mut crossed = flight(r1, holder, dec!(1), None);
    crossed.reservation_id = Some(elsewhere.id);
    assert!(matches!(engine.record_usage(crossed).await, Err(LedgerError::Validation(_))));

    let nowhere = Ulid::new();
    assert_eq!(
        engine.record_usage(flight(nowhere, holder, dec!(1), None)).await,
        Err(LedgerError::NotFound(nowhere))
    );

    // zero-length flight is fine
    engine.record_usage(flight(r1, holder, dec!(5), Some(dec!(5)))).await.unwrap();
}

#[tokio::test]
async fn end_reading_correction_overwrites() {
    let engine = engine("reading_overwrite.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let holder = Ulid::new();

    let first = engine
        .record_usage(flight(r1, holder, dec!(100), Some(dec!(110))))
        .await
        .unwrap();
    engine
        .record_usage(flight(r1, holder, dec!(110), Some(dec!(120))))
        .await
        .unwrap();
    assert_eq!(engine.get_aircraft(r1).await.unwrap().cumulative_reading, dec!(120));

    // correcting the older log pulls the aircraft back
    engine
        .update_usage(
            first.id,
            UsageInput {
                start_reading: dec!(100),
                end_reading: Some(dec!(109.5)),
                date: day(2),
                departure: None,
                arrival: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(engine.get_aircraft(r1).await.unwrap().cumulative_reading, dec!(109.5));

    // deleting a log leaves the reading alone
    engine.delete_usage(first.id).await.unwrap();
    assert_eq!(engine.get_aircraft(r1).await.unwrap().cumulative_reading, dec!(109.5));
}

#[tokio::test]
async fn list_usage_orders_by_date_then_departure() {
    let engine = engine("list_usage.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let holder = Ulid::new();

    let mut morning = flight(r1, holder, dec!(1), Some(dec!(2)));
    morning.date = day(3);
    morning.departure = chrono::NaiveTime::from_hms_opt(8, 0, 0);
    let mut evening = flight(r1, holder, dec!(2), Some(dec!(3)));
    evening.date = day(3);
    evening.departure = chrono::NaiveTime::from_hms_opt(18, 0, 0);
    let mut earlier = flight(r1, holder, dec!(0), Some(dec!(1)));
    earlier.date = day(1);

    for log in [morning.clone(), evening.clone(), earlier.clone()] {
        engine.record_usage(log).await.unwrap();
    }
    engine.record_usage(flight(r1, Ulid::new(), dec!(3), None)).await.unwrap();

    let ids: Vec<Ulid> = engine
        .list_usage(&UsageFilter {
            holder_id: Some(holder),
            ..Default::default()
        })
        .await
        .into_iter()
        .map(|u| u.id)
        .collect();
    assert_eq!(ids, vec![evening.id, morning.id, earlier.id]);

    let jan_3 = engine
        .list_usage(&UsageFilter {
            date_from: Some(day(3)),
            date_until: Some(day(3)),
            ..Default::default()
        })
        .await;
    assert_eq!(jan_3.len(), 2);
}

// ── Billing ──────────────────────────────────────────────

#[tokio::test]
async fn billing_from_tach_delta() {
    let engine = engine("billing_delta.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let holder = Ulid::new();

    let log = engine
        .record_usage(flight(r1, holder, dec!(100), Some(dec!(110))))
        .await
        .unwrap();
    assert_eq!(engine.get_aircraft(r1).await.unwrap().cumulative_reading, dec!(110));

    let bill = engine.derive_billing(Ulid::new(), log.id).await.unwrap();
    assert_eq!(bill.duration, dec!(10));
    assert_eq!(bill.hourly_rate, dec!(100));
    assert_eq!(bill.amount, dec!(1000));
    assert_eq!(bill.holder_id, holder);
    assert_eq!(bill.aircraft_id, r1);
    assert!(!bill.paid);
    assert_eq!(bill.payment_date, None);
    assert_eq!(bill.billing_date, today());
}

#[tokio::test]
async fn billing_keeps_fractional_precision() {
    let engine = engine("billing_fraction.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(145.50)).await;
    let log = engine
        .record_usage(flight(r1, Ulid::new(), dec!(4211.3), Some(dec!(4212.6))))
        .await
        .unwrap();
    let bill = engine.derive_billing(Ulid::new(), log.id).await.unwrap();
    assert_eq!(bill.duration, dec!(1.3));
    assert_eq!(bill.amount, dec!(189.15));
}

#[tokio::test]
async fn billing_rate_is_a_snapshot() {
    let engine = engine("billing_snapshot.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let log = engine
        .record_usage(flight(r1, Ulid::new(), dec!(100), Some(dec!(102))))
        .await
        .unwrap();
    let bill = engine.derive_billing(Ulid::new(), log.id).await.unwrap();

    engine.update_aircraft(r1, dec!(250), true).await.unwrap();
    let after = engine.get_billing(bill.id).await.unwrap();
    assert_eq!(after.amount, dec!(200));
    assert_eq!(after.hourly_rate, dec!(100));
}

#[tokio::test]
async fn incomplete_usage_cannot_be_billed() {
    let engine = engine("billing_incomplete.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let log = engine.record_usage(flight(r1, Ulid::new(), dec!(100), None)).await.unwrap();

    assert_eq!(
        engine.derive_billing(Ulid::new(), log.id).await,
        Err(LedgerError::IncompleteUsage(log.id))
    );
    let missing = Ulid::new();
    assert_eq!(
        engine.derive_billing(Ulid::new(), missing).await,
        Err(LedgerError::NotFound(missing))
    );
}

#[tokio::test]
async fn second_derivation_is_duplicate() {
    let engine = engine("billing_duplicate.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let holder = Ulid::new();
    let log = engine
        .record_usage(flight(r1, holder, dec!(100), Some(dec!(101))))
        .await
        .unwrap();

    let first = engine.derive_billing(Ulid::new(), log.id).await.unwrap();
    assert_eq!(
        engine.derive_billing(Ulid::new(), log.id).await,
        Err(LedgerError::DuplicateBilling(first.id))
    );
    let all = engine.list_billing(&BillingFilter::default()).await;
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn concurrent_derivations_bill_once() {
    let engine = Arc::new(engine("billing_concurrent.wal"));
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let log = engine
        .record_usage(flight(r1, Ulid::new(), dec!(10), Some(dec!(12))))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move { eng.derive_billing(Ulid::new(), log.id).await }));
    }
    let mut billed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => billed += 1,
            Err(LedgerError::DuplicateBilling(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(billed, 1);
}

#[tokio::test]
async fn billed_usage_cannot_be_deleted_until_billing_is() {
    let engine = engine("billing_delete.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let log = engine
        .record_usage(flight(r1, Ulid::new(), dec!(100), Some(dec!(103))))
        .await
        .unwrap();
    let bill = engine.derive_billing(Ulid::new(), log.id).await.unwrap();

    assert_eq!(
        engine.delete_usage(log.id).await,
        Err(LedgerError::Referenced { id: log.id, by: bill.id })
    );

    engine.delete_billing(bill.id).await.unwrap();
    assert_eq!(engine.get_billing(bill.id).await, Err(LedgerError::NotFound(bill.id)));
    // freed for re-derivation
    let again = engine.derive_billing(Ulid::new(), log.id).await.unwrap();
    assert_eq!(again.amount, dec!(300));
}

#[tokio::test]
async fn mark_paid_stamps_today() {
    let engine = engine("billing_paid.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let log = engine
        .record_usage(flight(r1, Ulid::new(), dec!(0), Some(dec!(1))))
        .await
        .unwrap();
    let bill = engine.derive_billing(Ulid::new(), log.id).await.unwrap();

    let paid = engine.mark_paid(bill.id).await.unwrap();
    assert!(paid.paid);
    assert_eq!(paid.payment_date, Some(today()));

    // paying again re-stamps rather than failing
    let again = engine.mark_paid(bill.id).await.unwrap();
    assert!(again.paid);
    assert_eq!(again.payment_date, Some(today()));

    let missing = Ulid::new();
    assert_eq!(engine.mark_paid(missing).await, Err(LedgerError::NotFound(missing)));
}

#[tokio::test]
async fn summary_splits_paid_and_unpaid() {
    let engine = engine("billing_summary.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let holder = Ulid::new();

    let mut bills = Vec::new();
    for (start, end) in [(dec!(0), dec!(1)), (dec!(1), dec!(3.5))] {
        let log = engine
            .record_usage(flight(r1, holder, start, Some(end)))
            .await
            .unwrap();
        bills.push(engine.derive_billing(Ulid::new(), log.id).await.unwrap());
    }
    engine.mark_paid(bills[0].id).await.unwrap();

    let summary = engine.summarize(holder).await.unwrap();
    assert_eq!(summary.count, 2);
    assert_eq!(summary.total_duration, dec!(3.5));
    assert_eq!(summary.total_amount, dec!(350));
    assert_eq!(summary.paid_amount, dec!(100));
    assert_eq!(summary.unpaid_amount, dec!(250));

    let unpaid = engine
        .list_billing(&BillingFilter {
            holder_id: Some(holder),
            paid: Some(false),
            ..Default::default()
        })
        .await;
    assert_eq!(unpaid.len(), 1);
    assert_eq!(unpaid[0].id, bills[1].id);
}

#[tokio::test]
async fn summary_for_unknown_holder_is_zero() {
    let engine = engine("billing_summary_zero.wal");
    let holder = Ulid::new();
    let summary = engine.summarize(holder).await.unwrap();
    assert_eq!(summary, BillingSummary::empty(holder));
    assert_eq!(summary.total_amount, Decimal::ZERO);
}

#[tokio::test]
async fn summary_overflow_is_limit_exceeded() {
    let engine = engine("billing_summary_overflow.wal");
    let r1 = add_aircraft(&engine, "N1", dec!(1)).await;
    let holder = Ulid::new();
    let top = Decimal::MAX - Decimal::ONE;
    for _ in 0..2 {
        let log = engine
            .record_usage(flight(r1, holder, dec!(0), Some(top)))
            .await
            .unwrap();
        // each record on its own is fine
        assert_eq!(engine.derive_billing(Ulid::new(), log.id).await.unwrap().amount, top);
    }
    assert!(matches!(
        engine.summarize(holder).await,
        Err(LedgerError::LimitExceeded(_))
    ));
    assert_eq!(engine.summarize(Ulid::new()).await.unwrap().count, 0);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn writes_after_torn_tail_survive_restarts() {
    let path = test_wal_path("torn_tail_restarts.wal");
    let r1 = {
        let engine = Engine::new(path.clone(), RetryConfig::none()).unwrap();
        add_aircraft(&engine, "N1", dec!(100)).await
    };
    {
        // crash mid-frame: length prefix claiming 64 bytes, then only two
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&64u32.to_le_bytes()).unwrap();
        f.write_all(&[1, 2]).unwrap();
    }

    let kept = {
        let engine = Engine::new(path.clone(), RetryConfig::none()).unwrap();
        book(&engine, r1, T0, T0 + H).await.unwrap()
    };
    for _ in 0..2 {
        let engine = Engine::new(path.clone(), RetryConfig::none()).unwrap();
        assert_eq!(engine.get_aircraft(r1).await.unwrap().tail_number, "N1");
        assert_eq!(
            engine.get_reservation(kept.id).await.unwrap(),
            kept,
            "acknowledged booking lost after restart"
        );
    }
    assert_eq!(Wal::replay(&path).unwrap().len(), 2);
}

#[tokio::test]
async fn booking_retries_transient_storage_failures() {
    let (engine, path, failures) = faulty_engine("retry_booking.wal", 3);
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;

    failures.store(2, Ordering::SeqCst);
    let booked = book(&engine, r1, T0, T0 + H).await.unwrap();
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get_reservation(booked.id).await.unwrap(), booked);

    // the failed attempts left no bytes behind
    assert_eq!(Wal::replay(&path).unwrap().len(), 2);
    let restarted = Engine::new(path, RetryConfig::none()).unwrap();
    assert_eq!(restarted.get_reservation(booked.id).await.unwrap(), booked);
}

#[tokio::test]
async fn booking_gives_up_once_retries_run_out() {
    let (engine, path, failures) = faulty_engine("retry_exhausted.wal", 2);
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;

    failures.store(3, Ordering::SeqCst);
    let id = Ulid::new();
    let result = engine
        .create_reservation(NewReservation {
            id,
            aircraft_id: r1,
            holder_id: Ulid::new(),
            start: T0,
            end: T0 + H,
            notes: None,
        })
        .await;
    assert!(matches!(result, Err(LedgerError::Storage(_))), "{result:?}");
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get_reservation(id).await, Err(LedgerError::NotFound(id)));

    // neither the slot nor the id stays taken
    book(&engine, r1, T0, T0 + H).await.unwrap();
    assert_eq!(Wal::replay(&path).unwrap().len(), 2);
}

#[tokio::test]
async fn usage_and_billing_writes_fail_fast() {
    let (engine, path, failures) = faulty_engine("fail_fast.wal", 3);
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let entry = flight(r1, Ulid::new(), dec!(100), Some(dec!(110)));

    // a single failure is enough: a retry would have gone through
    failures.store(1, Ordering::SeqCst);
    assert!(matches!(
        engine.record_usage(entry.clone()).await,
        Err(LedgerError::Storage(_))
    ));
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get_usage(entry.id).await, Err(LedgerError::NotFound(entry.id)));
    assert_eq!(engine.get_aircraft(r1).await.unwrap().cumulative_reading, dec!(0));

    let log = engine.record_usage(entry).await.unwrap();
    let bill_id = Ulid::new();
    failures.store(1, Ordering::SeqCst);
    assert!(matches!(
        engine.derive_billing(bill_id, log.id).await,
        Err(LedgerError::Storage(_))
    ));
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get_billing(bill_id).await, Err(LedgerError::NotFound(bill_id)));

    let bill = engine.derive_billing(bill_id, log.id).await.unwrap();
    assert_eq!(bill.amount, dec!(1000));
    // registration, usage + reading, billing
    assert_eq!(Wal::replay(&path).unwrap().len(), 4);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone(), RetryConfig::none()).unwrap());
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            book(&eng, r1, T0 + i * H, T0 + (i + 1) * H).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await.len(), n as usize);

    let engine2 = Engine::new(path, RetryConfig::none()).unwrap();
    assert_eq!(engine2.list_reservations(&ReservationFilter::default()).await.len(), n as usize);
}

#[tokio::test]
async fn replay_restores_full_ledger() {
    let path = test_wal_path("replay_full.wal");
    let holder = Ulid::new();
    let (r1, kept, cancelled, log, bill) = {
        let engine = Engine::new(path.clone(), RetryConfig::none()).unwrap();
        let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
        let kept = book(&engine, r1, T0, T0 + H).await.unwrap();
        let cancelled = book(&engine, r1, T0 + H, T0 + 2 * H).await.unwrap();
        engine.cancel_reservation(cancelled.id).await.unwrap();
        let dropped = book(&engine, r1, T0 + 3 * H, T0 + 4 * H).await.unwrap();
        engine.delete_reservation(dropped.id).await.unwrap();

        let mut entry = flight(r1, holder, dec!(100), Some(dec!(110)));
        entry.reservation_id = Some(kept.id);
        let log = engine.record_usage(entry).await.unwrap();
        let bill = engine.derive_billing(Ulid::new(), log.id).await.unwrap();
        engine.mark_paid(bill.id).await.unwrap();
        engine.update_aircraft(r1, dec!(120), true).await.unwrap();
        (r1, kept, cancelled, log, bill)
    };

    let engine = Engine::new(path, RetryConfig::none()).unwrap();
    let info = engine.get_aircraft(r1).await.unwrap();
    assert_eq!(info.cumulative_reading, dec!(110));
    assert_eq!(info.hourly_rate, dec!(120));

    assert_eq!(engine.get_reservation(kept.id).await.unwrap(), kept);
    assert_eq!(
        engine.get_reservation(cancelled.id).await.unwrap().status,
        ReservationStatus::Cancelled
    );
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await.len(), 2);
    assert_eq!(engine.get_usage(log.id).await.unwrap(), log);

    let restored = engine.get_billing(bill.id).await.unwrap();
    assert!(restored.paid);
    assert_eq!(restored.amount, dec!(1000));

    // constraints survive too
    assert_eq!(
        book(&engine, r1, T0 + 30 * M, T0 + H).await,
        Err(LedgerError::Conflict(kept.id))
    );
    assert_eq!(
        engine.derive_billing(Ulid::new(), log.id).await,
        Err(LedgerError::DuplicateBilling(bill.id))
    );
}

#[tokio::test]
async fn replay_forgets_removed_aircraft() {
    let path = test_wal_path("replay_removed.wal");
    let id = {
        let engine = Engine::new(path.clone(), RetryConfig::none()).unwrap();
        let id = add_aircraft(&engine, "N1", dec!(100)).await;
        engine.remove_aircraft(id).await.unwrap();
        id
    };
    let engine = Engine::new(path, RetryConfig::none()).unwrap();
    assert_eq!(engine.get_aircraft(id).await, Err(LedgerError::NotFound(id)));
    // the id is free again
    engine
        .register_aircraft(NewAircraft {
            id,
            tail_number: "N1".into(),
            make: None,
            model: None,
            year: None,
            hourly_rate: dec!(90),
            cumulative_reading: dec!(0),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn wal_appends_counted_through_channel() {
    let engine = engine("appends_counter.wal");
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let log = engine
        .record_usage(flight(r1, Ulid::new(), dec!(0), Some(dec!(1))))
        .await
        .unwrap();
    engine.derive_billing(Ulid::new(), log.id).await.unwrap();

    // registration, usage + reading, billing
    assert_eq!(engine.wal_appends_since_compact().await, 4);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction_state.wal");
    let engine = Engine::new(path.clone(), RetryConfig::none()).unwrap();
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;
    let holder = Ulid::new();

    for i in 0..10 {
        let r = book(&engine, r1, T0 + i * H, T0 + (i + 1) * H).await.unwrap();
        engine.delete_reservation(r.id).await.unwrap();
    }
    let kept = book(&engine, r1, T0, T0 + H).await.unwrap();
    let done = book(&engine, r1, T0 + H, T0 + 2 * H).await.unwrap();
    engine.complete_reservation(done.id).await.unwrap();
    let log = engine
        .record_usage(flight(r1, holder, dec!(100), Some(dec!(101.5))))
        .await
        .unwrap();
    let bill = engine.derive_billing(Ulid::new(), log.id).await.unwrap();
    engine.mark_paid(bill.id).await.unwrap();

    let before = std::fs::metadata(&path).unwrap().len();
    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

    // writes after compaction land in the new file
    let late = book(&engine, r1, T0 + 5 * H, T0 + 6 * H).await.unwrap();

    let engine2 = Engine::new(path, RetryConfig::none()).unwrap();
    assert_eq!(engine2.get_aircraft(r1).await.unwrap().cumulative_reading, dec!(101.5));
    assert_eq!(engine2.get_reservation(kept.id).await.unwrap(), kept);
    assert_eq!(
        engine2.get_reservation(done.id).await.unwrap().status,
        ReservationStatus::Completed
    );
    assert_eq!(engine2.get_reservation(late.id).await.unwrap(), late);
    assert_eq!(engine2.get_usage(log.id).await.unwrap(), log);
    let restored = engine2.get_billing(bill.id).await.unwrap();
    assert!(restored.paid);
    assert_eq!(restored.payment_date, Some(today()));
    assert_eq!(engine2.summarize(holder).await.unwrap().paid_amount, dec!(150));
}

#[tokio::test]
async fn compaction_waits_for_inflight_writes() {
    let path = test_wal_path("compaction_concurrent.wal");
    let engine = Arc::new(Engine::new(path.clone(), RetryConfig::none()).unwrap());
    let r1 = add_aircraft(&engine, "N1", dec!(100)).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            book(&eng, r1, T0 + i * H, T0 + (i + 1) * H).await.map(|_| ())
        }));
    }
    let compactor = {
        let eng = engine.clone();
        tokio::spawn(async move { eng.compact_wal().await })
    };
    for h in handles {
        h.await.unwrap().unwrap();
    }
    compactor.await.unwrap().unwrap();
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await.len(), 20);

    // nothing written around the rewrite was lost
    let engine2 = Engine::new(path, RetryConfig::none()).unwrap();
    assert_eq!(engine2.list_reservations(&ReservationFilter::default()).await.len(), 20);
}

#[tokio::test]
async fn aircraft_cap_holds_under_concurrent_claims() {
    let engine = Arc::new(engine("aircraft_cap.wal"));
    add_aircraft(&engine, "N1", dec!(100)).await;
    add_aircraft(&engine, "N2", dec!(100)).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move { eng.take_aircraft_slot(5) }));
    }
    let mut granted = 0;
    for h in handles {
        if h.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 3);
    assert!(!engine.take_aircraft_slot(5));
}

#[tokio::test]
async fn removal_frees_an_aircraft_slot() {
    let path = test_wal_path("aircraft_slots.wal");
    let (kept, gone) = {
        let engine = Engine::new(path.clone(), RetryConfig::none()).unwrap();
        let kept = add_aircraft(&engine, "N1", dec!(100)).await;
        let gone = add_aircraft(&engine, "N2", dec!(100)).await;
        engine.remove_aircraft(gone).await.unwrap();
        assert!(engine.take_aircraft_slot(2));
        assert!(!engine.take_aircraft_slot(2));
        (kept, gone)
    };

    // a duplicate id is refused before a slot is counted
    let engine = Engine::new(path, RetryConfig::none()).unwrap();
    let duplicate = engine
        .register_aircraft(NewAircraft {
            id: kept,
            tail_number: "N9".into(),
            make: None,
            model: None,
            year: None,
            hourly_rate: dec!(100),
            cumulative_reading: dec!(0),
        })
        .await;
    assert_eq!(duplicate, Err(LedgerError::AlreadyExists(kept)));
    assert_eq!(engine.get_aircraft(gone).await, Err(LedgerError::NotFound(gone)));
    assert!(engine.take_aircraft_slot(2));
    assert!(!engine.take_aircraft_slot(2));
}
