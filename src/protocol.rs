//! JSON request/response surface. One request per line, one response per line.
//!
//! Decimal fields (rates, readings, amounts) travel as JSON strings so no
//! precision is lost, e.g. `"hourly_rate": "145.50"`.

use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use ulid::Ulid;

use crate::engine::{Engine, LedgerError};
use crate::model::*;
use crate::observability::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // aircraft directory
    RegisterAircraft(NewAircraft),
    UpdateAircraft {
        id: Ulid,
        hourly_rate: Decimal,
        available: bool,
    },
    GetAircraft {
        id: Ulid,
    },
    ListAircraft,
    SetCumulativeReading {
        id: Ulid,
        value: Decimal,
    },
    RemoveAircraft {
        id: Ulid,
    },
    AvailableAircraft {
        start: Ms,
        end: Ms,
    },

    // reservations
    HasConflict {
        aircraft_id: Ulid,
        start: Ms,
        end: Ms,
        #[serde(default)]
        exclude: Option<Ulid>,
    },
    CreateReservation(NewReservation),
    UpdateReservation {
        id: Ulid,
        start: Ms,
        end: Ms,
        status: ReservationStatus,
        #[serde(default)]
        notes: Option<String>,
    },
    CancelReservation {
        id: Ulid,
    },
    CompleteReservation {
        id: Ulid,
    },
    DeleteReservation {
        id: Ulid,
    },
    GetReservation {
        id: Ulid,
    },
    ListReservations(ReservationFilter),

    // usage
    RecordUsage(NewUsage),
    UpdateUsage {
        id: Ulid,
        start_reading: Decimal,
        #[serde(default)]
        end_reading: Option<Decimal>,
        date: NaiveDate,
        #[serde(default)]
        departure: Option<NaiveTime>,
        #[serde(default)]
        arrival: Option<NaiveTime>,
    },
    DeleteUsage {
        id: Ulid,
    },
    GetUsage {
        id: Ulid,
    },
    ListUsage(UsageFilter),

    // billing
    DeriveBilling {
        id: Ulid,
        usage_id: Ulid,
    },
    MarkPaid {
        id: Ulid,
    },
    DeleteBilling {
        id: Ulid,
    },
    GetBilling {
        id: Ulid,
    },
    ListBilling(BillingFilter),
    Summarize {
        holder_id: Ulid,
    },
}

impl Request {
    /// Metric label for the operation.
    pub fn label(&self) -> &'static str {
        match self {
            Request::RegisterAircraft(_) => "register_aircraft",
            Request::UpdateAircraft { .. } => "update_aircraft",
            Request::GetAircraft { .. } => "get_aircraft",
            Request::ListAircraft => "list_aircraft",
            Request::SetCumulativeReading { .. } => "set_cumulative_reading",
            Request::RemoveAircraft { .. } => "remove_aircraft",
            Request::AvailableAircraft { .. } => "available_aircraft",
            Request::HasConflict { .. } => "has_conflict",
            Request::CreateReservation(_) => "create_reservation",
            Request::UpdateReservation { .. } => "update_reservation",
            Request::CancelReservation { .. } => "cancel_reservation",
            Request::CompleteReservation { .. } => "complete_reservation",
            Request::DeleteReservation { .. } => "delete_reservation",
            Request::GetReservation { .. } => "get_reservation",
            Request::ListReservations(_) => "list_reservations",
            Request::RecordUsage(_) => "record_usage",
            Request::UpdateUsage { .. } => "update_usage",
            Request::DeleteUsage { .. } => "delete_usage",
            Request::GetUsage { .. } => "get_usage",
            Request::ListUsage(_) => "list_usage",
            Request::DeriveBilling { .. } => "derive_billing",
            Request::MarkPaid { .. } => "mark_paid",
            Request::DeleteBilling { .. } => "delete_billing",
            Request::GetBilling { .. } => "get_billing",
            Request::ListBilling(_) => "list_billing",
            Request::Summarize { .. } => "summarize",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    /// Conflicting reservation, existing billing record, missing entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(status: u16, data: Value) -> Self {
        Self {
            status,
            data: Some(data),
            error: None,
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            data: None,
            error: None,
        }
    }

    pub fn from_error(err: &LedgerError) -> Self {
        Self {
            status: err.status(),
            data: None,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
                id: err.entity_id(),
            }),
        }
    }

    /// A line that did not parse as a request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            data: None,
            error: Some(ErrorBody {
                kind: "bad_request".into(),
                message: message.into(),
                id: None,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        error!("response serialization failed: {e}");
        Value::Null
    })
}

fn ok<T: Serialize>(value: &T) -> Result<Response, LedgerError> {
    Ok(Response::ok(200, to_json(value)))
}

fn created<T: Serialize>(value: &T) -> Result<Response, LedgerError> {
    Ok(Response::ok(201, to_json(value)))
}

async fn execute(engine: &Engine, request: Request) -> Result<Response, LedgerError> {
    match request {
        Request::RegisterAircraft(aircraft) => created(&engine.register_aircraft(aircraft).await?),
        Request::UpdateAircraft {
            id,
            hourly_rate,
            available,
        } => ok(&engine.update_aircraft(id, hourly_rate, available).await?),
        Request::GetAircraft { id } => ok(&engine.get_aircraft(id).await?),
        Request::ListAircraft => ok(&engine.list_aircraft().await),
        Request::SetCumulativeReading { id, value } => {
            ok(&engine.set_cumulative_reading(id, value).await?)
        }
        Request::RemoveAircraft { id } => {
            engine.remove_aircraft(id).await?;
            Ok(Response::no_content())
        }
        Request::AvailableAircraft { start, end } => ok(&engine.available_aircraft(start, end).await?),

        Request::HasConflict {
            aircraft_id,
            start,
            end,
            exclude,
        } => {
            let conflicting = engine.find_conflict(aircraft_id, start, end, exclude).await?;
            ok(&serde_json::json!({
                "conflict": conflicting.is_some(),
                "conflicting_reservation_id": conflicting,
            }))
        }
        Request::CreateReservation(req) => created(&engine.create_reservation(req).await?),
        Request::UpdateReservation {
            id,
            start,
            end,
            status,
            notes,
        } => {
            let update = ReservationUpdate {
                start,
                end,
                status,
                notes,
            };
            ok(&engine.update_reservation(id, update).await?)
        }
        Request::CancelReservation { id } => ok(&engine.cancel_reservation(id).await?),
        Request::CompleteReservation { id } => ok(&engine.complete_reservation(id).await?),
        Request::DeleteReservation { id } => {
            engine.delete_reservation(id).await?;
            Ok(Response::no_content())
        }
        Request::GetReservation { id } => ok(&engine.get_reservation(id).await?),
        Request::ListReservations(filter) => ok(&engine.list_reservations(&filter).await),

        Request::RecordUsage(new) => created(&engine.record_usage(new).await?),
        Request::UpdateUsage {
            id,
            start_reading,
            end_reading,
            date,
            departure,
            arrival,
        } => {
            let input = UsageInput {
                start_reading,
                end_reading,
                date,
                departure,
                arrival,
            };
            ok(&engine.update_usage(id, input).await?)
        }
        Request::DeleteUsage { id } => {
            engine.delete_usage(id).await?;
            Ok(Response::no_content())
        }
        Request::GetUsage { id } => ok(&engine.get_usage(id).await?),
        Request::ListUsage(filter) => ok(&engine.list_usage(&filter).await),

        Request::DeriveBilling { id, usage_id } => created(&engine.derive_billing(id, usage_id).await?),
        Request::MarkPaid { id } => ok(&engine.mark_paid(id).await?),
        Request::DeleteBilling { id } => {
            engine.delete_billing(id).await?;
            Ok(Response::no_content())
        }
        Request::GetBilling { id } => ok(&engine.get_billing(id).await?),
        Request::ListBilling(filter) => ok(&engine.list_billing(&filter).await),
        Request::Summarize { holder_id } => ok(&engine.summarize(holder_id).await?),
    }
}

/// Run one request against the engine, recording request metrics.
pub async fn dispatch(engine: &Engine, request: Request) -> Response {
    let op = request.label();
    let started = Instant::now();
    let response = execute(engine, request)
        .await
        .unwrap_or_else(|e| Response::from_error(&e));
    metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => response.status.to_string()).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
    response
}

/// Parse and dispatch one line of input.
pub async fn handle_line(engine: &Engine, line: &str) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(engine, request).await,
        Err(e) => Response::bad_request(format!("malformed request: {e}")),
    }
}
