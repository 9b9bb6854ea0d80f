use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed input, rejected before anything else is looked at.
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Overlaps an active reservation; carries the lowest conflicting id.
    Conflict(Ulid),
    InvalidState {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// Usage record has no end reading yet.
    IncompleteUsage(Ulid),
    /// Usage already billed; carries the existing billing record id.
    DuplicateBilling(Ulid),
    /// Delete refused because `by` still points at `id`.
    Referenced {
        id: Ulid,
        by: Ulid,
    },
    LimitExceeded(&'static str),
    /// Durable write failed. Nothing was applied.
    Storage(String),
}

impl LedgerError {
    /// HTTP-style status code surfaced to clients.
    pub fn status(&self) -> u16 {
        match self {
            LedgerError::Validation(_)
            | LedgerError::IncompleteUsage(_)
            | LedgerError::LimitExceeded(_) => 400,
            LedgerError::NotFound(_) => 404,
            LedgerError::AlreadyExists(_)
            | LedgerError::Conflict(_)
            | LedgerError::InvalidState { .. }
            | LedgerError::DuplicateBilling(_)
            | LedgerError::Referenced { .. } => 409,
            LedgerError::Storage(_) => 503,
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::AlreadyExists(_) => "already_exists",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::InvalidState { .. } => "invalid_state",
            LedgerError::IncompleteUsage(_) => "incomplete_usage",
            LedgerError::DuplicateBilling(_) => "duplicate_billing",
            LedgerError::Referenced { .. } => "referenced",
            LedgerError::LimitExceeded(_) => "limit_exceeded",
            LedgerError::Storage(_) => "storage",
        }
    }

    /// The id a client needs to act on the error: the conflicting
    /// reservation, the existing billing record, the missing entity.
    pub fn entity_id(&self) -> Option<Ulid> {
        match self {
            LedgerError::NotFound(id)
            | LedgerError::AlreadyExists(id)
            | LedgerError::Conflict(id)
            | LedgerError::IncompleteUsage(id)
            | LedgerError::DuplicateBilling(id) => Some(*id),
            LedgerError::InvalidState { id, .. } => Some(*id),
            LedgerError::Referenced { by, .. } => Some(*by),
            LedgerError::Validation(_) | LedgerError::LimitExceeded(_) | LedgerError::Storage(_) => {
                None
            }
        }
    }

    /// Only storage failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Validation(msg) => write!(f, "invalid input: {msg}"),
            LedgerError::NotFound(id) => write!(f, "not found: {id}"),
            LedgerError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            LedgerError::Conflict(id) => write!(f, "conflicts with reservation {id}"),
            LedgerError::InvalidState { id, from, to } => {
                write!(f, "reservation {id} cannot move from {from} to {to}")
            }
            LedgerError::IncompleteUsage(id) => {
                write!(f, "usage record {id} has no end reading")
            }
            LedgerError::DuplicateBilling(id) => {
                write!(f, "usage already billed by {id}")
            }
            LedgerError::Referenced { id, by } => {
                write!(f, "cannot delete {id}: still referenced by {by}")
            }
            LedgerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            LedgerError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {}
