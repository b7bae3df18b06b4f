use ulid::Ulid;

use crate::locks::LockTimeout;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum BookingError {
    NotFound {
        entity: &'static str,
        id: Ulid,
    },
    /// The slot is held by `reservation`; `holder` is the requester name shown to the caller.
    Conflict {
        reservation: Ulid,
        holder: String,
    },
    LockTimeout(String),
    /// Another commit changed a row this operation was about to overwrite.
    ConcurrentModification(String),
    InvalidInterval(String),
    InvalidInput(String),
    Forbidden(String),
    AlreadyPaid(Ulid),
    PaymentInProgress(Ulid),
    NotPayable(Ulid),
    InvalidTransition(String),
    ProcessorError(String),
    PersistenceError(String),
    BookingFailed(String),
    LimitExceeded(&'static str),
}

impl BookingError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        BookingError::NotFound { entity, id }
    }

    /// Only contention is worth retrying; every other outcome is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BookingError::LockTimeout(_) | BookingError::ConcurrentModification(_)
        )
    }

    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::NotFound { .. } => "not_found",
            BookingError::Conflict { .. } => "conflict",
            BookingError::LockTimeout(_) => "lock_timeout",
            BookingError::ConcurrentModification(_) => "concurrent_modification",
            BookingError::InvalidInterval(_) => "invalid_interval",
            BookingError::InvalidInput(_) => "invalid_input",
            BookingError::Forbidden(_) => "forbidden",
            BookingError::AlreadyPaid(_) => "already_paid",
            BookingError::PaymentInProgress(_) => "payment_in_progress",
            BookingError::NotPayable(_) => "not_payable",
            BookingError::InvalidTransition(_) => "invalid_transition",
            BookingError::ProcessorError(_) => "processor_error",
            BookingError::PersistenceError(_) => "persistence_error",
            BookingError::BookingFailed(_) => "booking_failed",
            BookingError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            BookingError::Conflict { holder, .. } => {
                write!(f, "slot already reserved by {holder}")
            }
            BookingError::LockTimeout(key) => {
                write!(f, "system busy, try again shortly (lock {key})")
            }
            BookingError::ConcurrentModification(msg) => {
                write!(f, "changed concurrently, reload and try again ({msg})")
            }
            BookingError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            BookingError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            BookingError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            BookingError::AlreadyPaid(id) => {
                write!(f, "deposit for booking {id} has already been paid")
            }
            BookingError::PaymentInProgress(id) => {
                write!(f, "a payment for booking {id} is already in progress")
            }
            BookingError::NotPayable(id) => write!(f, "booking {id} is cancelled"),
            BookingError::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            BookingError::ProcessorError(msg) => write!(f, "payment processor error: {msg}"),
            BookingError::PersistenceError(msg) => write!(f, "persistence error: {msg}"),
            BookingError::BookingFailed(msg) => write!(f, "booking failed: {msg}"),
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<LockTimeout> for BookingError {
    fn from(e: LockTimeout) -> Self {
        BookingError::LockTimeout(e.key)
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(detail) => BookingError::ConcurrentModification(detail),
            other => BookingError::PersistenceError(other.to_string()),
        }
    }
}
