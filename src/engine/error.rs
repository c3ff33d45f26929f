use ulid::Ulid;

use crate::model::Ms;
use crate::store::StoreError;

/// Coarse classification used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidDateRange { from: Ms, to: Ms },
    /// Stay starts before the current UTC day.
    PastBooking { from: Ms, today: Ms },
    LimitExceeded(&'static str),
    RoomNotFound(Ulid),
    RoomNotAvailable { room_id: Ulid, conflicting: Ulid },
    BookingNotFound(Ulid),
    NotOwner { booking_id: Ulid, actor: Ulid },
    AlreadyCancelled(Ulid),
    Storage(StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidDateRange { .. }
            | EngineError::PastBooking { .. }
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::RoomNotFound(_) | EngineError::BookingNotFound(_) => ErrorKind::NotFound,
            EngineError::RoomNotAvailable { .. } | EngineError::AlreadyCancelled(_) => {
                ErrorKind::Conflict
            }
            EngineError::NotOwner { .. } => ErrorKind::Forbidden,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// PostgreSQL error code for the wire front-end.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidDateRange { .. } => "22007",
            EngineError::PastBooking { .. } => "22008",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::RoomNotFound(_) | EngineError::BookingNotFound(_) => "P0002",
            EngineError::RoomNotAvailable { .. } => "23P01",
            EngineError::AlreadyCancelled(_) => "55000",
            EngineError::NotOwner { .. } => "42501",
            EngineError::Storage(_) => "58030",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Forbidden => 403,
            ErrorKind::Storage => 503,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDateRange { from, to } => {
                write!(f, "invalid date range [{from}, {to}): check-in must be before check-out")
            }
            EngineError::PastBooking { from, today } => {
                write!(f, "cannot book in the past: {from} is before {today}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::RoomNotAvailable {
                room_id,
                conflicting,
            } => write!(
                f,
                "room {room_id} is not available for the selected dates (conflicts with booking {conflicting})"
            ),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::NotOwner { booking_id, .. } => {
                write!(f, "booking {booking_id} belongs to another user")
            }
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Storage(e)
    }
}
