mod commit;
pub mod local;

pub use local::LocalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::lifecycle::BookingStatus;
use crate::model::*;

/// Durable, queryable set of rooms and bookings.
///
/// `reserve` is the one operation with an atomicity contract: the
/// availability check and the insert must be indivisible with respect to
/// every other `reserve` on the same room.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_room(&self, room_id: Ulid) -> Result<Option<Room>, StoreError>;

    async fn list_rooms_by_hotel(&self, hotel_id: Ulid) -> Result<Vec<Room>, StoreError>;

    /// Active bookings on `room_id` overlapping `span`.
    async fn find_active_overlapping(
        &self,
        room_id: Ulid,
        span: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Atomic check-and-insert. Fails with `Conflict` if an active booking on the
    /// room overlaps, `NotFound` if the room does not exist.
    async fn reserve(&self, draft: NewBooking) -> Result<Booking, StoreError>;

    async fn find_booking(&self, booking_id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Compare-and-set on the status field. Fails with `StatusMismatch` if the
    /// stored status is not `expected`.
    async fn update_booking_status(
        &self,
        booking_id: Ulid,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<Booking, StoreError>;

    async fn list_bookings_by_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Overlaps the given active booking.
    Conflict(Ulid),
    StatusMismatch {
        id: Ulid,
        actual: BookingStatus,
    },
    /// Transient conflict inside the atomicity mechanism. Safe to retry.
    Serialization(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Serialization(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            StoreError::StatusMismatch { id, actual } => {
                write!(f, "booking {id} has status {actual}")
            }
            StoreError::Serialization(msg) => write!(f, "serialization conflict: {msg}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
