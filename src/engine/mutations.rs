use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::guard::ensure_owner;
use crate::lifecycle::{BookingEvent, BookingStatus, TransitionError};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::StoreError;

use super::{validate_bounds, validate_range, Engine, EngineError};

impl Engine {
    /// Reserve `room_id` for `[from, to)` on behalf of `user_id`.
    ///
    /// Checks run in a fixed order: range shape, limits, past date, room
    /// existence, then the store's atomic check-and-insert.
    pub async fn create_booking(
        &self,
        user_id: Ulid,
        room_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_range(from, to)?;
        validate_bounds(&span, MAX_STAY_MS)?;

        let today = self.today();
        if span.start < today {
            debug!("rejecting booking on {room_id}: {from} before {today}");
            return Err(EngineError::PastBooking { from, today });
        }

        if self.store.find_room(room_id).await?.is_none() {
            return Err(EngineError::RoomNotFound(room_id));
        }

        let draft = NewBooking {
            user_id,
            room_id,
            span,
        };
        let mut attempt = 1;
        loop {
            match self.store.reserve(draft).await {
                Ok(booking) => {
                    metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                    info!(
                        "booking {} created: room {room_id} [{from}, {to}) for {user_id}",
                        booking.id
                    );
                    return Ok(booking);
                }
                Err(StoreError::Conflict(conflicting)) => {
                    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                    debug!("room {room_id} unavailable for [{from}, {to}): held by {conflicting}");
                    return Err(EngineError::RoomNotAvailable {
                        room_id,
                        conflicting,
                    });
                }
                Err(StoreError::NotFound(_)) => return Err(EngineError::RoomNotFound(room_id)),
                Err(StoreError::LimitExceeded(msg)) => return Err(EngineError::LimitExceeded(msg)),
                Err(e) if e.is_retryable() && attempt < MAX_RESERVE_ATTEMPTS => {
                    metrics::counter!(observability::RESERVE_RETRIES_TOTAL).increment(1);
                    warn!("reserve on room {room_id} hit {e}, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(EngineError::Storage(e)),
            }
        }
    }

    /// Cancel one of `user_id`'s bookings. The row is kept with status `cancelled`.
    pub async fn cancel_booking(&self, user_id: Ulid, booking_id: Ulid) -> Result<(), EngineError> {
        let booking = self
            .store
            .find_booking(booking_id)
            .await?
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        ensure_owner(user_id, &booking)?;

        let next = booking.status.apply(BookingEvent::Cancel).map_err(|e| match e {
            TransitionError::AlreadyCancelled => EngineError::AlreadyCancelled(booking_id),
        })?;

        match self
            .store
            .update_booking_status(booking_id, BookingStatus::Active, next)
            .await
        {
            Ok(_) => {
                metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
                info!("booking {booking_id} cancelled by {user_id}");
                Ok(())
            }
            // Lost a race with another cancel.
            Err(StoreError::StatusMismatch { .. }) => Err(EngineError::AlreadyCancelled(booking_id)),
            Err(StoreError::NotFound(_)) => Err(EngineError::BookingNotFound(booking_id)),
            Err(e) => Err(EngineError::Storage(e)),
        }
    }
}
