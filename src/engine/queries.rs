use std::cmp::Reverse;

use ulid::Ulid;

use crate::availability;
use crate::guard::ensure_owner;
use crate::limits::*;
use crate::model::*;

use super::{validate_bounds, validate_range, Engine, EngineError};

impl Engine {
    /// All of a user's bookings, any status, newest first.
    pub async fn get_user_bookings(&self, user_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self.store.list_bookings_by_user(user_id).await?;
        bookings.sort_by_key(|b| Reverse((b.created_at, b.id)));
        Ok(bookings)
    }

    pub async fn get_booking(&self, user_id: Ulid, booking_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self
            .store
            .find_booking(booking_id)
            .await?
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        ensure_owner(user_id, &booking)?;
        Ok(booking)
    }

    /// Free windows of a room inside `[from, to)`.
    pub async fn room_availability(
        &self,
        room_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let query = validate_range(from, to)?;
        validate_bounds(&query, MAX_QUERY_WINDOW_MS)?;
        if self.store.find_room(room_id).await?.is_none() {
            return Err(EngineError::RoomNotFound(room_id));
        }
        let busy = self.store.find_active_overlapping(room_id, query).await?;
        Ok(availability::free_spans(&query, &busy))
    }

    /// Rooms of a hotel with no active booking overlapping `[from, to)`, by room id.
    pub async fn available_rooms(
        &self,
        hotel_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Room>, EngineError> {
        let span = validate_range(from, to)?;
        validate_bounds(&span, MAX_QUERY_WINDOW_MS)?;

        let rooms = self.store.list_rooms_by_hotel(hotel_id).await?;
        let mut free = Vec::with_capacity(rooms.len());
        for room in rooms {
            let busy = self.store.find_active_overlapping(room.id, span).await?;
            if availability::is_available(room.id, &span, &busy) {
                free.push(room);
            }
        }
        free.sort_by_key(|r| r.id);
        Ok(free)
    }
}
