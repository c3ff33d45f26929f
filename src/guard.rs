use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::Booking;

/// Only the user who made a booking may see or change it.
pub fn ensure_owner(actor: Ulid, booking: &Booking) -> Result<(), EngineError> {
    if booking.user_id != actor {
        return Err(EngineError::NotOwner {
            booking_id: booking.id,
            actor,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::BookingStatus;
    use crate::model::Span;

    #[test]
    fn owner_passes_stranger_fails() {
        let owner = Ulid::new();
        let booking = Booking {
            id: Ulid::new(),
            user_id: owner,
            room_id: Ulid::new(),
            span: Span::new(0, 10),
            status: BookingStatus::Active,
            created_at: 0,
        };
        assert!(ensure_owner(owner, &booking).is_ok());

        let stranger = Ulid::new();
        assert_eq!(
            ensure_owner(stranger, &booking),
            Err(EngineError::NotOwner {
                booking_id: booking.id,
                actor: stranger
            })
        );
    }
}
