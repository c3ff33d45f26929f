use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Booking status. `Active` is set at creation; `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Cancelled,
}

/// Events that drive a booking through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingEvent {
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    AlreadyCancelled,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::AlreadyCancelled => write!(f, "booking is already cancelled"),
        }
    }
}

impl std::error::Error for TransitionError {}

impl BookingStatus {
    /// Only active bookings count toward availability.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Apply `event`, returning the next status. There is no way back to `Active`.
    pub fn apply(self, event: BookingEvent) -> Result<BookingStatus, TransitionError> {
        match (self, event) {
            (BookingStatus::Active, BookingEvent::Cancel) => Ok(BookingStatus::Cancelled),
            (BookingStatus::Cancelled, BookingEvent::Cancel) => {
                Err(TransitionError::AlreadyCancelled)
            }
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(pub String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown booking status: {}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for BookingStatus {
    type Err = ParseStatusError;

    /// `confirmed` is the legacy spelling of `active`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" | "confirmed" => Ok(BookingStatus::Active),
            "cancelled" => Ok(BookingStatus::Cancelled),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_active_booking() {
        let next = BookingStatus::Active.apply(BookingEvent::Cancel).unwrap();
        assert_eq!(next, BookingStatus::Cancelled);
        assert!(!next.is_active());
    }

    #[test]
    fn cancel_twice_is_rejected() {
        let result = BookingStatus::Cancelled.apply(BookingEvent::Cancel);
        assert_eq!(result, Err(TransitionError::AlreadyCancelled));
    }

    #[test]
    fn parse_status_strings() {
        assert_eq!("active".parse::<BookingStatus>().unwrap(), BookingStatus::Active);
        assert_eq!("Cancelled".parse::<BookingStatus>().unwrap(), BookingStatus::Cancelled);
        // legacy rows
        assert_eq!("confirmed".parse::<BookingStatus>().unwrap(), BookingStatus::Active);
        assert!("pending".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(BookingStatus::Active.to_string(), "active");
        assert_eq!(BookingStatus::Cancelled.to_string(), "cancelled");
    }
}
