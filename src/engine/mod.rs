mod error;
mod mutations;
mod queries;

pub use error::{EngineError, ErrorKind};

use std::sync::Arc;

use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::store::BookingStore;

/// Reservation engine. Stateless apart from its collaborators; every
/// atomicity guarantee comes from the store.
pub struct Engine {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Midnight UTC of the clock's current day.
    pub fn today(&self) -> Ms {
        start_of_day(self.clock.now_ms())
    }
}

/// `[from, to)` with `from < to`.
pub fn validate_range(from: Ms, to: Ms) -> Result<Span, EngineError> {
    Span::checked(from, to).map_err(|e| EngineError::InvalidDateRange {
        from: e.from,
        to: e.to,
    })
}

/// Reject instants outside the supported window and spans wider than `max_width`.
pub(crate) fn validate_bounds(span: &Span, max_width: Ms) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > max_width {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}
