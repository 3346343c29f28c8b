//! Logical clock for change versions.
//!
//! Each participant owns exactly one clock. Every local write and every applied
//! remote change ticks it, so tracking timestamps are a strictly increasing
//! sequence per participant. Clocks of different participants are never compared
//! against each other, which keeps change detection immune to wall-clock skew.

use crate::Version;
use serde::{Deserialize, Serialize};

/// A monotonic version counter owned by one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalClock {
    /// Last version handed out. Zero means nothing was ever written.
    pub counter: Version,
}

impl LogicalClock {
    /// Create a new clock, starting at counter 0.
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Increment the clock and return the new version.
    pub fn tick(&mut self) -> Version {
        self.counter += 1;
        self.counter
    }

    /// The last version handed out.
    pub fn current(&self) -> Version {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_starts_at_zero() {
        let clock = LogicalClock::new();
        assert_eq!(clock.current(), 0);
    }

    #[test]
    fn tick_increments_counter() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn serialization_format() {
        let clock = LogicalClock { counter: 42 };
        let json = serde_json::to_string(&clock).unwrap();
        assert_eq!(json, r#"{"counter":42}"#);
    }
}
