/// Conversion between raw performance-counter ticks and wall-clock units.
///
/// All event timestamps in this crate are unsigned tick counts from a
/// monotonic counter with a fixed frequency. A tick value of zero always
/// means "unknown / not recorded", and every conversion here treats it that
/// way.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    frequency: u64,
    session_start: u64,
    ms_per_tick: f64,
}

impl TimeBase {
    pub fn new(frequency: u64) -> Self {
        Self::with_session_start(frequency, 0)
    }

    pub fn with_session_start(frequency: u64, session_start: u64) -> Self {
        let ms_per_tick = if frequency == 0 {
            0.0
        } else {
            1000.0 / frequency as f64
        };
        Self {
            frequency,
            session_start,
            ms_per_tick,
        }
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    pub fn session_start(&self) -> u64 {
        self.session_start
    }

    /// Converts a tick duration to milliseconds.
    pub fn ticks_to_ms(&self, ticks: u64) -> f64 {
        ticks as f64 * self.ms_per_tick
    }

    /// Delta in milliseconds, zero unless `end` is strictly after a nonzero
    /// `start`.
    pub fn delta_unsigned_ms(&self, start: u64, end: u64) -> f64 {
        if end <= start || start == 0 || end == 0 {
            0.0
        } else {
            self.ticks_to_ms(end - start)
        }
    }

    /// Delta in milliseconds with sign following direction; zero when either
    /// endpoint is unknown or the endpoints coincide.
    pub fn delta_signed_ms(&self, start: u64, end: u64) -> f64 {
        if start == 0 || end == 0 || start == end {
            return 0.0;
        }
        if end > start {
            self.ticks_to_ms(end - start)
        } else {
            -self.ticks_to_ms(start - end)
        }
    }

    /// Seconds elapsed between the session start and `timestamp` (signed).
    pub fn seconds_since_start(&self, timestamp: u64) -> f64 {
        self.delta_signed_ms(self.session_start, timestamp) / 1000.0
    }

    /// Converts a millisecond duration back to ticks. Used for window sizing
    /// and inactivity thresholds.
    pub fn ms_to_ticks(&self, ms: f64) -> u64 {
        if self.frequency == 0 || ms <= 0.0 {
            0
        } else {
            (ms / 1000.0 * self.frequency as f64) as u64
        }
    }
}
