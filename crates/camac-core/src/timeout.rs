//! Conversion of wait timeouts into host clock ticks.

use crate::error::{CamacError, Result};
use std::time::Duration;

/// Timeout value meaning "wait forever". Zero means the same thing.
pub const WAIT_FOREVER: i64 = -1;

/// How long a LAM wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDeadline {
    /// Block until the LAM fires
    Forever,
    /// Block for at most this many clock ticks
    Ticks(u64),
}

/// Wait-timeout bounds calibrated from the host clock rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBounds {
    tick_rate_hz: u32,
    min_timeout_ms: i64,
    max_timeout_ms: i64,
}

impl TimeoutBounds {
    /// Calibrate against a clock running at `tick_rate_hz`.
    ///
    /// The maximum is the largest millisecond value whose tick count still
    /// fits a signed 32-bit tick counter; the minimum is one tick, rounded.
    pub fn calibrate(tick_rate_hz: u32) -> Self {
        let rate = i64::from(tick_rate_hz.max(1));
        Self {
            tick_rate_hz: tick_rate_hz.max(1),
            min_timeout_ms: (1000 + rate / 2) / rate,
            max_timeout_ms: i64::from(i32::MAX) / rate,
        }
    }

    /// Clock rate the bounds were calibrated for.
    pub fn tick_rate_hz(&self) -> u32 {
        self.tick_rate_hz
    }

    /// Smallest timeout honoured; shorter ones are clamped up to it.
    pub fn min_timeout_ms(&self) -> i64 {
        self.min_timeout_ms
    }

    /// Largest timeout accepted.
    pub fn max_timeout_ms(&self) -> i64 {
        self.max_timeout_ms
    }

    /// Convert a caller timeout into a deadline.
    pub fn deadline(&self, timeout_ms: i64) -> Result<WaitDeadline> {
        if timeout_ms == 0 || timeout_ms == WAIT_FOREVER {
            return Ok(WaitDeadline::Forever);
        }
        if timeout_ms < self.min_timeout_ms {
            return Ok(WaitDeadline::Ticks(self.ms_to_ticks(self.min_timeout_ms)));
        }
        if timeout_ms <= self.max_timeout_ms {
            return Ok(WaitDeadline::Ticks(self.ms_to_ticks(timeout_ms)));
        }
        Err(CamacError::BadTimeout(timeout_ms))
    }

    /// Wall-clock length of a tick count.
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(self.tick_rate_hz);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Wall-clock length of a deadline; `None` for an unbounded wait.
    pub fn duration(&self, deadline: WaitDeadline) -> Option<Duration> {
        match deadline {
            WaitDeadline::Forever => None,
            WaitDeadline::Ticks(ticks) => Some(self.ticks_to_duration(ticks)),
        }
    }

    // Always rounds up by one tick so a wait is never shorter than requested.
    fn ms_to_ticks(&self, ms: i64) -> u64 {
        let ms = u64::try_from(ms).unwrap_or(0);
        ms * u64::from(self.tick_rate_hz) / 1000 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_at_60hz() {
        let bounds = TimeoutBounds::calibrate(60);
        assert_eq!(bounds.min_timeout_ms(), 17);
        assert_eq!(bounds.max_timeout_ms(), 35_791_394);
    }

    #[test]
    fn test_forever() {
        let bounds = TimeoutBounds::calibrate(60);
        assert_eq!(bounds.deadline(0), Ok(WaitDeadline::Forever));
        assert_eq!(bounds.deadline(WAIT_FOREVER), Ok(WaitDeadline::Forever));
        assert_eq!(bounds.duration(WaitDeadline::Forever), None);
    }

    #[test]
    fn test_clamping_and_rejection() {
        let bounds = TimeoutBounds::calibrate(60);
        let min_ticks = bounds.deadline(bounds.min_timeout_ms()).unwrap();
        for short in [1, 5, 16, -7] {
            assert_eq!(bounds.deadline(short).unwrap(), min_ticks, "timeout {short}");
        }
        assert_eq!(bounds.deadline(100), Ok(WaitDeadline::Ticks(7)));
        assert!(bounds.deadline(bounds.max_timeout_ms()).is_ok());
        assert_eq!(
            bounds.deadline(bounds.max_timeout_ms() + 1),
            Err(CamacError::BadTimeout(bounds.max_timeout_ms() + 1))
        );
    }

    #[test]
    fn test_every_input_is_classified() {
        let bounds = TimeoutBounds::calibrate(1000);
        for ms in [-100, -1, 0, 1, 999, 1000, 2_147_483, 2_147_484, i64::MAX] {
            match bounds.deadline(ms) {
                Ok(WaitDeadline::Forever) => assert!(ms == 0 || ms == WAIT_FOREVER),
                Ok(WaitDeadline::Ticks(ticks)) => {
                    let dur = bounds.ticks_to_duration(ticks);
                    assert!(dur >= Duration::from_millis(bounds.min_timeout_ms() as u64));
                    assert!(ms <= bounds.max_timeout_ms());
                }
                Err(err) => {
                    assert_eq!(err, CamacError::BadTimeout(ms));
                    assert!(ms > bounds.max_timeout_ms());
                }
            }
        }
    }

    #[test]
    fn test_ticks_to_duration() {
        let bounds = TimeoutBounds::calibrate(100);
        assert_eq!(bounds.ticks_to_duration(50), Duration::from_millis(500));
    }
}
