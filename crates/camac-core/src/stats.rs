//! Error counters and the decaying error-rate estimate.
//!
//! Each branch, crate and slot node owns a small fixed set of counters, one
//! per error category of its scope. Recording bumps the current-period count
//! and the cumulative total; the periodic monitor folds the current count into
//! the rate estimate and starts a new period.

use std::fmt::Write as _;
use std::marker::PhantomData;

/// Category enumeration of one statistics scope.
pub trait CounterKind: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    /// Every category of this scope, in report order.
    const ALL: &'static [Self];

    /// Position of the category within [`CounterKind::ALL`].
    fn index(self) -> usize;

    /// Label printed in reports.
    fn label(self) -> &'static str;
}

/// Branch-scope error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchErrorKind {
    /// Highway driver not ready
    NotReady,
    /// Controller timed out
    HardwareTimeout,
    /// Longitudinal parity error
    LongitudinalParity,
    /// Transverse parity error
    TransverseParity,
    /// Serial highway lost synch
    LostSync,
}

impl CounterKind for BranchErrorKind {
    const ALL: &'static [Self] = &[
        Self::NotReady,
        Self::HardwareTimeout,
        Self::LongitudinalParity,
        Self::TransverseParity,
        Self::LostSync,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            Self::NotReady => "Driver Not Ready",
            Self::HardwareTimeout => "Hardware Timeout",
            Self::LongitudinalParity => "Longitudinal Parity",
            Self::TransverseParity => "Transverse Parity",
            Self::LostSync => "Lost Synch",
        }
    }
}

/// Crate-scope error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrateErrorKind {
    /// Crate controller error
    ControllerError,
    /// Crate does not respond
    NotPresent,
    /// Crate is off-line
    Offline,
    /// Crate is bypassed
    Bypassed,
}

impl CounterKind for CrateErrorKind {
    const ALL: &'static [Self] = &[
        Self::ControllerError,
        Self::NotPresent,
        Self::Offline,
        Self::Bypassed,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            Self::ControllerError => "Controller Error",
            Self::NotPresent => "Crate Not Present",
            Self::Offline => "Crate Off-Line",
            Self::Bypassed => "Crate In Bypass",
        }
    }
}

/// Slot-scope error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotErrorKind {
    /// A LAM fired that nobody claimed
    UnexpectedLam,
    /// Module did not respond
    NoX,
    /// Repeat-until-Q ran out of retries
    WaitForQTimeout,
}

impl CounterKind for SlotErrorKind {
    const ALL: &'static [Self] = &[Self::UnexpectedLam, Self::NoX, Self::WaitForQTimeout];

    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            Self::UnexpectedLam => "Unexpected LAM",
            Self::NoX => "No X Response",
            Self::WaitForQTimeout => "Wait-for-Q Timeout",
        }
    }
}

/// Error category together with the scope it is recorded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Counted on the branch
    Branch(BranchErrorKind),
    /// Counted on the crate
    Crate(CrateErrorKind),
    /// Counted on the slot
    Slot(SlotErrorKind),
}

/// Parameters of the rate estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayPolicy {
    /// Weight of the previous rate, 0 < decay < 1
    pub decay: f64,
    /// Rates below this are reported as zero
    pub threshold: f64,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            decay: 0.6,
            threshold: 0.005,
        }
    }
}

/// One (scope, category) counter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorCounter {
    /// Errors seen in the current period
    pub current: u64,
    /// Errors seen since start-up
    pub total: u64,
    /// Decayed errors-per-period estimate
    pub rate: f64,
}

impl ErrorCounter {
    /// Count one error. Saturates instead of wrapping.
    pub fn record(&mut self) {
        self.current = self.current.saturating_add(1);
        self.total = self.total.saturating_add(1);
    }

    /// Fold the current period into the rate and start a new period.
    ///
    /// A burst is reported at full height immediately; quiet periods pull the
    /// estimate down geometrically.
    pub fn decay(&mut self, policy: DecayPolicy) {
        let count = self.current as f64;
        if count > self.rate {
            self.rate = count;
        } else {
            self.rate = self.rate * policy.decay + count * (1.0 - policy.decay);
        }
        if self.rate < policy.threshold {
            self.rate = 0.0;
        }
        self.current = 0;
    }
}

/// Counter block for one node.
#[derive(Debug, Clone)]
pub struct ErrorCounters<K> {
    counters: Vec<ErrorCounter>,
    _kind: PhantomData<K>,
}

impl<K: CounterKind> Default for ErrorCounters<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CounterKind> ErrorCounters<K> {
    /// All counters zeroed.
    pub fn new() -> Self {
        Self {
            counters: vec![ErrorCounter::default(); K::ALL.len()],
            _kind: PhantomData,
        }
    }

    /// Count one error of `kind`.
    pub fn record(&mut self, kind: K) {
        if let Some(counter) = self.counters.get_mut(kind.index()) {
            counter.record();
        }
    }

    /// Snapshot of one counter.
    pub fn get(&self, kind: K) -> ErrorCounter {
        self.counters.get(kind.index()).copied().unwrap_or_default()
    }

    /// Run one monitor period over every counter.
    pub fn decay_all(&mut self, policy: DecayPolicy) {
        for counter in &mut self.counters {
            counter.decay(policy);
        }
    }

    /// Check whether any category has ever fired.
    pub fn any_fired(&self) -> bool {
        self.counters.iter().any(|c| c.total > 0)
    }

    /// Number of categories that have ever fired.
    pub fn fired_count(&self) -> usize {
        self.counters.iter().filter(|c| c.total > 0).count()
    }

    /// Iterate categories with their counters.
    pub fn iter(&self) -> impl Iterator<Item = (K, ErrorCounter)> + '_ {
        K::ALL.iter().map(move |kind| (*kind, self.get(*kind)))
    }

    /// Append one report line per category that has fired.
    pub fn render(&self, out: &mut String) {
        for (kind, counter) in self.iter().filter(|(_, c)| c.total > 0) {
            write_counter_line(out, kind.label(), &counter);
        }
    }
}

const TOTAL_WIDTH: usize = 13;
const RATE_WIDTH: usize = 15;

pub(crate) fn write_counter_line(out: &mut String, label: &str, counter: &ErrorCounter) {
    let total = counter.total.to_string();
    let total = if total.len() > TOTAL_WIDTH {
        "*".repeat(TOTAL_WIDTH)
    } else {
        total
    };
    let rate = format!("{:.2}", counter.rate);
    let rate = if rate.len() > RATE_WIDTH {
        "*".repeat(RATE_WIDTH)
    } else {
        rate
    };
    let _ = writeln!(
        out,
        "  {:<20} {:>tw$} (total){:>rw$} (rate)",
        label,
        total,
        rate,
        tw = TOTAL_WIDTH,
        rw = RATE_WIDTH
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_saturates() {
        let mut counter = ErrorCounter {
            current: u64::MAX,
            total: u64::MAX - 1,
            rate: 0.0,
        };
        counter.record();
        counter.record();
        assert_eq!(counter.current, u64::MAX);
        assert_eq!(counter.total, u64::MAX);
    }

    #[test]
    fn test_burst_reported_immediately() {
        let mut counter = ErrorCounter::default();
        for _ in 0..10 {
            counter.record();
        }
        counter.decay(DecayPolicy::default());
        assert_eq!(counter.rate, 10.0);
        assert_eq!(counter.current, 0);
        assert_eq!(counter.total, 10);
    }

    #[test]
    fn test_rate_converges_without_overshoot() {
        let policy = DecayPolicy::default();
        let mut counter = ErrorCounter {
            rate: 20.0,
            ..Default::default()
        };
        let mut previous = counter.rate;
        for _ in 0..60 {
            for _ in 0..4 {
                counter.record();
            }
            counter.decay(policy);
            assert!(counter.rate <= previous.max(4.0) + f64::EPSILON);
            assert!(counter.rate >= 4.0);
            previous = counter.rate;
        }
        assert!((counter.rate - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_rate_rises_to_sustained_level() {
        let policy = DecayPolicy::default();
        let mut counter = ErrorCounter::default();
        for _ in 0..10 {
            for _ in 0..3 {
                counter.record();
            }
            counter.decay(policy);
            assert!(counter.rate <= 3.0 + 1e-9);
        }
        assert!((counter.rate - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_rates_snap_to_zero() {
        let policy = DecayPolicy::default();
        let mut counter = ErrorCounter::default();
        counter.record();
        counter.decay(policy);
        let mut periods = 0;
        while counter.rate > 0.0 {
            counter.decay(policy);
            periods += 1;
            assert!(periods < 100, "rate never reached zero");
        }
        assert_eq!(counter.total, 1);
    }

    #[test]
    fn test_render_skips_quiet_categories() {
        let mut block = ErrorCounters::<SlotErrorKind>::new();
        assert!(!block.any_fired());
        block.record(SlotErrorKind::NoX);
        block.record(SlotErrorKind::NoX);
        let mut out = String::new();
        block.render(&mut out);
        assert_eq!(
            out,
            "  No X Response                    2 (total)           0.00 (rate)\n"
        );
        assert!(!out.contains("Unexpected LAM"));
    }

    #[test]
    fn test_render_overflow_prints_asterisks() {
        let counter = ErrorCounter {
            current: 0,
            total: u64::MAX,
            rate: 1e20,
        };
        let mut out = String::new();
        write_counter_line(&mut out, "Hardware Timeout", &counter);
        assert!(out.contains(&"*".repeat(13)));
        assert!(out.contains(&"*".repeat(15)));
    }
}
