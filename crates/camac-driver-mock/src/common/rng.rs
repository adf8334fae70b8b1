//! Seeded random source behind the random-failure rate of [`FaultConfig`].
//!
//! [`FaultConfig`]: super::FaultConfig

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Random failure decisions, reproducible when seeded.
pub struct FaultRng {
    rng: Mutex<ChaCha8Rng>,
    seeded: bool,
}

impl FaultRng {
    /// Seeded source, or one drawn from OS entropy for `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        Self {
            rng: Mutex::new(rng),
            seeded: seed.is_some(),
        }
    }

    /// Whether this source replays the same decisions on every run.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Roll for one cycle. `rate` is clamped to `[0, 1]`; the extremes never
    /// consume randomness, so a fixed rate of 0 or 1 leaves the sequence alone.
    pub fn roll(&self, rate: f64) -> bool {
        match rate {
            r if r.is_nan() || r <= 0.0 => false,
            r if r >= 1.0 => true,
            r => self.rng.lock().gen_bool(r),
        }
    }
}

impl Default for FaultRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for FaultRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultRng").field("seeded", &self.seeded).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(rng: &FaultRng) -> Vec<bool> {
        (0..64).map(|_| rng.roll(0.5)).collect()
    }

    #[test]
    fn test_same_seed_same_failures() {
        let a = FaultRng::new(Some(42));
        let b = FaultRng::new(Some(42));
        assert!(a.is_seeded());
        assert_eq!(pattern(&a), pattern(&b));
    }

    #[test]
    fn test_extreme_rates_leave_sequence_alone() {
        let a = FaultRng::new(Some(9));
        let b = FaultRng::new(Some(9));
        for _ in 0..10 {
            assert!(!a.roll(0.0));
            assert!(!a.roll(f64::NAN));
            assert!(a.roll(1.0));
            assert!(a.roll(7.5));
        }
        assert_eq!(pattern(&a), pattern(&b));
    }

    #[test]
    fn test_rate_is_respected() {
        let rng = FaultRng::new(Some(42));
        let failures = (0..10_000).filter(|_| rng.roll(0.3)).count();
        assert!((2700..3300).contains(&failures), "got {failures} failures");
    }

    #[test]
    fn test_unseeded() {
        assert!(!FaultRng::default().is_seeded());
    }
}
