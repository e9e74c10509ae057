//! Single source of randomness for every probabilistic branch in the engine.
//!
//! Routing, curiosity gating and chain continuation all draw through a
//! [`Dice`] so a fixed seed reproduces a whole conversation.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait Dice: Send + Sync {
    /// Uniform draw in `[0, 1)`.
    fn roll(&self) -> f64;

    /// True with probability `p` (clamped to `[0, 1]`). `p <= 0` never passes,
    /// `p >= 1` always does.
    fn chance(&self, p: f64) -> bool {
        let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.roll() < p
    }

    /// Weighted index pick. Non-positive and non-finite weights are never
    /// chosen; returns `None` when nothing is eligible.
    fn pick_weighted(&self, weights: &[f64]) -> Option<usize> {
        let total: f64 = weights
            .iter()
            .filter(|w| w.is_finite() && **w > 0.0)
            .sum();
        if total <= 0.0 {
            return None;
        }
        let mut target = self.roll() * total;
        let mut last_eligible = None;
        for (index, weight) in weights.iter().enumerate() {
            if !weight.is_finite() || *weight <= 0.0 {
                continue;
            }
            last_eligible = Some(index);
            if target < *weight {
                return Some(index);
            }
            target -= weight;
        }
        last_eligible
    }
}

/// `StdRng` behind a lock; deterministic when built from a seed.
pub struct SeededDice {
    rng: Mutex<StdRng>,
}

impl SeededDice {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn from_optional_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => {
                tracing::info!("Decision dice seeded with {}", seed);
                Self::from_seed(seed)
            }
            None => Self::from_entropy(),
        }
    }
}

impl Dice for SeededDice {
    fn roll(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

/// Always rolls the same value. `FixedDice(0.0)` passes every non-zero
/// chance, `FixedDice(0.999)` fails everything short of certainty.
#[derive(Debug, Clone, Copy)]
pub struct FixedDice(pub f64);

impl Dice for FixedDice {
    fn roll(&self) -> f64 {
        self.0.clamp(0.0, 0.999_999)
    }
}
