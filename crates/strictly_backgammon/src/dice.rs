//! Dice values and the sources that produce them.

use crate::RuleError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::instrument;

/// A roll of two dice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dice {
    first: u8,
    second: u8,
}

impl Dice {
    /// Creates a roll, rejecting values outside 1-6.
    pub fn new(first: u8, second: u8) -> Result<Self, RuleError> {
        for value in [first, second] {
            if !(1..=6).contains(&value) {
                return Err(RuleError::InvalidDie(value));
            }
        }
        Ok(Self { first, second })
    }

    /// Both face values in roll order.
    pub fn values(&self) -> (u8, u8) {
        (self.first, self.second)
    }

    /// True for a double.
    pub fn is_doubles(&self) -> bool {
        self.first == self.second
    }

    /// Die values available to play, largest first.
    pub fn moves(&self) -> Vec<u8> {
        if self.is_doubles() {
            vec![self.first; 4]
        } else {
            let mut moves = vec![self.first, self.second];
            moves.sort_unstable_by(|a, b| b.cmp(a));
            moves
        }
    }
}

impl std::fmt::Display for Dice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.first, self.second)
    }
}

/// A source of dice rolls.
///
/// The engine never owns a roller; callers pass one to
/// [`RuleEngine::roll_dice`](crate::RuleEngine::roll_dice) so the engine
/// stays cloneable and deterministic.
pub trait DiceRoller: Send + Sync {
    /// Produces the next roll.
    fn roll(&mut self) -> Dice;
}

/// Uniformly random dice.
#[derive(Debug)]
pub struct RandomDice {
    rng: StdRng,
}

impl RandomDice {
    /// Seeds from operating-system entropy.
    #[instrument]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible sequence from a fixed seed.
    #[instrument]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomDice {
    fn default() -> Self {
        Self::new()
    }
}

impl DiceRoller for RandomDice {
    fn roll(&mut self) -> Dice {
        Dice {
            first: self.rng.gen_range(1..=6),
            second: self.rng.gen_range(1..=6),
        }
    }
}

/// A scripted sequence of rolls that repeats once exhausted.
#[derive(Debug, Clone)]
pub struct FixedDice {
    script: Vec<Dice>,
    pending: VecDeque<Dice>,
}

impl FixedDice {
    /// Creates a roller from `(first, second)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidDie`] for values outside 1-6, or for an
    /// empty script.
    pub fn new(rolls: &[(u8, u8)]) -> Result<Self, RuleError> {
        let script = rolls
            .iter()
            .map(|(a, b)| Dice::new(*a, *b))
            .collect::<Result<Vec<_>, _>>()?;
        if script.is_empty() {
            return Err(RuleError::InvalidDie(0));
        }
        Ok(Self {
            pending: script.iter().copied().collect(),
            script,
        })
    }
}

impl DiceRoller for FixedDice {
    fn roll(&mut self) -> Dice {
        if self.pending.is_empty() {
            self.pending = self.script.iter().copied().collect();
        }
        // Refilled above from a non-empty script.
        self.pending.pop_front().unwrap_or(self.script[0])
    }
}
