//! Strictly Backgammon - a deterministic backgammon rule engine.
//!
//! The engine knows nothing about networking, storage or time. It owns one
//! game's board, dice, doubling cube and the current turn's move history,
//! and answers three questions: what is legal, what happens when a legal
//! move is played, and who won.
//!
//! # Example
//!
//! ```
//! use strictly_backgammon::{Color, FixedDice, RuleEngine};
//!
//! let mut engine = RuleEngine::new();
//! let mut dice = FixedDice::new(&[(3, 1)]).unwrap();
//! engine.roll_dice(&mut dice).unwrap();
//! engine.execute_notation("8/5").unwrap();
//! engine.execute_notation("6/5").unwrap();
//! engine.end_turn().unwrap();
//! assert_eq!(engine.current_player(), Color::Red);
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cube;
mod dice;
mod engine;
mod error;
mod generator;
mod invariants;
mod moves;
pub mod notation;
mod position_id;
mod types;

pub use cube::{DEFAULT_MAX_CUBE, DoublingCube, PendingOffer};
pub use dice::{Dice, DiceRoller, FixedDice, RandomDice};
pub use engine::{
    BoardView, EndReason, EngineSnapshot, GameResult, RuleEngine, TurnRecord, WinType,
};
pub use error::RuleError;
pub use generator::legal_moves;
pub use invariants::{
    BackgammonInvariants, CheckerConservationInvariant, CubePowerOfTwoInvariant,
    HomogeneousPointsInvariant, Invariant, InvariantSet, InvariantViolation,
};
pub use moves::{AppliedMove, Move};
pub use position_id::position_id;
pub use types::{BAR, Board, CHECKERS_PER_SIDE, Color, Leg, OFF, Player, Stack};
