//! Rule rejections raised by the engine.
//!
//! Every variant leaves the engine untouched: validation always precedes
//! mutation.

use crate::Color;
use derive_more::Display;

/// Reason a rule-engine operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RuleError {
    /// The game already has a result.
    #[display("Game is already over")]
    GameOver,

    /// Dice were already rolled this turn.
    #[display("Turn not ready: dice already rolled this turn")]
    TurnNotReady,

    /// A move or turn end was attempted before rolling.
    #[display("Dice have not been rolled")]
    DiceNotRolled,

    /// A double offer must be answered first.
    #[display("A double offer is pending")]
    DoublePending,

    /// The requested move is not among the current legal moves.
    #[display("Illegal move {}/{}", from, to)]
    IllegalMove {
        /// Source point.
        from: u8,
        /// Destination point.
        to: u8,
    },

    /// Undo requested with an empty move history.
    #[display("Nothing to undo")]
    NothingToUndo,

    /// Turn end requested while playable dice remain.
    #[display("Playable dice remain")]
    MovesRemaining,

    /// The acting color may not perform this action now.
    #[display("Not {}'s turn", _0)]
    WrongPlayer(Color),

    /// The cube is disabled during the Crawford game.
    #[display("Doubling is disabled in the Crawford game")]
    CrawfordGame,

    /// The opponent owns the cube.
    #[display("{} does not have access to the cube", _0)]
    CubeNotOwned(Color),

    /// The cube cannot be raised further.
    #[display("Cube is already at its maximum value {}", _0)]
    CubeAtMaximum(u32),

    /// Doubling is only allowed before rolling.
    #[display("Doubling is only allowed before rolling")]
    DoubleAfterRoll,

    /// Accept or decline without an outstanding offer.
    #[display("No double has been offered")]
    NoPendingOffer,

    /// A die value outside 1-6.
    #[display("Invalid die value {}", _0)]
    InvalidDie(u8),

    /// A move-notation token that does not parse.
    #[display("Invalid move notation '{}'", _0)]
    InvalidNotation(String),

    /// A snapshot whose replayed history disagrees with its stored board.
    #[display("Snapshot does not replay: {}", _0)]
    SnapshotMismatch(String),
}

impl RuleError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        self.into()
    }
}

impl std::error::Error for RuleError {}
