//! Checker conservation: fifteen checkers per side, always.

use super::Invariant;
use crate::types::CHECKERS_PER_SIDE;
use crate::{Color, RuleEngine};
use strum::IntoEnumIterator;

/// Invariant: board + bar + borne off equals fifteen for each color.
pub struct CheckerConservationInvariant;

impl Invariant<RuleEngine> for CheckerConservationInvariant {
    fn holds(engine: &RuleEngine) -> bool {
        Color::iter().all(|color| engine.board().total_checkers(color) == CHECKERS_PER_SIDE)
    }

    fn description() -> &'static str {
        "Each side has exactly 15 checkers across board, bar and tray"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Board, FixedDice};

    #[test]
    fn holds_after_a_turn() {
        let mut engine = RuleEngine::new();
        let mut dice = FixedDice::new(&[(6, 5), (6, 1)]).unwrap();
        engine.roll_dice(&mut dice).unwrap();
        engine.execute_notation("24/18/13").unwrap();
        engine.end_turn().unwrap();
        assert!(CheckerConservationInvariant::holds(&engine));
    }

    #[test]
    fn extra_checker_violates() {
        let mut board = Board::opening();
        board.set_bar(Color::Red, 1);
        let engine = RuleEngine::from_position(board, Color::White);
        assert!(!CheckerConservationInvariant::holds(&engine));
    }
}
