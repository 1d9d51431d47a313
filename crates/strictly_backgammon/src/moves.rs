//! First-class move types.
//!
//! A [`Move`] is a candidate play produced by the generator; it carries
//! enough to be replayed but is only trusted after being matched against the
//! current legal set. An [`AppliedMove`] is what the engine records once a
//! move has actually mutated the board.

use crate::types::{Leg, OFF};
use crate::notation;
use serde::{Deserialize, Serialize};

/// A legal (or requested) checker play.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Move {
    /// Source point, [`BAR`](crate::BAR) for entry.
    pub from: u8,
    /// Destination point, [`OFF`] for bearing off.
    pub to: u8,
    /// Total pips consumed: the die for simple moves, the sum for combined.
    pub die_value: u8,
    /// Dice consumed, in the order the legs are played.
    pub dice_used: Vec<u8>,
    /// Landing points between `from` and `to` for combined moves.
    pub intermediate_points: Vec<u8>,
    /// Whether any leg hits a blot.
    pub is_hit: bool,
    /// True when more than one die is consumed.
    pub is_combined: bool,
}

impl Move {
    /// Builds a move from the legs that realize it.
    pub(crate) fn from_legs(legs: &[Leg]) -> Self {
        let from = legs.first().map(|l| l.from).unwrap_or_default();
        let to = legs.last().map(|l| l.to).unwrap_or_default();
        let dice_used: Vec<u8> = legs.iter().map(|l| l.die).collect();
        let intermediate_points = legs
            .iter()
            .take(legs.len().saturating_sub(1))
            .map(|l| l.to)
            .collect();
        Self {
            from,
            to,
            die_value: dice_used.iter().sum(),
            is_combined: dice_used.len() > 1,
            dice_used,
            intermediate_points,
            is_hit: legs.iter().any(|l| l.hit),
        }
    }

    /// A request naming only source, destination and optionally the die.
    ///
    /// The engine resolves it against the legal set; `die` of `None`
    /// accepts whichever legal move connects the two points.
    pub fn request(from: u8, to: u8, die: Option<u8>) -> Self {
        let die_value = die.unwrap_or_default();
        Self {
            from,
            to,
            die_value,
            dice_used: die.into_iter().collect(),
            intermediate_points: Vec::new(),
            is_hit: false,
            is_combined: false,
        }
    }

    /// Whether this move bears a checker off.
    pub fn is_bear_off(&self) -> bool {
        self.to == OFF
    }

    /// True when `other` describes the same play, ignoring derived fields.
    pub(crate) fn same_play(&self, other: &Move) -> bool {
        self.from == other.from
            && self.to == other.to
            && self.die_value == other.die_value
            && self.is_combined == other.is_combined
    }
}

impl std::fmt::Display for Move {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut points = vec![self.from];
        points.extend(&self.intermediate_points);
        points.push(self.to);
        let text = points
            .iter()
            .map(|p| notation::point_label(*p))
            .collect::<Vec<_>>()
            .join("/");
        write!(f, "{}", text)
    }
}

/// A move as it was executed, with the concrete legs (and hits) that
/// happened. This is what undo reverses and notation serializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMove {
    mv: Move,
    legs: Vec<Leg>,
}

impl AppliedMove {
    pub(crate) fn new(mv: Move, legs: Vec<Leg>) -> Self {
        Self { mv, legs }
    }

    /// The move that was played.
    pub fn mv(&self) -> &Move {
        &self.mv
    }

    /// The legs in the order they were applied.
    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    /// Persistable notation token, e.g. `24/23*/17`.
    pub fn notation(&self) -> String {
        notation::format_legs(&self.legs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_move_sums_dice() {
        let legs = [
            Leg { from: 24, to: 21, die: 3, hit: false },
            Leg { from: 21, to: 18, die: 3, hit: true },
        ];
        let mv = Move::from_legs(&legs);
        assert_eq!(mv.from, 24);
        assert_eq!(mv.to, 18);
        assert_eq!(mv.die_value, 6);
        assert_eq!(mv.dice_used, vec![3, 3]);
        assert_eq!(mv.intermediate_points, vec![21]);
        assert!(mv.is_combined);
        assert!(mv.is_hit);
        assert_eq!(mv.to_string(), "24/21/18");
    }

    #[test]
    fn request_without_die_is_simple() {
        let mv = Move::request(13, 7, None);
        assert_eq!(mv.die_value, 0);
        assert!(mv.dice_used.is_empty());
        assert!(!mv.is_combined);
    }
}
