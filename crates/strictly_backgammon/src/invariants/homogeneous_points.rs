//! Homogeneous points: a triangle holds one color or nothing.

use super::Invariant;
use crate::RuleEngine;

/// Invariant: a point has a color iff it has checkers.
pub struct HomogeneousPointsInvariant;

impl Invariant<RuleEngine> for HomogeneousPointsInvariant {
    fn holds(engine: &RuleEngine) -> bool {
        (1..=24u8).all(|point| {
            let stack = engine.board().stack(point);
            stack.color().is_some() == (stack.count() > 0)
        })
    }

    fn description() -> &'static str {
        "Every occupied point holds checkers of a single color"
    }
}
