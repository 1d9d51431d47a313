//! Cube value stays a power of two within the ceiling.

use super::Invariant;
use crate::RuleEngine;

/// Invariant: cube value is 1, 2, 4, ... and any pending offer is exactly
/// double the current value.
pub struct CubePowerOfTwoInvariant;

impl Invariant<RuleEngine> for CubePowerOfTwoInvariant {
    fn holds(engine: &RuleEngine) -> bool {
        let cube = engine.cube();
        let value_ok = cube.value().is_power_of_two();
        let offer_ok = cube
            .pending_offer()
            .is_none_or(|offer| offer.proposed_value == cube.value() * 2);
        value_ok && offer_ok
    }

    fn description() -> &'static str {
        "Cube value is a power of two and offers double it"
    }
}
