//! The doubling cube.

use crate::{Color, RuleError};
use serde::{Deserialize, Serialize};

/// Highest cube value unless configured otherwise.
pub const DEFAULT_MAX_CUBE: u32 = 64;

/// An outstanding double offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingOffer {
    /// Side that offered.
    pub proposer: Color,
    /// Value the cube will take if accepted.
    pub proposed_value: u32,
}

/// Cube value, ownership and any pending offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DoublingCube {
    value: u32,
    owner: Option<Color>,
    pending_offer: Option<PendingOffer>,
}

impl DoublingCube {
    /// A centred cube at 1.
    pub fn new() -> Self {
        Self {
            value: 1,
            owner: None,
            pending_offer: None,
        }
    }

    /// Current stake multiplier.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Owner, `None` while centred.
    pub fn owner(&self) -> Option<Color> {
        self.owner
    }

    /// The offer awaiting an answer, if any.
    pub fn pending_offer(&self) -> Option<PendingOffer> {
        self.pending_offer
    }

    /// Whether `color` holds cube access (centred or owned).
    pub fn is_available_to(&self, color: Color) -> bool {
        self.owner.is_none_or(|owner| owner == color)
    }

    /// Checks ownership and ceiling for an offer by `color`.
    pub(crate) fn check_offer(&self, color: Color, max_value: u32) -> Result<(), RuleError> {
        if self.pending_offer.is_some() {
            return Err(RuleError::DoublePending);
        }
        if !self.is_available_to(color) {
            return Err(RuleError::CubeNotOwned(color));
        }
        if self.value.saturating_mul(2) > max_value {
            return Err(RuleError::CubeAtMaximum(self.value));
        }
        Ok(())
    }

    pub(crate) fn offer(&mut self, proposer: Color) {
        self.pending_offer = Some(PendingOffer {
            proposer,
            proposed_value: self.value * 2,
        });
    }

    /// Takes the offer: value doubles and the acceptor owns the cube.
    pub(crate) fn accept(&mut self, acceptor: Color) -> Result<(), RuleError> {
        let offer = self.pending_offer.ok_or(RuleError::NoPendingOffer)?;
        self.value = offer.proposed_value;
        self.owner = Some(acceptor);
        self.pending_offer = None;
        Ok(())
    }

    pub(crate) fn clear_offer(&mut self) {
        self.pending_offer = None;
    }
}

impl Default for DoublingCube {
    fn default() -> Self {
        Self::new()
    }
}
