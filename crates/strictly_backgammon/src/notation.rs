//! Compact move notation used for persistence and replay.
//!
//! A token lists the points a checker visits separated by `/`: `24/18`,
//! `bar/20`, `6/off`, `24/21/18` for a combined move. A `*` follows any
//! landing that hit a blot. A bear-off with a die larger than the exact
//! distance records the die in brackets (`4/off[6]`) so replay consumes the
//! same die the original play did.

use crate::types::{BAR, Color, Leg, OFF};
use crate::{Move, RuleError};
use tracing::instrument;

/// Label for a point in notation.
pub fn point_label(point: u8) -> String {
    match point {
        BAR => "bar".to_string(),
        OFF => "off".to_string(),
        p => p.to_string(),
    }
}

/// Serializes executed legs into one token.
pub fn format_legs(legs: &[Leg]) -> String {
    let Some(first) = legs.first() else {
        return String::new();
    };
    let mut token = point_label(first.from);
    for leg in legs {
        token.push('/');
        token.push_str(&point_label(leg.to));
        if leg.hit {
            token.push('*');
        }
        let exact = leg.die == leg.from || leg.die == OFF - leg.from;
        if leg.to == OFF && !exact {
            token.push_str(&format!("[{}]", leg.die));
        }
    }
    token
}

/// One parsed landing: the point and an explicitly recorded die.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Landing {
    point: u8,
    die: Option<u8>,
}

fn parse_point(label: &str, token: &str) -> Result<u8, RuleError> {
    let invalid = || RuleError::InvalidNotation(token.to_string());
    match label.to_ascii_lowercase().as_str() {
        "bar" => Ok(BAR),
        "off" => Ok(OFF),
        digits => {
            let point: u8 = digits.parse().map_err(|_| invalid())?;
            if (1..=24).contains(&point) {
                Ok(point)
            } else {
                Err(invalid())
            }
        }
    }
}

fn parse_landing(part: &str, token: &str) -> Result<Landing, RuleError> {
    let invalid = || RuleError::InvalidNotation(token.to_string());
    let (body, die) = match part.split_once('[') {
        Some((body, rest)) => {
            let digits = rest.strip_suffix(']').ok_or_else(invalid)?;
            let die: u8 = digits.parse().map_err(|_| invalid())?;
            (body, Some(die))
        }
        None => (part, None),
    };
    let body = body.trim_end_matches('*');
    Ok(Landing {
        point: parse_point(body, token)?,
        die,
    })
}

fn pips_between(color: Color, from: u8, to: u8) -> Option<u8> {
    match color {
        Color::White => {
            let start = if from == BAR { OFF } else { from };
            start.checked_sub(to)
        }
        Color::Red => to.checked_sub(from),
    }
}

/// Parses a token into a move request for `color`.
///
/// The request carries the full route and the dice it consumes; the engine
/// still validates it against the legal set before executing.
///
/// # Errors
///
/// Returns [`RuleError::InvalidNotation`] for malformed tokens or hops that
/// do not correspond to a die value.
#[instrument]
pub fn parse(token: &str, color: Color) -> Result<Move, RuleError> {
    let invalid = || RuleError::InvalidNotation(token.to_string());
    let mut parts = token.trim().split('/');
    let from = parse_point(parts.next().ok_or_else(invalid)?, token)?;
    let landings = parts
        .map(|p| parse_landing(p, token))
        .collect::<Result<Vec<_>, _>>()?;
    if landings.is_empty() || from == OFF {
        return Err(invalid());
    }

    let mut dice_used = Vec::with_capacity(landings.len());
    let mut at = from;
    for (i, landing) in landings.iter().enumerate() {
        let is_last = i + 1 == landings.len();
        if landing.point == BAR || (landing.point == OFF && !is_last) {
            return Err(invalid());
        }
        let die = if landing.point == OFF {
            landing.die.unwrap_or_else(|| color.pips_to_off(at))
        } else {
            pips_between(color, at, landing.point).ok_or_else(invalid)?
        };
        if !(1..=6).contains(&die) {
            return Err(invalid());
        }
        dice_used.push(die);
        at = landing.point;
    }

    let intermediate_points = landings[..landings.len() - 1]
        .iter()
        .map(|l| l.point)
        .collect();
    Ok(Move {
        from,
        to: at,
        die_value: dice_used.iter().sum(),
        is_combined: dice_used.len() > 1,
        dice_used,
        intermediate_points,
        is_hit: false,
    })
}
