//! Core domain types for backgammon: colors, points and the board.
//!
//! Points are absolute: 1-24 are the triangles, [`BAR`] (0) and [`OFF`] (25)
//! are the two off-board positions. White moves from 24 towards 1 and bears
//! off below 1; Red moves from 1 towards 24 and bears off above 24.

use serde::{Deserialize, Serialize};

/// The bar, where hit checkers wait to re-enter.
pub const BAR: u8 = 0;

/// The borne-off tray.
pub const OFF: u8 = 25;

/// Checkers each side starts with.
pub const CHECKERS_PER_SIDE: u8 = 15;

/// A side of the board.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Moves 24 → 1, home board 1-6. Opens the game.
    White,
    /// Moves 1 → 24, home board 19-24.
    Red,
}

impl Color {
    /// Returns the opposing color.
    pub fn opponent(self) -> Self {
        match self {
            Color::White => Color::Red,
            Color::Red => Color::White,
        }
    }

    /// Index into per-color arrays.
    pub(crate) fn index(self) -> usize {
        match self {
            Color::White => 0,
            Color::Red => 1,
        }
    }

    /// Point reached by moving `pips` from `from`, or `None` when the move
    /// would leave the board past the home edge. `from` may be [`BAR`].
    pub fn advance(self, from: u8, pips: u8) -> Option<u8> {
        match self {
            Color::White => {
                let start = if from == BAR { OFF } else { from };
                start.checked_sub(pips).filter(|p| *p >= 1)
            }
            Color::Red => {
                let target = from.saturating_add(pips);
                (target <= 24).then_some(target)
            }
        }
    }

    /// Pips a checker on `point` must travel to be borne off.
    pub fn pips_to_off(self, point: u8) -> u8 {
        match self {
            Color::White => point,
            Color::Red => OFF - point,
        }
    }

    /// Converts an absolute point into this color's own numbering, where 1
    /// is its ace point and 24 its back point. Bar and off are unchanged.
    pub fn perspective(self, point: u8) -> u8 {
        match (self, point) {
            (_, BAR) | (_, OFF) => point,
            (Color::White, p) => p,
            (Color::Red, p) => OFF - p,
        }
    }

    /// Whether `point` lies in this color's home board.
    pub fn is_home(self, point: u8) -> bool {
        (1..=24).contains(&point) && self.pips_to_off(point) <= 6
    }

    /// Triangles ordered from this color's back point to its ace point.
    pub fn points_back_to_front(self) -> impl Iterator<Item = u8> {
        (1..=24u8).rev().map(move |p| self.perspective(p))
    }
}

/// A homogeneous stack of checkers on one triangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stack {
    color: Option<Color>,
    count: u8,
}

impl Stack {
    /// Owner of the stack, `None` when empty.
    pub fn color(&self) -> Option<Color> {
        self.color
    }

    /// Number of checkers.
    pub fn count(&self) -> u8 {
        self.count
    }

    /// True when the point holds at least one checker of `color`.
    pub fn is_owned_by(&self, color: Color) -> bool {
        self.count > 0 && self.color == Some(color)
    }
}

/// Per-side checker accounting that is not on the triangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Player {
    color: Color,
    checkers_on_bar: u8,
    checkers_borne_off: u8,
}

impl Player {
    fn new(color: Color) -> Self {
        Self {
            color,
            checkers_on_bar: 0,
            checkers_borne_off: 0,
        }
    }

    /// The side this record describes.
    pub fn color(&self) -> Color {
        self.color
    }

    /// Checkers waiting on the bar.
    pub fn checkers_on_bar(&self) -> u8 {
        self.checkers_on_bar
    }

    /// Checkers already borne off.
    pub fn checkers_borne_off(&self) -> u8 {
        self.checkers_borne_off
    }
}

/// One hop of a checker, the unit the board actually mutates by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Leg {
    /// Source point or [`BAR`].
    pub from: u8,
    /// Destination point or [`OFF`].
    pub to: u8,
    /// Die consumed.
    pub die: u8,
    /// Whether an opposing blot was sent to the bar.
    pub hit: bool,
}

/// The 26-position backgammon board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Board {
    points: [Stack; 24],
    players: [Player; 2],
}

impl Board {
    /// A board with no checkers anywhere. Useful for building positions.
    pub fn empty() -> Self {
        Self {
            points: [Stack::default(); 24],
            players: [Player::new(Color::White), Player::new(Color::Red)],
        }
    }

    /// The standard opening position.
    pub fn opening() -> Self {
        let mut board = Self::empty();
        for color in [Color::White, Color::Red] {
            for (own_point, count) in [(24, 2), (13, 5), (8, 3), (6, 5)] {
                board.set_point(color.perspective(own_point), color, count);
            }
        }
        board
    }

    /// Stack on a triangle (1-24). Off-board positions read as empty.
    pub fn stack(&self, point: u8) -> Stack {
        match point {
            1..=24 => self.points[usize::from(point - 1)],
            _ => Stack::default(),
        }
    }

    /// Bar and borne-off accounting for one side.
    pub fn player(&self, color: Color) -> &Player {
        &self.players[color.index()]
    }

    /// Checkers of `color` at `point`, where [`BAR`] and [`OFF`] read the
    /// player's bar and tray.
    pub fn count(&self, color: Color, point: u8) -> u8 {
        match point {
            BAR => self.player(color).checkers_on_bar,
            OFF => self.player(color).checkers_borne_off,
            p => {
                let stack = self.stack(p);
                if stack.is_owned_by(color) { stack.count } else { 0 }
            }
        }
    }

    /// Replaces the stack on a triangle. A zero count empties the point.
    pub fn set_point(&mut self, point: u8, color: Color, count: u8) {
        if let 1..=24 = point {
            self.points[usize::from(point - 1)] = Stack {
                color: (count > 0).then_some(color),
                count,
            };
        }
    }

    /// Sets how many checkers of `color` wait on the bar.
    pub fn set_bar(&mut self, color: Color, count: u8) {
        self.players[color.index()].checkers_on_bar = count;
    }

    /// Sets how many checkers of `color` are borne off.
    pub fn set_borne_off(&mut self, color: Color, count: u8) {
        self.players[color.index()].checkers_borne_off = count;
    }

    /// Checkers of `color` on the triangles.
    pub fn checkers_on_board(&self, color: Color) -> u8 {
        self.points
            .iter()
            .filter(|s| s.is_owned_by(color))
            .map(|s| s.count)
            .sum()
    }

    /// Board + bar + borne off for `color`. Always 15 on a legal board.
    pub fn total_checkers(&self, color: Color) -> u8 {
        let player = self.player(color);
        self.checkers_on_board(color) + player.checkers_on_bar + player.checkers_borne_off
    }

    /// Whether `color` may land on `point`: empty, own, or a single blot.
    pub fn is_open_for(&self, color: Color, point: u8) -> bool {
        let stack = self.stack(point);
        stack.count <= 1 || stack.color == Some(color)
    }

    /// Whether `point` holds exactly one opposing checker.
    pub fn is_blot_against(&self, color: Color, point: u8) -> bool {
        let stack = self.stack(point);
        stack.count == 1 && stack.color == Some(color.opponent())
    }

    /// True once every checker of `color` is in its home board or off.
    pub fn all_home(&self, color: Color) -> bool {
        self.player(color).checkers_on_bar == 0
            && (1..=24u8)
                .filter(|p| self.stack(*p).is_owned_by(color))
                .all(|p| color.is_home(p))
    }

    /// The occupied point of `color` farthest from bearing off.
    pub fn farthest_point(&self, color: Color) -> Option<u8> {
        color
            .points_back_to_front()
            .find(|p| self.stack(*p).is_owned_by(color))
    }

    /// Moves one checker along `leg`, returning whether it hit a blot.
    ///
    /// The caller guarantees legality; the generator is the only producer of
    /// legs that reach this point.
    pub(crate) fn apply_leg(&mut self, color: Color, from: u8, to: u8) -> bool {
        self.remove_checker(color, from);

        if to == OFF {
            self.players[color.index()].checkers_borne_off += 1;
            return false;
        }

        let hit = self.is_blot_against(color, to);
        if hit {
            self.set_point(to, color, 0);
            self.players[color.opponent().index()].checkers_on_bar += 1;
        }
        let count = self.count(color, to);
        self.set_point(to, color, count + 1);
        hit
    }

    /// Exact inverse of [`Board::apply_leg`].
    pub(crate) fn revert_leg(&mut self, color: Color, leg: &Leg) {
        if leg.to == OFF {
            self.players[color.index()].checkers_borne_off -= 1;
        } else {
            let count = self.count(color, leg.to);
            self.set_point(leg.to, color, count - 1);
            if leg.hit {
                self.players[color.opponent().index()].checkers_on_bar -= 1;
                self.set_point(leg.to, color.opponent(), 1);
            }
        }

        if leg.from == BAR {
            self.players[color.index()].checkers_on_bar += 1;
        } else {
            let count = self.count(color, leg.from);
            self.set_point(leg.from, color, count + 1);
        }
    }

    fn remove_checker(&mut self, color: Color, from: u8) {
        if from == BAR {
            self.players[color.index()].checkers_on_bar -= 1;
        } else {
            let count = self.count(color, from);
            self.set_point(from, color, count.saturating_sub(1));
        }
    }

    /// Formats the board as a compact human-readable listing.
    pub fn display(&self) -> String {
        let mut lines = Vec::new();
        for point in (1..=24u8).rev() {
            let stack = self.stack(point);
            if let Some(color) = stack.color {
                lines.push(format!("{:>2}: {} x{}", point, color, stack.count));
            }
        }
        for color in [Color::White, Color::Red] {
            let player = self.player(color);
            lines.push(format!(
                "{}: bar {} off {}",
                color, player.checkers_on_bar, player.checkers_borne_off
            ));
        }
        lines.join("\n")
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::opening()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_position_is_mirrored() {
        let board = Board::opening();
        assert_eq!(board.count(Color::White, 24), 2);
        assert_eq!(board.count(Color::White, 13), 5);
        assert_eq!(board.count(Color::White, 8), 3);
        assert_eq!(board.count(Color::White, 6), 5);
        assert_eq!(board.count(Color::Red, 1), 2);
        assert_eq!(board.count(Color::Red, 12), 5);
        assert_eq!(board.count(Color::Red, 17), 3);
        assert_eq!(board.count(Color::Red, 19), 5);
        assert_eq!(board.total_checkers(Color::White), 15);
        assert_eq!(board.total_checkers(Color::Red), 15);
    }

    #[test]
    fn advance_stops_at_home_edge() {
        assert_eq!(Color::White.advance(24, 6), Some(18));
        assert_eq!(Color::White.advance(BAR, 3), Some(22));
        assert_eq!(Color::White.advance(3, 3), None);
        assert_eq!(Color::Red.advance(BAR, 3), Some(3));
        assert_eq!(Color::Red.advance(22, 3), None);
    }

    #[test]
    fn hit_and_revert_restore_board() {
        let mut board = Board::empty();
        board.set_point(10, Color::White, 1);
        board.set_point(7, Color::Red, 1);
        let before = board.clone();

        let hit = board.apply_leg(Color::White, 10, 7);
        assert!(hit);
        assert_eq!(board.count(Color::White, 7), 1);
        assert_eq!(board.player(Color::Red).checkers_on_bar(), 1);

        board.revert_leg(
            Color::White,
            &Leg {
                from: 10,
                to: 7,
                die: 3,
                hit,
            },
        );
        assert_eq!(board, before);
    }

    #[test]
    fn two_opposing_checkers_block() {
        let mut board = Board::empty();
        board.set_point(18, Color::Red, 2);
        board.set_point(17, Color::Red, 1);
        assert!(!board.is_open_for(Color::White, 18));
        assert!(board.is_open_for(Color::White, 17));
        assert!(board.is_blot_against(Color::White, 17));
    }

    #[test]
    fn farthest_point_uses_direction() {
        let mut board = Board::empty();
        board.set_point(5, Color::White, 1);
        board.set_point(2, Color::White, 1);
        board.set_point(20, Color::Red, 1);
        board.set_point(23, Color::Red, 1);
        assert_eq!(board.farthest_point(Color::White), Some(5));
        assert_eq!(board.farthest_point(Color::Red), Some(20));
    }
}
