//! Viewer-specific read model of a game.

use crate::persistence::{GameId, GameStatus, MatchId, Participant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strictly_backgammon::{
    Board, Color, Dice, DoublingCube, GameResult, Move, RuleEngine, position_id,
};

/// How a connection takes part in a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Plays the given color.
    Seat(Color),
    /// Watches.
    Spectator,
}

/// Committed game state as one viewer may see it.
///
/// Rebuilt for every request and broadcast; never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameView {
    /// The game.
    pub game_id: GameId,
    /// Owning match.
    pub match_id: Option<MatchId>,
    /// Lifecycle status.
    pub status: GameStatus,
    /// White seat.
    pub white: Option<Participant>,
    /// Red seat.
    pub red: Option<Participant>,
    /// Board.
    pub board: Board,
    /// gnubg Position ID of the board for the side on move.
    pub position_id: String,
    /// Side on move.
    pub current_player: Color,
    /// Roll for the turn.
    pub dice: Option<Dice>,
    /// Unused dice.
    pub remaining_moves: Vec<u8>,
    /// Moves played this turn, as notation.
    pub turn_moves: Vec<String>,
    /// Cube, including any pending offer.
    pub cube: DoublingCube,
    /// Whether this is the Crawford game.
    pub crawford: bool,
    /// Final result.
    pub result: Option<GameResult>,
    /// The viewer's role, if known.
    pub viewer: Option<Role>,
    /// Legal moves; only for the seat on move.
    pub valid_moves: Vec<Move>,
    /// Whether the viewer may double now.
    pub can_double: bool,
    /// Whether the viewer may end the turn now.
    pub can_end_turn: bool,
    /// Correspondence deadline for the side that must act.
    pub deadline: Option<DateTime<Utc>>,
    /// Store version of the state shown.
    pub version: u64,
    /// Broadcast sequence number; increases by one per commit.
    pub sequence: u64,
}

/// Everything a projection is computed from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProjectionSource<'a> {
    pub game_id: &'a str,
    pub match_id: Option<&'a str>,
    pub status: GameStatus,
    pub white: Option<&'a Participant>,
    pub red: Option<&'a Participant>,
    pub engine: &'a RuleEngine,
    pub deadline: Option<DateTime<Utc>>,
    pub version: u64,
    pub sequence: u64,
}

impl ProjectionSource<'_> {
    /// The view for `viewer`.
    pub(crate) fn project(&self, viewer: Option<Role>) -> GameView {
        let engine = self.engine;
        let live = self.status == GameStatus::InProgress;
        let seat = match viewer {
            Some(Role::Seat(color)) if live => Some(color),
            _ => None,
        };
        let on_move = seat.filter(|c| *c == engine.current_player());

        GameView {
            game_id: self.game_id.to_string(),
            match_id: self.match_id.map(str::to_string),
            status: self.status,
            white: self.white.cloned(),
            red: self.red.cloned(),
            board: engine.board().clone(),
            position_id: position_id(engine.board(), engine.current_player()),
            current_player: engine.current_player(),
            dice: engine.dice(),
            remaining_moves: engine.remaining_moves().to_vec(),
            turn_moves: engine.history_notation(),
            cube: *engine.cube(),
            crawford: engine.is_crawford(),
            result: engine.result().copied(),
            viewer,
            valid_moves: on_move
                .map(|_| engine.valid_moves(true))
                .unwrap_or_default(),
            can_double: seat.is_some_and(|c| engine.can_offer_double(c)),
            can_end_turn: on_move.is_some() && engine.can_end_turn(),
            deadline: self.deadline,
            version: self.version,
            sequence: self.sequence,
        }
    }
}
