//! Durable records for games and matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strictly_backgammon::{Color, EndReason, EngineSnapshot, WinType};

/// Unique identifier for a game.
pub type GameId = String;

/// Unique identifier for a match.
pub type MatchId = String;

/// Unique identifier for a player, issued by the external identity service.
pub type PlayerId = String;

/// Lifecycle of a single game.
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
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GameStatus {
    /// A seat is still empty.
    WaitingForPlayers,
    /// Both seats are occupied and the game is live.
    InProgress,
    /// A winner exists.
    Completed,
    /// No activity for the abandonment horizon.
    Abandoned,
}

/// Lifecycle of a match.
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
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchStatus {
    /// Waiting for the second player to join.
    WaitingForPlayers,
    /// Games are being played.
    InProgress,
    /// A player reached the target score.
    Completed,
    /// The current game was abandoned.
    Abandoned,
}

/// Who occupies a seat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Participant {
    /// A person, reached through their connections.
    Human {
        /// Identity of the player.
        player_id: PlayerId,
    },
    /// A server-driven player.
    Bot {
        /// Display name.
        name: String,
    },
}

impl Participant {
    /// A human seat.
    pub fn human(player_id: impl Into<PlayerId>) -> Self {
        Self::Human {
            player_id: player_id.into(),
        }
    }

    /// A bot seat.
    pub fn bot(name: impl Into<String>) -> Self {
        Self::Bot { name: name.into() }
    }

    /// The player id of a human seat.
    pub fn player_id(&self) -> Option<&str> {
        match self {
            Self::Human { player_id } => Some(player_id),
            Self::Bot { .. } => None,
        }
    }

    /// True for a bot.
    pub fn is_bot(&self) -> bool {
        matches!(self, Self::Bot { .. })
    }
}

/// The stored form of one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    /// Key.
    pub game_id: GameId,
    /// Owning match, if any.
    pub match_id: Option<MatchId>,
    /// White seat.
    pub white: Option<Participant>,
    /// Red seat.
    pub red: Option<Participant>,
    /// Lifecycle status.
    pub status: GameStatus,
    /// Engine state, including the current turn as notation.
    pub snapshot: EngineSnapshot,
    /// Store-assigned version; ignored on write.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last committed action.
    pub updated_at: DateTime<Utc>,
    /// Days allowed per move in a correspondence game.
    pub time_per_move_days: Option<u32>,
    /// When the player on move loses on time.
    pub deadline: Option<DateTime<Utc>>,
}

impl GameRecord {
    /// Participant in the seat of `color`.
    pub fn participant(&self, color: Color) -> Option<&Participant> {
        match color {
            Color::White => self.white.as_ref(),
            Color::Red => self.red.as_ref(),
        }
    }

    /// Seat held by a human player.
    pub fn seat_of(&self, player_id: &str) -> Option<Color> {
        [Color::White, Color::Red].into_iter().find(|color| {
            self.participant(*color)
                .and_then(Participant::player_id)
                .is_some_and(|id| id == player_id)
        })
    }

    /// The same record carrying `version`.
    pub(crate) fn at_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }
}

/// Immutable summary of a finished game, kept inline on its match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSummary {
    /// Game that was played.
    pub game_id: GameId,
    /// 1-based position in the match.
    pub game_number: u32,
    /// Winning player.
    pub winner: PlayerId,
    /// Color the winner played.
    pub winner_color: Color,
    /// Points awarded.
    pub points: u32,
    /// Normal, gammon or backgammon.
    pub win_type: WinType,
    /// How the game ended.
    pub reason: EndReason,
    /// Whether this was the Crawford game.
    pub crawford: bool,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// The stored form of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Key.
    pub match_id: MatchId,
    /// Creator; White in odd-numbered games.
    pub player1: PlayerId,
    /// Opponent, once joined.
    pub player2: Option<PlayerId>,
    /// Points needed to win the match.
    pub target_score: u32,
    /// Score of player1.
    pub player1_score: u32,
    /// Score of player2.
    pub player2_score: u32,
    /// Finished games in order.
    pub games: Vec<GameSummary>,
    /// Whether the current game is the Crawford game.
    pub is_crawford_game: bool,
    /// Set once the Crawford game has been scheduled.
    pub crawford_used: bool,
    /// Lifecycle status.
    pub status: MatchStatus,
    /// Game being played now.
    pub current_game_id: Option<GameId>,
    /// Days per move for correspondence matches.
    pub time_per_move_days: Option<u32>,
    /// Store-assigned version; ignored on write.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl MatchRecord {
    /// The same record carrying `version`.
    pub(crate) fn at_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    /// Whether `player_id` plays in this match.
    pub fn involves(&self, player_id: &str) -> bool {
        self.player1 == player_id || self.player2.as_deref() == Some(player_id)
    }
}
