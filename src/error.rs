//! Error types for sessions, matches, storage and collaborators.

use crate::persistence::{GameStatus, MatchStatus};
use derive_more::{Display, Error};
use strictly_backgammon::{Color, RuleError};
use tracing::instrument;

// ─────────────────────────────────────────────────────────────
//  Caller-facing taxonomy
// ─────────────────────────────────────────────────────────────

/// Why an action was refused. Refusals never change state.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Rejection {
    /// The rule engine refused the action.
    #[display("{_0}")]
    Rule(RuleError),
    /// The connection is not attached to this game.
    #[display("connection {_0} is not attached to this game")]
    UnknownConnection(String),
    /// Spectators may watch but not act.
    #[display("spectators cannot act")]
    Spectator,
    /// The acting seat is not the one on move.
    #[display("it is {_0}'s turn")]
    NotYourTurn(Color),
    /// The game is not accepting actions.
    #[display("game is {_0}")]
    GameNotInProgress(GameStatus),
    /// The seat belongs to a bot.
    #[display("seat {_0} is played by a bot")]
    BotSeat(Color),
    /// The match is not accepting this operation.
    #[display("match is {_0}")]
    MatchNotJoinable(MatchStatus),
    /// A player tried to join their own match.
    #[display("player is already in this match")]
    AlreadyInMatch,
    /// Match settings are invalid.
    #[display("invalid match settings: {_0}")]
    InvalidSettings(String),
}

impl Rejection {
    /// Stable, machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rule(e) => e.code(),
            Self::UnknownConnection(_) => "unknown_connection",
            Self::Spectator => "spectator",
            Self::NotYourTurn(_) => "not_your_turn",
            Self::GameNotInProgress(_) => "game_not_in_progress",
            Self::BotSeat(_) => "bot_seat",
            Self::MatchNotJoinable(_) => "match_not_joinable",
            Self::AlreadyInMatch => "already_in_match",
            Self::InvalidSettings(_) => "invalid_settings",
        }
    }
}

impl std::error::Error for Rejection {}

/// Error returned by session and match operations.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum GameError {
    /// Illegal move, action or turn order. Nothing changed.
    #[display("rejected: {_0}")]
    Validation(Rejection),
    /// The session was busy for longer than the lock timeout.
    #[display("game {game_id} is busy, retry")]
    Concurrency {
        /// Game whose lock timed out.
        game_id: String,
    },
    /// The store could not be written after every retry.
    #[display("game {id} is temporarily unavailable, retry")]
    Persistence {
        /// Game or match that failed to persist.
        id: String,
    },
    /// Unknown game or match.
    #[display("{kind} {id} not found")]
    NotFound {
        /// "game" or "match".
        kind: &'static str,
        /// Requested identifier.
        id: String,
    },
}

impl GameError {
    /// Stable, machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(rejection) => rejection.code(),
            Self::Concurrency { .. } => "busy",
            Self::Persistence { .. } => "unavailable",
            Self::NotFound { .. } => "not_found",
        }
    }

    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency { .. } | Self::Persistence { .. })
    }

    /// Unknown game.
    pub fn game_not_found(game_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "game",
            id: game_id.into(),
        }
    }

    /// Unknown match.
    pub fn match_not_found(match_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "match",
            id: match_id.into(),
        }
    }
}

impl std::error::Error for GameError {}

impl From<Rejection> for GameError {
    fn from(rejection: Rejection) -> Self {
        Self::Validation(rejection)
    }
}

impl From<RuleError> for GameError {
    fn from(err: RuleError) -> Self {
        Self::Validation(Rejection::Rule(err))
    }
}

// ─────────────────────────────────────────────────────────────
//  Collaborator errors
// ─────────────────────────────────────────────────────────────

/// Broad class of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StoreErrorKind {
    /// Transient; the write may be retried.
    Unavailable,
    /// The expected version did not match.
    Conflict,
    /// A stored payload could not be decoded.
    Corrupt,
}

/// Storage error with location tracking.
#[derive(Debug, Clone, Display, Error)]
#[display("Store error ({}): {} at {}:{}", kind, message, file, line)]
pub struct StoreError {
    /// Failure class.
    pub kind: StoreErrorKind,
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl StoreError {
    /// Creates a new storage error with caller location tracking.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }

    /// Transient failure.
    #[track_caller]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unavailable, message)
    }

    /// Version conflict.
    #[track_caller]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Conflict, message)
    }

    /// Undecodable payload.
    #[track_caller]
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Corrupt, message)
    }

    /// Whether retrying could help.
    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Unavailable
    }
}

impl From<diesel::result::Error> for StoreError {
    #[track_caller]
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            ) => Self::conflict(format!("Diesel error: {}", err)),
            _ => Self::unavailable(format!("Diesel error: {}", err)),
        }
    }
}

impl From<diesel::ConnectionError> for StoreError {
    #[track_caller]
    fn from(err: diesel::ConnectionError) -> Self {
        Self::unavailable(format!("Connection error: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::corrupt(format!("Payload error: {}", err))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::unavailable(format!("Storage task failed: {}", err))
    }
}

/// Delivery error from a broadcaster.
#[derive(Debug, Clone, Display, Error)]
#[display("Broadcast error: {} at {}:{}", message, file, line)]
pub struct BroadcastError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl BroadcastError {
    /// Creates a new broadcast error with caller location tracking.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}

/// Failure talking to the analysis service.
#[derive(Debug, Clone, Display, Error)]
#[display("Analysis error: {} at {}:{}", message, file, line)]
pub struct AnalysisError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl AnalysisError {
    /// Creates a new analysis error with caller location tracking.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}

impl From<reqwest::Error> for AnalysisError {
    #[track_caller]
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(format!("Analysis request timed out: {}", err))
        } else {
            Self::new(format!("Analysis request failed: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let illegal: GameError = RuleError::IllegalMove { from: 24, to: 19 }.into();
        assert_eq!(illegal.code(), "illegal_move");
        assert!(!illegal.is_retryable());

        let busy = GameError::Concurrency {
            game_id: "g1".to_string(),
        };
        assert_eq!(busy.code(), "busy");
        assert!(busy.is_retryable());

        assert_eq!(GameError::game_not_found("g2").code(), "not_found");
        assert_eq!(
            GameError::from(Rejection::NotYourTurn(Color::Red)).code(),
            "not_your_turn"
        );
    }

    #[test]
    fn persistence_message_hides_storage_detail() {
        let err = GameError::Persistence {
            id: "g1".to_string(),
        };
        assert_eq!(err.to_string(), "game g1 is temporarily unavailable, retry");
    }

    #[test]
    fn store_error_tracks_location() {
        let err = StoreError::conflict("version 3 expected");
        assert_eq!(err.kind, StoreErrorKind::Conflict);
        assert!(err.file.ends_with("error.rs"));
        assert!(!err.is_transient());
    }
}
