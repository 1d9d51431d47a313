//! Player-level notifications.
//!
//! Broadcasts reach connections that are open right now. Notifications reach
//! a player wherever they are (mail, push, inbox) and are used for events a
//! correspondence player must hear about while offline.

use crate::error::BroadcastError;
use crate::persistence::{GameId, MatchId, PlayerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

/// Something a player should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A match including the player was created or joined.
    MatchCreated {
        /// The match.
        match_id: MatchId,
        /// First game, once started.
        game_id: Option<GameId>,
    },
    /// The player must act in a correspondence game.
    YourTurn {
        /// The game.
        game_id: GameId,
        /// When the move times out.
        deadline: Option<DateTime<Utc>>,
    },
    /// A correspondence game ended on time.
    GameTimedOut {
        /// The game.
        game_id: GameId,
        /// Whether the recipient is the one who ran out of time.
        you_lost: bool,
    },
    /// A match reached its target score.
    MatchFinished {
        /// The match.
        match_id: MatchId,
        /// Winning player.
        winner: PlayerId,
        /// Final score of player1.
        player1_score: u32,
        /// Final score of player2.
        player2_score: u32,
    },
}

/// Delivery channel for [`Notification`]s.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notifies `player_id`.
    async fn notify(
        &self,
        player_id: &str,
        notification: Notification,
    ) -> Result<(), BroadcastError>;
}

/// Logs notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        player_id: &str,
        notification: Notification,
    ) -> Result<(), BroadcastError> {
        info!(player_id, ?notification, "Notification");
        Ok(())
    }
}

/// Keeps notifications in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(PlayerId, Notification)>>,
}

impl RecordingNotifier {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notification sent so far.
    pub fn sent(&self) -> Vec<(PlayerId, Notification)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Notifications sent to one player.
    pub fn sent_to(&self, player_id: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|(p, _)| p == player_id)
            .map(|(_, n)| n)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        player_id: &str,
        notification: Notification,
    ) -> Result<(), BroadcastError> {
        self.sent
            .lock()
            .map_err(|_| BroadcastError::new("recorder lock poisoned"))?
            .push((player_id.to_string(), notification));
        Ok(())
    }
}
