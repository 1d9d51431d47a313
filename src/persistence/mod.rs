//! Durable storage contract for games and matches.
//!
//! Writes are conditional on the caller's last known version. A write that is
//! retried after its acknowledgement was lost finds the store one version
//! ahead holding the identical payload and succeeds without applying twice.

mod memory;
mod models;
mod records;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use records::{
    GameId, GameRecord, GameStatus, GameSummary, MatchId, MatchRecord, MatchStatus,
    Participant, PlayerId,
};
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_setters::Setters;

/// Filter for [`GameStore::query_games`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Setters)]
#[setters(prefix = "with_", strip_option)]
pub struct GameQuery {
    /// Only games in this status.
    pub status: Option<GameStatus>,
    /// Only games with this human in either seat.
    pub player: Option<PlayerId>,
    /// Only games last updated strictly before this time.
    pub updated_before: Option<DateTime<Utc>>,
    /// Only games last updated strictly after this time.
    pub updated_after: Option<DateTime<Utc>>,
    /// Only games whose deadline is strictly before this time.
    pub deadline_before: Option<DateTime<Utc>>,
}

impl GameQuery {
    /// Whether `record` passes every set filter.
    pub fn accepts(&self, record: &GameRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self
                .player
                .as_deref()
                .is_none_or(|p| record.seat_of(p).is_some())
            && self.updated_before.is_none_or(|t| record.updated_at < t)
            && self.updated_after.is_none_or(|t| record.updated_at > t)
            && self
                .deadline_before
                .is_none_or(|t| record.deadline.is_some_and(|d| d < t))
    }
}

/// Filter for [`GameStore::query_matches`].
#[derive(Debug, Clone, Default, PartialEq, Setters)]
#[setters(prefix = "with_", strip_option)]
pub struct MatchQuery {
    /// Only matches in this status.
    pub status: Option<MatchStatus>,
    /// Only matches this player takes part in.
    pub player: Option<PlayerId>,
}

impl MatchQuery {
    /// Whether `record` passes every set filter.
    pub fn accepts(&self, record: &MatchRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.player.as_deref().is_none_or(|p| record.involves(p))
    }
}

/// Get / conditional put / query over games and matches.
///
/// Implementations must be safe to share between every session in the
/// process. Only the owning session writes a game's record and only the
/// match coordinator writes a match's record.
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Loads a game.
    async fn get_game(&self, game_id: &str) -> Result<Option<GameRecord>, StoreError>;

    /// Writes a game and returns its new version.
    ///
    /// `expected_version` of `Some(0)` means "must not exist yet"; `None`
    /// writes unconditionally.
    async fn put_game(
        &self,
        record: &GameRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Games matching `query`.
    async fn query_games(&self, query: &GameQuery) -> Result<Vec<GameRecord>, StoreError>;

    /// Loads a match.
    async fn get_match(&self, match_id: &str) -> Result<Option<MatchRecord>, StoreError>;

    /// Writes a match and returns its new version, with the same version
    /// rules as [`GameStore::put_game`].
    async fn put_match(
        &self,
        record: &MatchRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Matches matching `query`.
    async fn query_matches(&self, query: &MatchQuery) -> Result<Vec<MatchRecord>, StoreError>;
}

/// Outcome of comparing a write's expected version with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VersionCheck {
    /// Apply the write at this version.
    Write(u64),
    /// The store is exactly one ahead; the write may already have landed.
    PossiblyApplied(u64),
    /// Someone else wrote in between.
    Conflict,
}

/// Decides what a conditional write should do.
pub(crate) fn check_version(current: Option<u64>, expected: Option<u64>) -> VersionCheck {
    match (current, expected) {
        (current, None) => VersionCheck::Write(current.unwrap_or(0) + 1),
        (None, Some(0)) => VersionCheck::Write(1),
        (Some(c), Some(e)) if c == e => VersionCheck::Write(e + 1),
        (Some(c), Some(e)) if c == e + 1 => VersionCheck::PossiblyApplied(c),
        _ => VersionCheck::Conflict,
    }
}
