//! Diesel row types for the SQLite store.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use tracing::instrument;

use super::records::{GameRecord, MatchRecord, Participant};
use super::schema;
use crate::error::StoreError;

/// A row of the `games` table. Queryable columns duplicate what filters
/// need; `payload` holds the whole record.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = schema::games)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct GameRow {
    pub game_id: String,
    pub match_id: Option<String>,
    pub white_player: Option<String>,
    pub red_player: Option<String>,
    pub status: String,
    pub version: i64,
    pub payload: String,
    pub updated_at: NaiveDateTime,
    pub deadline: Option<NaiveDateTime>,
}

impl GameRow {
    /// Encodes `record` as it will be stored at `version`.
    #[instrument(skip(record), fields(game_id = %record.game_id))]
    pub fn encode(record: &GameRecord, version: u64) -> Result<Self, StoreError> {
        let stored = record.at_version(version);
        Ok(Self {
            game_id: stored.game_id.clone(),
            match_id: stored.match_id.clone(),
            white_player: stored
                .white
                .as_ref()
                .and_then(Participant::player_id)
                .map(str::to_string),
            red_player: stored
                .red
                .as_ref()
                .and_then(Participant::player_id)
                .map(str::to_string),
            status: stored.status.as_ref().to_string(),
            version: to_column(version)?,
            payload: serde_json::to_string(&stored)?,
            updated_at: stored.updated_at.naive_utc(),
            deadline: stored.deadline.map(|d| d.naive_utc()),
        })
    }

    /// Decodes the stored record.
    pub fn decode(&self) -> Result<GameRecord, StoreError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// A row of the `matches` table.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = schema::matches)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct MatchRow {
    pub match_id: String,
    pub player1: String,
    pub player2: Option<String>,
    pub status: String,
    pub version: i64,
    pub payload: String,
    pub updated_at: NaiveDateTime,
}

impl MatchRow {
    /// Encodes `record` as it will be stored at `version`.
    #[instrument(skip(record), fields(match_id = %record.match_id))]
    pub fn encode(record: &MatchRecord, version: u64) -> Result<Self, StoreError> {
        let stored = record.at_version(version);
        Ok(Self {
            match_id: stored.match_id.clone(),
            player1: stored.player1.clone(),
            player2: stored.player2.clone(),
            status: stored.status.as_ref().to_string(),
            version: to_column(version)?,
            payload: serde_json::to_string(&stored)?,
            updated_at: stored.updated_at.naive_utc(),
        })
    }

    /// Decodes the stored record.
    pub fn decode(&self) -> Result<MatchRecord, StoreError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

fn to_column(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::corrupt(format!("version {} overflows", version)))
}

/// Reads a version column back.
pub(crate) fn from_column(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| StoreError::corrupt(format!("negative version {}", version)))
}
