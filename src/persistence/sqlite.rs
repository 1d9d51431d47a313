//! SQLite-backed store.

use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::{debug, info, instrument, warn};

use super::models::{GameRow, MatchRow, from_column};
use super::{
    GameQuery, GameRecord, GameStore, MatchQuery, MatchRecord, VersionCheck, check_version,
    schema,
};
use crate::error::StoreError;
use async_trait::async_trait;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// A [`GameStore`] on a SQLite file.
///
/// Each call opens its own connection on the blocking pool, so the store is
/// cheap to clone and share across sessions.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: String,
}

impl SqliteStore {
    /// Creates a store for the database at `db_path`.
    #[instrument(skip(db_path), fields(db_path = %db_path))]
    pub fn new(db_path: String) -> Self {
        info!(path = %db_path, "Creating SqliteStore");
        Self { db_path }
    }

    /// Applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or migrated.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<usize, StoreError> {
        self.blocking(|conn| {
            let applied = conn
                .run_pending_migrations(MIGRATIONS)
                .map_err(|e| StoreError::unavailable(format!("Migrations failed: {}", e)))?;
            info!(count = applied.len(), "Migrations applied");
            Ok(applied.len())
        })
        .await
    }

    #[instrument(skip(self))]
    fn connection(&self) -> Result<SqliteConnection, StoreError> {
        debug!(path = %self.db_path, "Establishing connection");
        let mut conn = SqliteConnection::establish(&self.db_path).map_err(|e| {
            StoreError::unavailable(format!("Failed to connect to '{}': {}", self.db_path, e))
        })?;
        diesel::sql_query("PRAGMA busy_timeout = 5000").execute(&mut conn)?;
        Ok(conn)
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.connection()?;
            work(&mut conn)
        })
        .await?
    }
}

fn put_game_row(
    conn: &mut SqliteConnection,
    record: &GameRecord,
    expected: Option<u64>,
) -> Result<u64, StoreError> {
    use schema::games::dsl;

    conn.immediate_transaction(|conn| {
        let current: Option<GameRow> = dsl::games
            .filter(dsl::game_id.eq(&record.game_id))
            .select(GameRow::as_select())
            .first(conn)
            .optional()?;
        let current_version = current.as_ref().map(|r| from_column(r.version)).transpose()?;

        match check_version(current_version, expected) {
            VersionCheck::Write(version) => {
                let row = GameRow::encode(record, version)?;
                if current.is_some() {
                    diesel::update(dsl::games.filter(dsl::game_id.eq(&record.game_id)))
                        .set(&row)
                        .execute(conn)?;
                } else {
                    diesel::insert_into(dsl::games).values(&row).execute(conn)?;
                }
                debug!(version, "Game written");
                Ok(version)
            }
            VersionCheck::PossiblyApplied(version) => {
                let row = GameRow::encode(record, version)?;
                if current.is_some_and(|c| c.payload == row.payload) {
                    debug!(version, "Write already applied");
                    Ok(version)
                } else {
                    Err(StoreError::conflict(format!(
                        "game {} was written by someone else at version {}",
                        record.game_id, version
                    )))
                }
            }
            VersionCheck::Conflict => Err(StoreError::conflict(format!(
                "game {} expected version {:?}, found {:?}",
                record.game_id, expected, current_version
            ))),
        }
    })
}

fn put_match_row(
    conn: &mut SqliteConnection,
    record: &MatchRecord,
    expected: Option<u64>,
) -> Result<u64, StoreError> {
    use schema::matches::dsl;

    conn.immediate_transaction(|conn| {
        let current: Option<MatchRow> = dsl::matches
            .filter(dsl::match_id.eq(&record.match_id))
            .select(MatchRow::as_select())
            .first(conn)
            .optional()?;
        let current_version = current.as_ref().map(|r| from_column(r.version)).transpose()?;

        match check_version(current_version, expected) {
            VersionCheck::Write(version) => {
                let row = MatchRow::encode(record, version)?;
                if current.is_some() {
                    diesel::update(dsl::matches.filter(dsl::match_id.eq(&record.match_id)))
                        .set(&row)
                        .execute(conn)?;
                } else {
                    diesel::insert_into(dsl::matches).values(&row).execute(conn)?;
                }
                Ok(version)
            }
            VersionCheck::PossiblyApplied(version) => {
                let row = MatchRow::encode(record, version)?;
                if current.is_some_and(|c| c.payload == row.payload) {
                    Ok(version)
                } else {
                    Err(StoreError::conflict(format!(
                        "match {} was written by someone else at version {}",
                        record.match_id, version
                    )))
                }
            }
            VersionCheck::Conflict => Err(StoreError::conflict(format!(
                "match {} expected version {:?}, found {:?}",
                record.match_id, expected, current_version
            ))),
        }
    })
}

#[async_trait]
impl GameStore for SqliteStore {
    #[instrument(skip(self))]
    async fn get_game(&self, game_id: &str) -> Result<Option<GameRecord>, StoreError> {
        let game_id = game_id.to_string();
        self.blocking(move |conn| {
            let row: Option<GameRow> = schema::games::table
                .filter(schema::games::game_id.eq(&game_id))
                .select(GameRow::as_select())
                .first(conn)
                .optional()?;
            row.map(|r| r.decode()).transpose()
        })
        .await
    }

    #[instrument(skip(self, record), fields(game_id = %record.game_id))]
    async fn put_game(
        &self,
        record: &GameRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let record = record.clone();
        self.blocking(move |conn| put_game_row(conn, &record, expected_version))
            .await
            .inspect_err(|e| warn!(error = %e, "Game write failed"))
    }

    #[instrument(skip(self))]
    async fn query_games(&self, query: &GameQuery) -> Result<Vec<GameRecord>, StoreError> {
        use schema::games::dsl;

        let query = query.clone();
        self.blocking(move |conn| {
            let mut select = dsl::games.into_boxed();
            if let Some(status) = query.status {
                select = select.filter(dsl::status.eq(status.as_ref().to_string()));
            }
            if let Some(player) = query.player.clone() {
                select = select.filter(
                    dsl::white_player
                        .eq(player.clone())
                        .or(dsl::red_player.eq(player)),
                );
            }
            if let Some(before) = query.updated_before {
                select = select.filter(dsl::updated_at.lt(before.naive_utc()));
            }
            if let Some(after) = query.updated_after {
                select = select.filter(dsl::updated_at.gt(after.naive_utc()));
            }
            if let Some(before) = query.deadline_before {
                select = select.filter(dsl::deadline.lt(before.naive_utc()));
            }

            let rows: Vec<GameRow> = select
                .order(dsl::updated_at.asc())
                .select(GameRow::as_select())
                .load(conn)?;
            debug!(count = rows.len(), "Games loaded");
            rows.iter().map(GameRow::decode).collect()
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_match(&self, match_id: &str) -> Result<Option<MatchRecord>, StoreError> {
        let match_id = match_id.to_string();
        self.blocking(move |conn| {
            let row: Option<MatchRow> = schema::matches::table
                .filter(schema::matches::match_id.eq(&match_id))
                .select(MatchRow::as_select())
                .first(conn)
                .optional()?;
            row.map(|r| r.decode()).transpose()
        })
        .await
    }

    #[instrument(skip(self, record), fields(match_id = %record.match_id))]
    async fn put_match(
        &self,
        record: &MatchRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let record = record.clone();
        self.blocking(move |conn| put_match_row(conn, &record, expected_version))
            .await
            .inspect_err(|e| warn!(error = %e, "Match write failed"))
    }

    #[instrument(skip(self))]
    async fn query_matches(&self, query: &MatchQuery) -> Result<Vec<MatchRecord>, StoreError> {
        use schema::matches::dsl;

        let query = query.clone();
        self.blocking(move |conn| {
            let mut select = dsl::matches.into_boxed();
            if let Some(status) = query.status {
                select = select.filter(dsl::status.eq(status.as_ref().to_string()));
            }
            if let Some(player) = query.player.clone() {
                select = select.filter(
                    dsl::player1
                        .eq(player.clone())
                        .or(dsl::player2.eq(player)),
                );
            }
            let rows: Vec<MatchRow> = select
                .order(dsl::updated_at.asc())
                .select(MatchRow::as_select())
                .load(conn)?;
            rows.iter().map(MatchRow::decode).collect()
        })
        .await
    }
}
