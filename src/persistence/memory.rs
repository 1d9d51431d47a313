//! In-process store with fault injection.

use super::{
    GameQuery, GameRecord, GameStore, MatchQuery, MatchRecord, VersionCheck, check_version,
};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, instrument, warn};

/// A [`GameStore`] kept in memory.
///
/// Useful for tests and for embedding without a database. Failures can be
/// injected to exercise retry and rollback paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    games: Mutex<BTreeMap<String, GameRecord>>,
    matches: Mutex<BTreeMap<String, MatchRecord>>,
    failing_puts: AtomicU32,
    lost_acks: AtomicU32,
    offline: AtomicBool,
    game_writes: AtomicUsize,
}

impl MemoryStore {
    /// An empty store.
    #[instrument]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` writes fail before touching data.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// The next `count` writes are applied but report failure, as if the
    /// acknowledgement was lost.
    pub fn lose_next_acks(&self, count: u32) {
        self.lost_acks.store(count, Ordering::SeqCst);
    }

    /// While offline, every read and write fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Game writes that were actually applied.
    pub fn game_writes(&self) -> usize {
        self.game_writes.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("store offline"))
        } else {
            Ok(())
        }
    }

    fn before_put(&self) -> Result<(), StoreError> {
        self.ensure_online()?;
        if Self::take_one(&self.failing_puts) {
            warn!("Injected write failure");
            return Err(StoreError::unavailable("injected write failure"));
        }
        Ok(())
    }

    fn after_put(&self, version: u64) -> Result<u64, StoreError> {
        if Self::take_one(&self.lost_acks) {
            warn!(version, "Injected lost acknowledgement");
            return Err(StoreError::unavailable("injected lost acknowledgement"));
        }
        Ok(version)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::unavailable("memory store lock poisoned"))
}

#[async_trait]
impl GameStore for MemoryStore {
    #[instrument(skip(self))]
    async fn get_game(&self, game_id: &str) -> Result<Option<GameRecord>, StoreError> {
        self.ensure_online()?;
        Ok(lock(&self.games)?.get(game_id).cloned())
    }

    #[instrument(skip(self, record), fields(game_id = %record.game_id))]
    async fn put_game(
        &self,
        record: &GameRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.before_put()?;
        let version = {
            let mut games = lock(&self.games)?;
            let current = games.get(&record.game_id);
            match check_version(current.map(|r| r.version), expected_version) {
                VersionCheck::Write(version) => {
                    games.insert(record.game_id.clone(), record.at_version(version));
                    self.game_writes.fetch_add(1, Ordering::SeqCst);
                    debug!(version, "Game written");
                    version
                }
                VersionCheck::PossiblyApplied(version)
                    if current == Some(&record.at_version(version)) =>
                {
                    debug!(version, "Write already applied");
                    return Ok(version);
                }
                _ => {
                    return Err(StoreError::conflict(format!(
                        "game {} expected version {:?}, found {:?}",
                        record.game_id,
                        expected_version,
                        current.map(|r| r.version)
                    )));
                }
            }
        };
        self.after_put(version)
    }

    #[instrument(skip(self))]
    async fn query_games(&self, query: &GameQuery) -> Result<Vec<GameRecord>, StoreError> {
        self.ensure_online()?;
        Ok(lock(&self.games)?
            .values()
            .filter(|r| query.accepts(r))
            .cloned()
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_match(&self, match_id: &str) -> Result<Option<MatchRecord>, StoreError> {
        self.ensure_online()?;
        Ok(lock(&self.matches)?.get(match_id).cloned())
    }

    #[instrument(skip(self, record), fields(match_id = %record.match_id))]
    async fn put_match(
        &self,
        record: &MatchRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.before_put()?;
        let mut matches = lock(&self.matches)?;
        let current = matches.get(&record.match_id);
        match check_version(current.map(|r| r.version), expected_version) {
            VersionCheck::Write(version) => {
                matches.insert(record.match_id.clone(), record.at_version(version));
                debug!(version, "Match written");
                Ok(version)
            }
            VersionCheck::PossiblyApplied(version)
                if current == Some(&record.at_version(version)) =>
            {
                Ok(version)
            }
            _ => Err(StoreError::conflict(format!(
                "match {} expected version {:?}, found {:?}",
                record.match_id,
                expected_version,
                current.map(|r| r.version)
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn query_matches(&self, query: &MatchQuery) -> Result<Vec<MatchRecord>, StoreError> {
        self.ensure_online()?;
        Ok(lock(&self.matches)?
            .values()
            .filter(|r| query.accepts(r))
            .cloned()
            .collect())
    }
}
