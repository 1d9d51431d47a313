//! Process-wide map of live sessions.
//!
//! The map is split into shards, each behind its own lock, so lookups for
//! different games rarely contend. Store reads and writes happen outside
//! the shard locks. The registry also owns the background sweep that evicts
//! idle sessions, resumes stalled bot turns and marks long-dead games
//! abandoned.

use crate::error::{GameError, StoreError};
use crate::persistence::{GameId, GameQuery, GameStatus};
use crate::session::{GameEvent, GameSetup, Session, SessionServices};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const SHARD_COUNT: usize = 16;

type Shard = RwLock<HashMap<GameId, Arc<Session>>>;

/// Every session held in memory.
pub struct SessionRegistry {
    shards: Vec<Shard>,
    services: SessionServices,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("shards", &self.shards.len())
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// An empty registry.
    #[instrument(skip(services))]
    pub fn new(services: SessionServices) -> Self {
        let (shutdown, _) = watch::channel(false);
        info!(shards = SHARD_COUNT, "Creating session registry");
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            services,
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Collaborators handed to every session.
    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    fn shard(&self, game_id: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        game_id.hash(&mut hasher);
        let index = (hasher.finish() % SHARD_COUNT as u64) as usize;
        &self.shards[index]
    }

    /// The live session for `game_id`, if it is in memory.
    pub async fn get(&self, game_id: &str) -> Option<Arc<Session>> {
        self.shard(game_id).read().await.get(game_id).cloned()
    }

    /// Puts `session` in the map unless another caller got there first,
    /// and returns whichever session is now registered.
    async fn insert_or_existing(&self, game_id: &str, session: Arc<Session>) -> Arc<Session> {
        let mut shard = self.shard(game_id).write().await;
        let registered = shard
            .entry(game_id.to_string())
            .or_insert_with(|| session.clone())
            .clone();
        if !Arc::ptr_eq(&registered, &session) {
            debug!("Another caller registered the session first");
        }
        registered
    }

    /// The session for a stored game, loading it if needed. A loaded game
    /// plays any bot turn that is due.
    ///
    /// The store is read without holding the shard lock.
    ///
    /// # Errors
    ///
    /// [`GameError::NotFound`] if the store has no such game,
    /// [`GameError::Persistence`] if it cannot be read or replayed.
    #[instrument(skip(self))]
    pub async fn get_or_load(&self, game_id: &str) -> Result<Arc<Session>, GameError> {
        if let Some(session) = self.get(game_id).await {
            return Ok(session);
        }
        let record = self
            .services
            .store()
            .get_game(game_id)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to read game");
                GameError::Persistence {
                    id: game_id.to_string(),
                }
            })?
            .ok_or_else(|| GameError::game_not_found(game_id))?;
        let loaded = Arc::new(Session::restore(record, self.services.clone())?);
        let session = self.insert_or_existing(game_id, loaded).await;
        debug!("Session loaded from store");
        if let Err(e) = session.resume_bots().await {
            warn!(error = %e, "Could not resume bots");
        }
        Ok(session)
    }

    /// The session for `game_id`: in memory, else loaded from the store,
    /// else created from `setup`.
    ///
    /// # Errors
    ///
    /// [`GameError::Persistence`] if the store cannot be read or written.
    #[instrument(skip(self, setup))]
    pub async fn get_or_create(
        &self,
        game_id: &str,
        setup: GameSetup,
    ) -> Result<Arc<Session>, GameError> {
        match self.get_or_load(game_id).await {
            Ok(session) => return Ok(session),
            Err(GameError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        let created = match Session::create(game_id.to_string(), setup, self.services.clone()).await
        {
            Ok(session) => Arc::new(session),
            // A concurrent creator may have written the record first.
            Err(err) => return self.get_or_load(game_id).await.map_err(|_| err),
        };
        let session = self.insert_or_existing(game_id, created).await;
        if let Err(e) = session.resume_bots().await {
            warn!(error = %e, "Could not resume bots");
        }
        Ok(session)
    }

    /// Drops a session from memory. The stored game is untouched.
    #[instrument(skip(self))]
    pub async fn remove(&self, game_id: &str) -> Option<Arc<Session>> {
        let removed = self.shard(game_id).write().await.remove(game_id);
        if removed.is_some() {
            debug!("Session removed");
        }
        removed
    }

    /// Ids of every session in memory.
    pub async fn list_all(&self) -> Vec<GameId> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            ids.extend(shard.read().await.keys().cloned());
        }
        ids.sort();
        ids
    }

    /// Number of sessions in memory.
    pub async fn len(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.read().await.len();
        }
        count
    }

    /// Whether no session is in memory.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Loads every in-progress game from the store. Returns how many were
    /// loaded; games that fail to replay are logged and skipped.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the store cannot be queried.
    #[instrument(skip(self))]
    pub async fn load_active_games(&self) -> Result<usize, StoreError> {
        let records = self
            .services
            .store()
            .query_games(&GameQuery::default().with_status(GameStatus::InProgress))
            .await?;

        let mut loaded = Vec::new();
        for record in records {
            let game_id = record.game_id.clone();
            let mut shard = self.shard(&game_id).write().await;
            if shard.contains_key(&game_id) {
                continue;
            }
            match Session::restore(record, self.services.clone()) {
                Ok(session) => {
                    let session = Arc::new(session);
                    shard.insert(game_id, session.clone());
                    loaded.push(session);
                }
                Err(e) => error!(%game_id, error = %e, "Skipping game that does not restore"),
            }
        }

        for session in &loaded {
            if let Err(e) = session.resume_bots().await {
                warn!(game_id = session.game_id(), error = %e, "Could not resume bots");
            }
        }
        info!(count = loaded.len(), "Active games loaded");
        Ok(loaded.len())
    }

    /// Evicts completed sessions past their grace period and in-progress
    /// sessions idle past the threshold. Each session's lock is taken, so
    /// eviction never interrupts an action. Returns how many were evicted.
    #[instrument(skip(self))]
    pub async fn evict_idle(&self) -> usize {
        let config = self.services.config();
        let grace = config.completed_grace();
        let idle = config.idle_eviction();
        let mut evicted = 0;

        for shard in &self.shards {
            let candidates: Vec<(GameId, Arc<Session>)> = shard
                .read()
                .await
                .iter()
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect();
            for (game_id, session) in candidates {
                if !session.close_if_idle(grace, idle).await {
                    continue;
                }
                let mut map = shard.write().await;
                if map.get(&game_id).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                    map.remove(&game_id);
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            info!(evicted, "Evicted idle sessions");
        }
        evicted
    }

    /// Plays bot turns that are due in live sessions, e.g. after a bot
    /// step failed to commit. Returns how many sessions were resumed.
    #[instrument(skip(self))]
    pub async fn resume_due_bots(&self) -> usize {
        let mut resumed = 0;
        for shard in &self.shards {
            let sessions: Vec<Arc<Session>> = shard.read().await.values().cloned().collect();
            for session in sessions {
                if !matches!(session.bot_due().await, Ok(true)) {
                    continue;
                }
                match session.resume_bots().await {
                    Ok(()) => resumed += 1,
                    Err(e) => warn!(game_id = session.game_id(), error = %e, "Bot turn still pending"),
                }
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed pending bot turns");
        }
        resumed
    }

    /// Marks games abandoned after the inactivity horizon. Live sessions
    /// are changed through their lock; stored games by conditional write.
    /// Returns how many games were abandoned.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the store cannot be queried.
    #[instrument(skip(self))]
    pub async fn sweep_abandoned(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let horizon = now - self.services.config().abandon_after();
        let mut abandoned = 0;

        for status in [GameStatus::InProgress, GameStatus::WaitingForPlayers] {
            let stale = self
                .services
                .store()
                .query_games(
                    &GameQuery::default()
                        .with_status(status)
                        .with_updated_before(horizon),
                )
                .await?;

            for mut record in stale {
                if let Some(session) = self.get(&record.game_id).await {
                    match session.abandon().await {
                        Ok(true) => abandoned += 1,
                        Ok(false) => {}
                        Err(e) => warn!(game_id = %record.game_id, error = %e, "Could not abandon live game"),
                    }
                    continue;
                }

                let expected = record.version;
                record.status = GameStatus::Abandoned;
                record.deadline = None;
                record.updated_at = now;
                match self.services.store().put_game(&record, Some(expected)).await {
                    Ok(_) => {
                        abandoned += 1;
                        info!(game_id = %record.game_id, "Game abandoned");
                        if let Some(events) = self.services.events()
                            && events
                                .send(GameEvent::Abandoned {
                                    game_id: record.game_id.clone(),
                                    match_id: record.match_id.clone(),
                                })
                                .is_err()
                        {
                            warn!("Game event receiver dropped");
                        }
                    }
                    Err(e) => warn!(game_id = %record.game_id, error = %e, "Abandon write skipped"),
                }
            }
        }
        Ok(abandoned)
    }

    /// Starts the periodic eviction and abandonment sweep.
    #[instrument(skip(self))]
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.services.config().eviction_sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.evict_idle().await;
                        registry.resume_due_bots().await;
                        if let Err(e) = registry.sweep_abandoned(Utc::now()).await {
                            warn!(error = %e, "Abandonment sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Registry sweep stopped");
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
        info!(?period, "Registry sweep started");
    }

    /// Stops the sweep, waits for in-flight actions and empties the map.
    #[instrument(skip(self))]
    pub async fn drain(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Sweep task ended abnormally");
            }
        }

        let mut drained = 0;
        for shard in &self.shards {
            let sessions: Vec<Arc<Session>> =
                shard.write().await.drain().map(|(_, s)| s).collect();
            for session in sessions {
                session.close().await;
                drained += 1;
            }
        }
        info!(drained, "Registry drained");
    }
}
