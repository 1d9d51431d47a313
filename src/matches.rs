//! Multi-game matches: scoring, the Crawford rule and correspondence time.
//!
//! The coordinator is the only writer of match records. Sessions report
//! finished games as [`GameEvent`]s; the coordinator folds each result into
//! the match exactly once, keyed by game id, and starts the next game.

use crate::error::{GameError, Rejection, StoreError};
use crate::notifier::{Notification, Notifier};
use crate::persistence::{
    GameId, GameQuery, GameRecord, GameStatus, GameSummary, MatchId, MatchQuery, MatchRecord,
    MatchStatus, Participant, PlayerId,
};
use crate::registry::SessionRegistry;
use crate::session::{GameEvent, GameSetup};
use chrono::{DateTime, Utc};
use derive_getters::Getters;
use derive_new::new;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strictly_backgammon::{Color, GameResult};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Attempts at a conditional match write before giving up on a conflict.
const MAX_CONFLICT_RETRIES: usize = 8;

/// Parameters for a new match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, new)]
pub struct MatchSettings {
    /// Creator; White in odd-numbered games.
    player1: PlayerId,
    /// Opponent, or `None` to wait for one to join.
    player2: Option<PlayerId>,
    /// Points needed to win.
    target_score: u32,
    /// Days per move for a correspondence match.
    time_per_move_days: Option<u32>,
}

/// Channel over which sessions report [`GameEvent`]s.
pub fn event_channel() -> (
    mpsc::UnboundedSender<GameEvent>,
    mpsc::UnboundedReceiver<GameEvent>,
) {
    mpsc::unbounded_channel()
}

fn game_id_for(match_id: &str, game_number: usize) -> GameId {
    format!("{}-g{}", match_id, game_number)
}

/// Players in the White and Red seats of a given game. Colors alternate,
/// player1 taking White in odd games.
fn seats_for(record: &MatchRecord, game_number: usize) -> Option<(PlayerId, PlayerId)> {
    let player2 = record.player2.clone()?;
    let player1 = record.player1.clone();
    Some(if game_number % 2 == 1 {
        (player1, player2)
    } else {
        (player2, player1)
    })
}

/// Whether the game after a result at these scores is the Crawford game.
fn next_is_crawford(record: &MatchRecord) -> bool {
    let target = record.target_score;
    let at_match_point = |score: u32| target > 1 && score == target - 1;
    !record.crawford_used
        && record.player1_score < target
        && record.player2_score < target
        && (at_match_point(record.player1_score) || at_match_point(record.player2_score))
}

/// Runs matches on top of a [`SessionRegistry`].
pub struct MatchCoordinator {
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
    events: Mutex<Option<mpsc::UnboundedReceiver<GameEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchCoordinator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl MatchCoordinator {
    /// Creates a coordinator consuming `events` from the registry's
    /// sessions.
    #[instrument(skip_all)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        notifier: Arc<dyn Notifier>,
        events: mpsc::UnboundedReceiver<GameEvent>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        info!("Creating match coordinator");
        Self {
            registry,
            notifier,
            events: Mutex::new(Some(events)),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// The registry games are played in.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn unavailable(id: &str) -> impl Fn(StoreError) -> GameError + '_ {
        move |e| {
            warn!(id, error = %e, "Match store operation failed");
            GameError::Persistence { id: id.to_string() }
        }
    }

    // ── Queries ──────────────────────────────────────────────

    /// Loads a match.
    ///
    /// # Errors
    ///
    /// [`GameError::NotFound`] or [`GameError::Persistence`].
    #[instrument(skip(self))]
    pub async fn get_match(&self, match_id: &str) -> Result<MatchRecord, GameError> {
        self.registry
            .services()
            .store()
            .get_match(match_id)
            .await
            .map_err(Self::unavailable(match_id))?
            .ok_or_else(|| GameError::match_not_found(match_id))
    }

    /// Matches a player takes part in, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// [`GameError::Persistence`] if the store cannot be queried.
    #[instrument(skip(self))]
    pub async fn matches_for(
        &self,
        player_id: &str,
        status: Option<MatchStatus>,
    ) -> Result<Vec<MatchRecord>, GameError> {
        let mut query = MatchQuery::default().with_player(player_id.to_string());
        query.status = status;
        self.registry
            .services()
            .store()
            .query_matches(&query)
            .await
            .map_err(Self::unavailable(player_id))
    }

    /// Full stored detail of one game, including its turn log. Matches keep
    /// only summaries inline.
    ///
    /// # Errors
    ///
    /// [`GameError::NotFound`] or [`GameError::Persistence`].
    #[instrument(skip(self))]
    pub async fn game_detail(&self, game_id: &str) -> Result<GameRecord, GameError> {
        self.registry
            .services()
            .store()
            .get_game(game_id)
            .await
            .map_err(Self::unavailable(game_id))?
            .ok_or_else(|| GameError::game_not_found(game_id))
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Creates a match. With both players known the first game starts at
    /// once; otherwise the match waits for [`MatchCoordinator::join_match`].
    ///
    /// # Errors
    ///
    /// [`Rejection::InvalidSettings`] for a zero target or a player facing
    /// themselves, [`GameError::Persistence`] if the store fails.
    #[instrument(skip(self, settings), fields(player1 = %settings.player1))]
    pub async fn create_match(&self, settings: MatchSettings) -> Result<MatchRecord, GameError> {
        let invalid = |reason: &str| -> GameError {
            warn!(reason, "Invalid match settings");
            Rejection::InvalidSettings(reason.to_string()).into()
        };
        if settings.target_score == 0 {
            return Err(invalid("target score must be at least 1"));
        }
        if settings.time_per_move_days == Some(0) {
            return Err(invalid("time per move must be at least one day"));
        }
        if settings.player2.as_deref() == Some(settings.player1.as_str()) {
            return Err(Rejection::AlreadyInMatch.into());
        }

        let now = Utc::now();
        let match_id = format!("m-{:016x}", rand::random::<u64>());
        let mut record = MatchRecord {
            match_id: match_id.clone(),
            player1: settings.player1,
            player2: settings.player2,
            target_score: settings.target_score,
            player1_score: 0,
            player2_score: 0,
            games: Vec::new(),
            is_crawford_game: false,
            crawford_used: false,
            status: MatchStatus::WaitingForPlayers,
            current_game_id: None,
            time_per_move_days: settings.time_per_move_days,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        record.version = match self.write_match(&record).await? {
            Some(version) => version,
            None => {
                error!(%match_id, "Match id already taken");
                return Err(GameError::Persistence { id: match_id });
            }
        };
        info!(%match_id, "Match created");

        if let Some(player2) = record.player2.clone() {
            match self.begin_match(&match_id, player2).await {
                Ok(started) => record = started,
                Err(e) => warn!(%match_id, error = %e, "First game not started; waiting for the second player to join"),
            }
        }

        self.announce_match(&record).await;
        Ok(record)
    }

    /// Adds the second player and starts the first game. A player named at
    /// creation may join to start a match whose first game failed to start.
    ///
    /// # Errors
    ///
    /// [`Rejection::MatchNotJoinable`] unless the match is waiting for this
    /// player, [`Rejection::AlreadyInMatch`] for the creator,
    /// [`GameError::NotFound`] or [`GameError::Persistence`].
    #[instrument(skip(self))]
    pub async fn join_match(&self, match_id: &str, player2: PlayerId) -> Result<MatchRecord, GameError> {
        let record = self.begin_match(match_id, player2).await?;
        info!(player2 = ?record.player2, "Player joined match");
        self.announce_match(&record).await;
        Ok(record)
    }

    /// Seats `player2` and starts game 1, writing the match conditionally.
    async fn begin_match(&self, match_id: &str, player2: PlayerId) -> Result<MatchRecord, GameError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut record = self.get_match(match_id).await?;
            if record.status != MatchStatus::WaitingForPlayers {
                return Err(Rejection::MatchNotJoinable(record.status).into());
            }
            if record.player1 == player2 {
                return Err(Rejection::AlreadyInMatch.into());
            }
            if record.player2.as_ref().is_some_and(|invited| *invited != player2) {
                return Err(Rejection::MatchNotJoinable(record.status).into());
            }
            record.player2 = Some(player2.clone());
            self.start_game(&mut record, 1).await?;
            record.updated_at = Utc::now();

            match self.write_match(&record).await? {
                Some(version) => {
                    record.version = version;
                    return Ok(record);
                }
                None => debug!("Match changed while starting; retrying"),
            }
        }
        Err(GameError::Concurrency {
            game_id: match_id.to_string(),
        })
    }

    /// Folds a finished game into its match: appends the summary, updates
    /// the scores and the Crawford flag, then starts the next game or
    /// completes the match.
    ///
    /// Idempotent by game id; a result that was already recorded, or that
    /// belongs to a game other than the current one, leaves the match as it
    /// is.
    ///
    /// # Errors
    ///
    /// [`GameError::NotFound`], or [`GameError::Persistence`] if the match
    /// cannot be written.
    #[instrument(skip(self, result), fields(winner = %result.winner, points = result.points))]
    pub async fn complete_game(
        &self,
        match_id: &str,
        game_id: &str,
        result: GameResult,
    ) -> Result<MatchRecord, GameError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut record = self.get_match(match_id).await?;
            if record.games.iter().any(|g| g.game_id == game_id) {
                debug!("Result already recorded");
                return Ok(record);
            }
            if record.current_game_id.as_deref() != Some(game_id) {
                warn!(current = ?record.current_game_id, "Result for a game that is not current");
                return Ok(record);
            }

            let game_number = record.games.len() + 1;
            let Some((white, red)) = seats_for(&record, game_number) else {
                warn!("Result for a match without an opponent");
                return Ok(record);
            };
            let winner = match result.winner {
                Color::White => white,
                Color::Red => red,
            };
            let now = Utc::now();
            record.games.push(GameSummary {
                game_id: game_id.to_string(),
                game_number: u32::try_from(game_number).unwrap_or(u32::MAX),
                winner: winner.clone(),
                winner_color: result.winner,
                points: result.points,
                win_type: result.win_type,
                reason: result.reason,
                crawford: record.is_crawford_game,
                completed_at: now,
            });
            if winner == record.player1 {
                record.player1_score += result.points;
            } else {
                record.player2_score += result.points;
            }
            record.updated_at = now;

            let finished = record.player1_score >= record.target_score
                || record.player2_score >= record.target_score;
            if finished {
                record.status = MatchStatus::Completed;
                record.current_game_id = None;
                record.is_crawford_game = false;
            } else {
                record.is_crawford_game = next_is_crawford(&record);
                if record.is_crawford_game {
                    record.crawford_used = true;
                }
                self.start_game(&mut record, game_number + 1).await?;
            }

            if let Some(version) = self.write_match(&record).await? {
                record.version = version;
                info!(
                    score = %format!("{}-{}", record.player1_score, record.player2_score),
                    crawford = record.is_crawford_game,
                    status = %record.status,
                    "Game recorded"
                );
                if finished {
                    self.announce_finish(&record, &winner).await;
                } else {
                    self.announce_turn(&record).await;
                }
                return Ok(record);
            }
            debug!("Match changed while recording; retrying");
        }
        Err(GameError::Concurrency {
            game_id: game_id.to_string(),
        })
    }

    /// Marks a match abandoned when its current game was abandoned.
    ///
    /// # Errors
    ///
    /// [`GameError::NotFound`] or [`GameError::Persistence`].
    #[instrument(skip(self))]
    pub async fn abandon_game(&self, match_id: &str, game_id: &str) -> Result<MatchRecord, GameError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut record = self.get_match(match_id).await?;
            if record.current_game_id.as_deref() != Some(game_id)
                || record.status != MatchStatus::InProgress
            {
                return Ok(record);
            }
            record.status = MatchStatus::Abandoned;
            record.updated_at = Utc::now();
            if let Some(version) = self.write_match(&record).await? {
                record.version = version;
                info!("Match abandoned");
                return Ok(record);
            }
        }
        Err(GameError::Concurrency {
            game_id: game_id.to_string(),
        })
    }

    /// Creates the session for game `game_number` and points the match at
    /// it. Creation is idempotent, so a retried write reuses the game.
    async fn start_game(&self, record: &mut MatchRecord, game_number: usize) -> Result<(), GameError> {
        let (white, red) = seats_for(record, game_number).ok_or_else(|| {
            Rejection::InvalidSettings("match has no second player".to_string())
        })?;
        let game_id = game_id_for(&record.match_id, game_number);
        let mut setup = GameSetup::default()
            .with_match_id(record.match_id.clone())
            .with_white(Participant::human(white))
            .with_red(Participant::human(red))
            .with_crawford(record.is_crawford_game);
        setup.time_per_move_days = record.time_per_move_days;

        self.registry.get_or_create(&game_id, setup).await?;
        record.current_game_id = Some(game_id);
        record.status = MatchStatus::InProgress;
        debug!(game_number, crawford = record.is_crawford_game, "Game started");
        Ok(())
    }

    /// Conditional write with bounded backoff. `None` means someone else
    /// wrote first and the caller should reload.
    async fn write_match(&self, record: &MatchRecord) -> Result<Option<u64>, GameError> {
        let services = self.registry.services();
        let config = services.config();
        let mut delay = config.persist_backoff();
        let mut attempt = 1;
        loop {
            match services.store().put_match(record, Some(record.version)).await {
                Ok(version) => return Ok(Some(version)),
                Err(e) if e.is_transient() && attempt < *config.persist_max_attempts() => {
                    warn!(attempt, error = %e, "Match write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) if !e.is_transient() => {
                    debug!(error = %e, "Match write conflicted");
                    return Ok(None);
                }
                Err(e) => {
                    error!(error = %e, "Giving up on match write");
                    return Err(GameError::Persistence {
                        id: record.match_id.clone(),
                    });
                }
            }
        }
    }

    // ── Correspondence ───────────────────────────────────────

    /// Resolves every game whose correspondence deadline has passed as a
    /// loss on time, notifies both players, and records the result on the
    /// match. Returns how many games timed out.
    ///
    /// # Errors
    ///
    /// [`GameError::Persistence`] if the store cannot be queried.
    #[instrument(skip(self))]
    pub async fn sweep_deadlines(&self, now: DateTime<Utc>) -> Result<usize, GameError> {
        let expired = self
            .registry
            .services()
            .store()
            .query_games(
                &GameQuery::default()
                    .with_status(GameStatus::InProgress)
                    .with_deadline_before(now),
            )
            .await
            .map_err(Self::unavailable("deadline sweep"))?;

        let mut timed_out = 0;
        for record in expired {
            let session = match self.registry.get_or_load(&record.game_id).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(game_id = %record.game_id, error = %e, "Could not load expired game");
                    continue;
                }
            };
            let (loser, result) = match session.expire_deadline(now).await {
                Ok(Some(expired)) => expired,
                Ok(None) => continue,
                Err(e) => {
                    warn!(game_id = %record.game_id, error = %e, "Could not expire game");
                    continue;
                }
            };
            timed_out += 1;

            for color in [Color::White, Color::Red] {
                if let Some(player) = record.participant(color).and_then(Participant::player_id) {
                    self.notify(
                        player,
                        Notification::GameTimedOut {
                            game_id: record.game_id.clone(),
                            you_lost: color == loser,
                        },
                    )
                    .await;
                }
            }
            if let Some(match_id) = &record.match_id
                && let Err(e) = self.complete_game(match_id, &record.game_id, result).await
            {
                warn!(%match_id, error = %e, "Could not record timed-out game");
            }
        }
        if timed_out > 0 {
            info!(timed_out, "Correspondence deadlines resolved");
        }
        Ok(timed_out)
    }

    // ── Events ───────────────────────────────────────────────

    /// Handles one event from a session.
    #[instrument(skip(self))]
    pub async fn handle_event(&self, event: GameEvent) {
        match event {
            GameEvent::Completed {
                game_id,
                match_id: Some(match_id),
                result,
            } => {
                if let Err(e) = self.complete_game(&match_id, &game_id, result).await {
                    error!(%match_id, %game_id, error = %e, "Failed to record game result");
                }
            }
            GameEvent::Abandoned {
                game_id,
                match_id: Some(match_id),
            } => {
                if let Err(e) = self.abandon_game(&match_id, &game_id).await {
                    error!(%match_id, %game_id, error = %e, "Failed to abandon match");
                }
            }
            GameEvent::TurnChanged {
                game_id,
                player: Some(player),
                deadline,
            } => {
                self.notify(&player, Notification::YourTurn { game_id, deadline })
                    .await;
            }
            other => debug!(?other, "Event needs no match work"),
        }
    }

    /// Handles every event already queued, without waiting. Returns how
    /// many were handled; zero once [`MatchCoordinator::start`] owns the
    /// queue.
    pub async fn process_pending_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = {
                let mut events = self.events.lock().await;
                match events.as_mut().map(|rx| rx.try_recv()) {
                    Some(Ok(event)) => event,
                    _ => break,
                }
            };
            self.handle_event(next).await;
            handled += 1;
        }
        handled
    }

    /// Starts the event loop and the correspondence sweep.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) {
        let Some(mut events) = self.events.lock().await.take() else {
            warn!("Coordinator already started");
            return;
        };

        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => coordinator.handle_event(event).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Match event loop stopped");
        });

        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self
            .registry
            .services()
            .config()
            .correspondence_sweep_interval();
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.sweep_deadlines(Utc::now()).await {
                            warn!(error = %e, "Correspondence sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Correspondence sweep stopped");
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(event_loop);
            tasks.push(sweep);
        }
        info!(?period, "Match coordinator started");
    }

    /// Stops background work started by [`MatchCoordinator::start`].
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
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }
        info!("Match coordinator drained");
    }

    // ── Notifications ────────────────────────────────────────

    async fn notify(&self, player_id: &str, notification: Notification) {
        if let Err(e) = self.notifier.notify(player_id, notification).await {
            warn!(player_id, error = %e, "Notification failed");
        }
    }

    async fn announce_match(&self, record: &MatchRecord) {
        for player in std::iter::once(&record.player1).chain(record.player2.as_ref()) {
            self.notify(
                player,
                Notification::MatchCreated {
                    match_id: record.match_id.clone(),
                    game_id: record.current_game_id.clone(),
                },
            )
            .await;
        }
        self.announce_turn(record).await;
    }

    /// Tells White it is on move in a fresh correspondence game.
    async fn announce_turn(&self, record: &MatchRecord) {
        if record.time_per_move_days.is_none() {
            return;
        }
        let Some(game_id) = &record.current_game_id else {
            return;
        };
        let Some((white, _)) = seats_for(record, record.games.len() + 1) else {
            return;
        };
        let deadline = match self.registry.get(game_id).await {
            Some(session) => session.get_state(None).await.ok().and_then(|v| v.deadline),
            None => None,
        };
        self.notify(
            &white,
            Notification::YourTurn {
                game_id: game_id.clone(),
                deadline,
            },
        )
        .await;
    }

    async fn announce_finish(&self, record: &MatchRecord, winner: &str) {
        for player in std::iter::once(&record.player1).chain(record.player2.as_ref()) {
            self.notify(
                player,
                Notification::MatchFinished {
                    match_id: record.match_id.clone(),
                    winner: winner.to_string(),
                    player1_score: record.player1_score,
                    player2_score: record.player2_score,
                },
            )
            .await;
        }
    }
}
