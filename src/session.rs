//! One live game: its engine, its connections and the commit path.
//!
//! A [`Session`] is the unit of mutual exclusion. Every mutation takes the
//! session lock, runs against the rule engine, is written to the store and
//! acknowledged, and only then is projected and broadcast. A write that
//! cannot be completed rolls the session back and marks it degraded; the
//! next request reloads the authoritative record before doing anything else.

use crate::analysis::{MoveChooser, PositionEvaluator, should_take};
use crate::broadcast::{Broadcaster, ConnectionId, EVENT_GAME_OVER, EVENT_GAME_STATE};
use crate::config::ServerConfig;
use crate::error::{GameError, Rejection, StoreError};
use crate::persistence::{GameId, GameRecord, GameStatus, GameStore, MatchId, Participant, PlayerId};
use crate::projection::{GameView, ProjectionSource, Role};
use chrono::{DateTime, Utc};
use derive_getters::Getters;
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use strictly_backgammon::{
    Color, DiceRoller, EndReason, GameResult, Move, RandomDice, RuleEngine,
};
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Most bot steps driven after a single trigger.
const MAX_BOT_STEPS: usize = 128;

/// A client request against a game.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr,
)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    /// Roll for the turn.
    RollDice,
    /// Move a checker from one point to another.
    MakeMove {
        /// Source point; 0 is the bar.
        from: u8,
        /// Destination point; 25 is off.
        to: u8,
        /// Die (or dice total) to use, when more than one would do.
        #[serde(default)]
        die: Option<u8>,
    },
    /// Play a move written in notation, e.g. `24/18/13`.
    PlayNotation {
        /// The notation token.
        token: String,
    },
    /// Take back the last move of this turn.
    UndoMove,
    /// Pass the dice.
    EndTurn,
    /// Offer the cube before rolling.
    OfferDouble,
    /// Take a pending double.
    AcceptDouble,
    /// Pass a pending double and lose the game.
    DeclineDouble,
    /// Concede the game.
    Resign,
}

impl Action {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// What an accepted action produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    /// Broadcast sequence after the action (and any bot replies).
    pub sequence: u64,
    /// Store version after the action.
    pub version: u64,
    /// The actor's view of the committed state.
    pub view: GameView,
    /// Final result if the game is over.
    pub result: Option<GameResult>,
}

/// Lifecycle events a session reports to the match coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// A winner was decided.
    Completed {
        /// The game.
        game_id: GameId,
        /// Its match.
        match_id: Option<MatchId>,
        /// Result.
        result: GameResult,
    },
    /// The game was marked abandoned.
    Abandoned {
        /// The game.
        game_id: GameId,
        /// Its match.
        match_id: Option<MatchId>,
    },
    /// A different side must act in a correspondence game.
    TurnChanged {
        /// The game.
        game_id: GameId,
        /// Human who must act, if that seat is a human.
        player: Option<PlayerId>,
        /// When that player times out.
        deadline: Option<DateTime<Utc>>,
    },
}

/// Builds a dice source for each new session.
pub type DiceFactory = Arc<dyn Fn() -> Box<dyn DiceRoller> + Send + Sync>;

/// Collaborators shared by every session.
#[derive(Clone, Getters, Setters)]
#[setters(prefix = "with_")]
pub struct SessionServices {
    /// Durable store.
    #[setters(skip)]
    store: Arc<dyn GameStore>,
    /// Push transport.
    #[setters(skip)]
    broadcaster: Arc<dyn Broadcaster>,
    /// Tunables.
    #[setters(skip)]
    config: Arc<ServerConfig>,
    /// Picks moves for bot seats.
    #[setters(strip_option)]
    chooser: Option<Arc<dyn MoveChooser>>,
    /// Answers doubles for bot seats.
    #[setters(strip_option)]
    evaluator: Option<Arc<dyn PositionEvaluator>>,
    /// Receives completion and turn events.
    #[setters(strip_option)]
    events: Option<mpsc::UnboundedSender<GameEvent>>,
    /// Dice for new sessions.
    dice: DiceFactory,
}

impl SessionServices {
    /// Services with random dice and no bot collaborators.
    pub fn new(
        store: Arc<dyn GameStore>,
        broadcaster: Arc<dyn Broadcaster>,
        config: ServerConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            config: Arc::new(config),
            chooser: None,
            evaluator: None,
            events: None,
            dice: Arc::new(|| Box::new(RandomDice::new())),
        }
    }

    fn emit(&self, event: GameEvent) {
        if let Some(events) = &self.events
            && events.send(event).is_err()
        {
            warn!("Game event receiver dropped");
        }
    }
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices")
            .field("config", &self.config)
            .field("chooser", &self.chooser.is_some())
            .field("evaluator", &self.evaluator.is_some())
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

/// How a new game is set up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Setters)]
#[setters(prefix = "with_", strip_option)]
pub struct GameSetup {
    /// Owning match.
    pub match_id: Option<MatchId>,
    /// White seat.
    pub white: Option<Participant>,
    /// Red seat.
    pub red: Option<Participant>,
    /// Whether this is the Crawford game.
    pub crawford: bool,
    /// Days per move for a correspondence game.
    pub time_per_move_days: Option<u32>,
}

// ─────────────────────────────────────────────────────────────
//  Session state
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Connections {
    white: BTreeSet<ConnectionId>,
    red: BTreeSet<ConnectionId>,
    spectators: BTreeSet<ConnectionId>,
}

impl Connections {
    fn set(&self, role: Role) -> &BTreeSet<ConnectionId> {
        match role {
            Role::Seat(Color::White) => &self.white,
            Role::Seat(Color::Red) => &self.red,
            Role::Spectator => &self.spectators,
        }
    }

    fn set_mut(&mut self, role: Role) -> &mut BTreeSet<ConnectionId> {
        match role {
            Role::Seat(Color::White) => &mut self.white,
            Role::Seat(Color::Red) => &mut self.red,
            Role::Spectator => &mut self.spectators,
        }
    }

    fn role_of(&self, connection_id: &str) -> Option<Role> {
        ROLES
            .into_iter()
            .find(|role| self.set(*role).contains(connection_id))
    }

    fn remove(&mut self, connection_id: &str) -> Option<Role> {
        let role = self.role_of(connection_id)?;
        self.set_mut(role).remove(connection_id);
        Some(role)
    }
}

const ROLES: [Role; 3] = [
    Role::Seat(Color::White),
    Role::Seat(Color::Red),
    Role::Spectator,
];

/// The side that must act next: the responder while a double is pending,
/// otherwise the player on move.
fn party_to_act(engine: &RuleEngine) -> Color {
    engine
        .cube()
        .pending_offer()
        .map(|offer| offer.proposer.opponent())
        .unwrap_or_else(|| engine.current_player())
}

struct Checkpoint {
    engine: RuleEngine,
    status: GameStatus,
    deadline: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

struct SessionState {
    match_id: Option<MatchId>,
    white: Option<Participant>,
    red: Option<Participant>,
    status: GameStatus,
    engine: RuleEngine,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    time_per_move_days: Option<u32>,
    deadline: Option<DateTime<Utc>>,
    sequence: u64,
    connections: Connections,
    degraded: bool,
    closed: bool,
    last_activity: Instant,
    completed_at: Option<Instant>,
    dice: Box<dyn DiceRoller>,
    bot_plan: VecDeque<Move>,
}

impl SessionState {
    fn from_record(record: GameRecord, dice: Box<dyn DiceRoller>) -> Result<Self, GameError> {
        let engine = RuleEngine::restore(record.snapshot).map_err(|e| {
            error!(game_id = %record.game_id, error = %e, "Stored game does not replay");
            GameError::Persistence {
                id: record.game_id.clone(),
            }
        })?;
        let completed = record.status == GameStatus::Completed;
        Ok(Self {
            match_id: record.match_id,
            white: record.white,
            red: record.red,
            status: record.status,
            engine,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            time_per_move_days: record.time_per_move_days,
            deadline: record.deadline,
            sequence: 0,
            connections: Connections::default(),
            degraded: false,
            closed: false,
            last_activity: Instant::now(),
            completed_at: completed.then(Instant::now),
            dice,
            bot_plan: VecDeque::new(),
        })
    }

    fn participant(&self, color: Color) -> Option<&Participant> {
        match color {
            Color::White => self.white.as_ref(),
            Color::Red => self.red.as_ref(),
        }
    }

    fn is_bot(&self, color: Color) -> bool {
        self.participant(color).is_some_and(Participant::is_bot)
    }

    /// A seat is ready once it is a bot, has a live connection, or belongs
    /// to a known player in a correspondence game.
    fn seat_ready(&self, color: Color) -> bool {
        let participant = self.participant(color);
        participant.is_some_and(Participant::is_bot)
            || !self.connections.set(Role::Seat(color)).is_empty()
            || (self.time_per_move_days.is_some() && participant.is_some())
    }

    fn seats_ready(&self) -> bool {
        self.seat_ready(Color::White) && self.seat_ready(Color::Red)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            engine: self.engine.clone(),
            status: self.status,
            deadline: self.deadline,
            updated_at: self.updated_at,
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        self.engine = checkpoint.engine;
        self.status = checkpoint.status;
        self.deadline = checkpoint.deadline;
        self.updated_at = checkpoint.updated_at;
        self.bot_plan.clear();
    }

    fn record(&self, game_id: &str) -> GameRecord {
        GameRecord {
            game_id: game_id.to_string(),
            match_id: self.match_id.clone(),
            white: self.white.clone(),
            red: self.red.clone(),
            status: self.status,
            snapshot: self.engine.snapshot(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            time_per_move_days: self.time_per_move_days,
            deadline: self.deadline,
        }
    }

    fn source<'a>(&'a self, game_id: &'a str) -> ProjectionSource<'a> {
        ProjectionSource {
            game_id,
            match_id: self.match_id.as_deref(),
            status: self.status,
            white: self.white.as_ref(),
            red: self.red.as_ref(),
            engine: &self.engine,
            deadline: self.deadline,
            version: self.version,
            sequence: self.sequence,
        }
    }

    fn run(&mut self, seat: Color, action: &Action) -> Result<(), strictly_backgammon::RuleError> {
        match action {
            Action::RollDice => self.engine.roll_dice(self.dice.as_mut()).map(drop),
            Action::MakeMove { from, to, die } => self
                .engine
                .execute_move(&Move::request(*from, *to, *die))
                .map(drop),
            Action::PlayNotation { token } => self.engine.execute_notation(token).map(drop),
            Action::UndoMove => self.engine.undo_last_move().map(drop),
            Action::EndTurn => self.engine.end_turn(),
            Action::OfferDouble => self.engine.offer_double(seat),
            Action::AcceptDouble => self.engine.accept_double(seat),
            Action::DeclineDouble => self.engine.decline_double(seat).map(drop),
            Action::Resign => self.engine.concede(seat, EndReason::Resigned).map(drop),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Session
// ─────────────────────────────────────────────────────────────

/// One game held in memory.
pub struct Session {
    game_id: GameId,
    services: SessionServices,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("game_id", &self.game_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a new game and writes its first record.
    ///
    /// # Errors
    ///
    /// [`GameError::Persistence`] if the record cannot be written, including
    /// when a game with this id already exists.
    #[instrument(skip(services, setup), fields(game_id = %game_id))]
    pub async fn create(
        game_id: GameId,
        setup: GameSetup,
        services: SessionServices,
    ) -> Result<Self, GameError> {
        let max_cube = *services.config.max_cube_value();
        let now = Utc::now();
        let mut state = SessionState {
            match_id: setup.match_id,
            white: setup.white,
            red: setup.red,
            status: GameStatus::WaitingForPlayers,
            engine: RuleEngine::with_options(setup.crawford, max_cube),
            version: 0,
            created_at: now,
            updated_at: now,
            time_per_move_days: setup.time_per_move_days,
            deadline: None,
            sequence: 0,
            connections: Connections::default(),
            degraded: false,
            closed: false,
            last_activity: Instant::now(),
            completed_at: None,
            dice: (services.dice)(),
            bot_plan: VecDeque::new(),
        };
        if state.seats_ready() {
            state.status = GameStatus::InProgress;
            state.deadline = state
                .time_per_move_days
                .map(|days| now + chrono::Duration::days(i64::from(days)));
        }

        let session = Self {
            game_id,
            services,
            state: Mutex::new(state),
        };
        {
            let mut guard = session.state.lock().await;
            let record = guard.record(&session.game_id);
            let version = session.persist(&record, 0).await.map_err(|e| {
                error!(error = %e, "Failed to create game");
                GameError::Persistence {
                    id: session.game_id.clone(),
                }
            })?;
            guard.version = version;
            info!(status = %guard.status, "Game created");
        }
        Ok(session)
    }

    /// Rebuilds a session from its stored record, replaying the current
    /// turn so undo works as it did before.
    ///
    /// # Errors
    ///
    /// [`GameError::Persistence`] if the stored snapshot does not replay.
    #[instrument(skip(record, services), fields(game_id = %record.game_id, version = record.version))]
    pub fn restore(record: GameRecord, services: SessionServices) -> Result<Self, GameError> {
        let game_id = record.game_id.clone();
        let state = SessionState::from_record(record, (services.dice)())?;
        debug!(status = %state.status, "Game restored");
        Ok(Self {
            game_id,
            services,
            state: Mutex::new(state),
        })
    }

    /// The game id.
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    async fn lock(&self) -> Result<MutexGuard<'_, SessionState>, GameError> {
        let busy = || GameError::Concurrency {
            game_id: self.game_id.clone(),
        };
        let guard = tokio::time::timeout(self.services.config.lock_timeout(), self.state.lock())
            .await
            .map_err(|_| {
                warn!(game_id = %self.game_id, "Timed out waiting for session lock");
                busy()
            })?;
        if guard.closed {
            // Evicted or drained; callers go back to the registry.
            return Err(busy());
        }
        Ok(guard)
    }

    // ── Connections ──────────────────────────────────────────

    /// Attaches a connection as a seat or spectator.
    ///
    /// Idempotent: attaching the same connection in the same role again
    /// changes nothing. When both seats become ready the game starts, which
    /// is committed and broadcast like any other transition.
    ///
    /// # Errors
    ///
    /// [`Rejection::BotSeat`] for a seat played by a bot, or the errors of
    /// the commit path when starting the game.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn add_connection(
        &self,
        role: Role,
        connection_id: ConnectionId,
    ) -> Result<GameView, GameError> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;
        self.resync_if_degraded(state).await?;

        if let Role::Seat(color) = role
            && state.is_bot(color)
        {
            warn!(%color, "Connection tried to take a bot seat");
            return Err(Rejection::BotSeat(color).into());
        }
        if state.connections.role_of(&connection_id) == Some(role) {
            debug!(%connection_id, "Connection already attached");
            return Ok(state.source(&self.game_id).project(Some(role)));
        }

        let previous = state.connections.remove(&connection_id);
        state.connections.set_mut(role).insert(connection_id.clone());
        state.last_activity = Instant::now();
        info!(%connection_id, ?role, "Connection attached");

        if state.status == GameStatus::WaitingForPlayers && state.seats_ready() {
            let checkpoint = state.checkpoint();
            state.status = GameStatus::InProgress;
            if let Err(err) = self.commit(state, checkpoint).await {
                state.connections.remove(&connection_id);
                if let Some(previous) = previous {
                    state.connections.set_mut(previous).insert(connection_id);
                }
                return Err(err);
            }
            info!("Game started");
            if let Err(err) = self.drive_bots(state).await {
                debug!(error = %err, "Bot reply deferred");
            }
        } else {
            let view = state.source(&self.game_id).project(Some(role));
            self.deliver(&[connection_id], EVENT_GAME_STATE, &view).await;
        }
        Ok(state.source(&self.game_id).project(Some(role)))
    }

    /// Detaches a connection. Never ends or pauses the game.
    ///
    /// # Errors
    ///
    /// [`GameError::Concurrency`] if the session stays busy.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn remove_connection(&self, connection_id: &str) -> Result<Option<Role>, GameError> {
        let mut state = self.lock().await?;
        let role = state.connections.remove(connection_id);
        debug!(?role, "Connection detached");
        Ok(role)
    }

    /// Connections currently attached, by role.
    ///
    /// # Errors
    ///
    /// [`GameError::Concurrency`] if the session stays busy.
    pub async fn connections(&self, role: Role) -> Result<Vec<ConnectionId>, GameError> {
        let state = self.lock().await?;
        Ok(state.connections.set(role).iter().cloned().collect())
    }

    // ── Reads ────────────────────────────────────────────────

    /// Committed state as seen by `viewer`, or by an anonymous observer.
    ///
    /// # Errors
    ///
    /// [`GameError::Concurrency`] if the session stays busy.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn get_state(&self, viewer: Option<&str>) -> Result<GameView, GameError> {
        let state = self.lock().await?;
        let role = viewer.and_then(|id| state.connections.role_of(id));
        Ok(state.source(&self.game_id).project(role))
    }

    /// Lifecycle status.
    ///
    /// # Errors
    ///
    /// [`GameError::Concurrency`] if the session stays busy.
    pub async fn status(&self) -> Result<GameStatus, GameError> {
        Ok(self.lock().await?.status)
    }

    /// The record as it was last committed.
    ///
    /// # Errors
    ///
    /// [`GameError::Concurrency`] if the session stays busy.
    pub async fn record(&self) -> Result<GameRecord, GameError> {
        let state = self.lock().await?;
        Ok(state.record(&self.game_id))
    }

    // ── Mutation ─────────────────────────────────────────────

    /// Applies `action` on behalf of `connection_id`.
    ///
    /// This is the only way a game changes in response to a client. The new
    /// state is stored before anyone is told about it; bot replies are
    /// played and committed the same way before the lock is released.
    ///
    /// # Errors
    ///
    /// * [`GameError::Validation`] when the actor or action is not allowed.
    ///   Nothing changed.
    /// * [`GameError::Concurrency`] when the session lock timed out.
    /// * [`GameError::Persistence`] when the store could not be written.
    ///   The action did not happen.
    #[instrument(skip(self, action), fields(game_id = %self.game_id, action = action.name()))]
    pub async fn apply_action(
        &self,
        action: Action,
        connection_id: &str,
    ) -> Result<ActionOutcome, GameError> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;
        self.resync_if_degraded(state).await?;
        // A bot step whose commit failed earlier is still owed.
        self.drive_bots(state).await?;

        let role = state.connections.role_of(connection_id).ok_or_else(|| {
            warn!(connection_id, "Action from unknown connection");
            Rejection::UnknownConnection(connection_id.to_string())
        })?;
        let Role::Seat(seat) = role else {
            warn!(connection_id, "Spectator tried to act");
            return Err(Rejection::Spectator.into());
        };

        self.apply_as(state, seat, &action).await?;
        if let Err(err) = self.drive_bots(state).await {
            debug!(error = %err, "Bot reply deferred");
        }

        Ok(ActionOutcome {
            sequence: state.sequence,
            version: state.version,
            view: state.source(&self.game_id).project(Some(role)),
            result: state.engine.result().copied(),
        })
    }

    /// Resolves an expired correspondence deadline as a loss on time for
    /// the side that had to act.
    ///
    /// Returns the loser and the result, or `None` when the deadline has
    /// not passed.
    ///
    /// # Errors
    ///
    /// As for [`Session::apply_action`].
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn expire_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<(Color, GameResult)>, GameError> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;
        self.resync_if_degraded(state).await?;

        let expired = state.status == GameStatus::InProgress
            && state.deadline.is_some_and(|deadline| deadline <= now);
        if !expired {
            return Ok(None);
        }

        let loser = party_to_act(&state.engine);
        let checkpoint = state.checkpoint();
        let result = state.engine.concede(loser, EndReason::Timeout)?;
        self.commit(state, checkpoint).await?;
        info!(%loser, "Move timed out");
        Ok(Some((loser, result)))
    }

    /// Marks an unfinished game abandoned. Returns whether it changed.
    ///
    /// # Errors
    ///
    /// As for [`Session::apply_action`].
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub async fn abandon(&self) -> Result<bool, GameError> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;
        self.resync_if_degraded(state).await?;
        if matches!(state.status, GameStatus::Completed | GameStatus::Abandoned) {
            return Ok(false);
        }
        let checkpoint = state.checkpoint();
        state.status = GameStatus::Abandoned;
        state.deadline = None;
        self.commit(state, checkpoint).await?;
        info!("Game abandoned");
        Ok(true)
    }

    /// Plays any bot turns that are due, e.g. after a restart or after a
    /// bot step failed to commit.
    ///
    /// # Errors
    ///
    /// [`GameError::Concurrency`] if the session stays busy, or the error
    /// of the bot step that could not be committed.
    pub async fn resume_bots(&self) -> Result<(), GameError> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;
        self.resync_if_degraded(state).await?;
        self.drive_bots(state).await
    }

    // ── Lifecycle hooks for the registry ─────────────────────

    /// Closes the session if it has been idle long enough. A closed session
    /// refuses further work so callers fetch a fresh one.
    pub(crate) async fn close_if_idle(&self, completed_grace: Duration, idle: Duration) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return true;
        }
        let evict = match state.status {
            GameStatus::Completed => state
                .completed_at
                .is_some_and(|at| at.elapsed() >= completed_grace),
            GameStatus::Abandoned => true,
            GameStatus::WaitingForPlayers | GameStatus::InProgress => {
                state.last_activity.elapsed() >= idle
            }
        };
        if evict {
            state.closed = true;
            debug!(game_id = %self.game_id, status = %state.status, "Session closed for eviction");
        }
        evict
    }

    /// Waits for in-flight work and closes the session.
    pub(crate) async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    // ── Internals ────────────────────────────────────────────

    async fn resync_if_degraded(&self, state: &mut SessionState) -> Result<(), GameError> {
        if !state.degraded {
            return Ok(());
        }
        let unavailable = || GameError::Persistence {
            id: self.game_id.clone(),
        };
        let record = self
            .services
            .store
            .get_game(&self.game_id)
            .await
            .map_err(|e| {
                warn!(error = %e, "Resync failed");
                unavailable()
            })?
            .ok_or_else(|| GameError::game_not_found(&self.game_id))?;

        let dice = std::mem::replace(&mut state.dice, (self.services.dice)());
        let mut fresh = SessionState::from_record(record, dice)?;
        fresh.connections = std::mem::take(&mut state.connections);
        fresh.sequence = state.sequence;
        *state = fresh;
        info!(version = state.version, "Session resynchronized from store");
        Ok(())
    }

    /// Validates and applies one action for `seat`, then commits it.
    async fn apply_as(
        &self,
        state: &mut SessionState,
        seat: Color,
        action: &Action,
    ) -> Result<(), GameError> {
        if state.status != GameStatus::InProgress {
            warn!(status = %state.status, "Game not in progress");
            return Err(Rejection::GameNotInProgress(state.status).into());
        }
        let answers_offer = matches!(
            action,
            Action::AcceptDouble | Action::DeclineDouble | Action::Resign
        );
        if !answers_offer && seat != state.engine.current_player() {
            warn!(%seat, current = %state.engine.current_player(), "Out of turn");
            return Err(Rejection::NotYourTurn(state.engine.current_player()).into());
        }

        let checkpoint = state.checkpoint();
        if let Err(err) = state.run(seat, action) {
            warn!(%seat, error = %err, "Action rejected");
            return Err(err.into());
        }
        self.commit(state, checkpoint).await
    }

    /// Persists the state, then broadcasts it. On persistence failure the
    /// state is rolled back to `checkpoint` and the session is degraded.
    async fn commit(&self, state: &mut SessionState, checkpoint: Checkpoint) -> Result<(), GameError> {
        let now = Utc::now();
        let acting = party_to_act(&state.engine);
        let turn_changed = acting != party_to_act(&checkpoint.engine);

        if state.engine.is_over() {
            state.status = GameStatus::Completed;
        }
        if state.status != GameStatus::InProgress {
            state.deadline = None;
        } else if let Some(days) = state.time_per_move_days
            && (turn_changed || state.deadline.is_none())
        {
            state.deadline = Some(now + chrono::Duration::days(i64::from(days)));
        }
        state.updated_at = now;

        let record = state.record(&self.game_id);
        match self.persist(&record, state.version).await {
            Ok(version) => state.version = version,
            Err(err) => {
                error!(error = %err, "Giving up on write; session degraded");
                state.rollback(checkpoint);
                state.degraded = true;
                return Err(GameError::Persistence {
                    id: self.game_id.clone(),
                });
            }
        }

        state.sequence += 1;
        state.last_activity = Instant::now();
        let status_changed = state.status != checkpoint.status;
        if status_changed && state.status == GameStatus::Completed {
            state.completed_at = Some(Instant::now());
        }
        debug!(version = state.version, sequence = state.sequence, "Committed");

        let event = if state.status == GameStatus::Completed {
            EVENT_GAME_OVER
        } else {
            EVENT_GAME_STATE
        };
        for role in ROLES {
            let targets: Vec<ConnectionId> = state.connections.set(role).iter().cloned().collect();
            if targets.is_empty() {
                continue;
            }
            let view = state.source(&self.game_id).project(Some(role));
            self.deliver(&targets, event, &view).await;
        }

        match state.status {
            GameStatus::Completed if status_changed => {
                if let Some(result) = state.engine.result() {
                    self.services.emit(GameEvent::Completed {
                        game_id: self.game_id.clone(),
                        match_id: state.match_id.clone(),
                        result: *result,
                    });
                }
            }
            GameStatus::Abandoned if status_changed => self.services.emit(GameEvent::Abandoned {
                game_id: self.game_id.clone(),
                match_id: state.match_id.clone(),
            }),
            GameStatus::InProgress
                if state.time_per_move_days.is_some() && (turn_changed || status_changed) =>
            {
                self.services.emit(GameEvent::TurnChanged {
                    game_id: self.game_id.clone(),
                    player: state
                        .participant(acting)
                        .and_then(Participant::player_id)
                        .map(str::to_string),
                    deadline: state.deadline,
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// Conditional write with bounded, doubling backoff. Conflicts are not
    /// retried.
    async fn persist(&self, record: &GameRecord, expected: u64) -> Result<u64, StoreError> {
        let config = &self.services.config;
        let attempts = *config.persist_max_attempts();
        let mut delay = config.persist_backoff();
        let mut attempt = 1;
        loop {
            match self.services.store.put_game(record, Some(expected)).await {
                Ok(version) => return Ok(version),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %err, "Write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn deliver(&self, targets: &[ConnectionId], event: &str, view: &GameView) {
        let payload = match serde_json::to_value(view) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize game view");
                return;
            }
        };
        if let Err(e) = self.services.broadcaster.send(targets, event, payload).await {
            warn!(error = %e, "Broadcast failed");
        }
    }

    // ── Bots ─────────────────────────────────────────────────

    /// Plays bot turns, each step committed on its own, until a human must
    /// act or the game ends. A step that fails leaves the bot on move; the
    /// next request or sweep picks it up again.
    async fn drive_bots(&self, state: &mut SessionState) -> Result<(), GameError> {
        for _ in 0..MAX_BOT_STEPS {
            if state.status != GameStatus::InProgress || state.degraded {
                return Ok(());
            }
            let bot = party_to_act(&state.engine);
            if !state.is_bot(bot) {
                return Ok(());
            }
            let action = self.bot_action(state).await;
            debug!(%bot, action = action.name(), "Bot step");
            if let Err(err) = self.apply_as(state, bot, &action).await {
                warn!(%bot, error = %err, "Bot step failed");
                return Err(err);
            }
        }
        warn!("Bot step limit reached");
        Ok(())
    }

    /// Whether a bot seat is the party to act in a live game.
    ///
    /// # Errors
    ///
    /// [`GameError::Concurrency`] if the session stays busy.
    pub async fn bot_due(&self) -> Result<bool, GameError> {
        let state = self.lock().await?;
        Ok(state.status == GameStatus::InProgress && state.is_bot(party_to_act(&state.engine)))
    }

    async fn bot_action(&self, state: &mut SessionState) -> Action {
        if state.engine.cube().pending_offer().is_some() {
            let take = match &self.services.evaluator {
                Some(evaluator) => match evaluator.evaluate_position(&state.engine.board_view()).await {
                    Ok(equity) => should_take(equity),
                    Err(e) => {
                        warn!(error = %e, "Evaluation failed; taking");
                        true
                    }
                },
                None => true,
            };
            return if take {
                Action::AcceptDouble
            } else {
                Action::DeclineDouble
            };
        }

        if state.engine.dice().is_none() {
            state.bot_plan.clear();
            return Action::RollDice;
        }
        let view = state.engine.board_view();
        if view.valid_moves.is_empty() {
            return Action::EndTurn;
        }

        if state.bot_plan.is_empty()
            && state.engine.history().is_empty()
            && let Some(chooser) = &self.services.chooser
        {
            match chooser.choose_play(&view).await {
                Ok(play) => state.bot_plan = play.into(),
                Err(e) => warn!(error = %e, "Move chooser failed"),
            }
        }
        let wanted = match state.bot_plan.pop_front() {
            Some(planned) => Some(planned),
            None => match &self.services.chooser {
                Some(chooser) => chooser.choose_move(&view).await.unwrap_or_else(|e| {
                    warn!(error = %e, "Move chooser failed");
                    None
                }),
                None => None,
            },
        };

        let chosen = wanted.as_ref().and_then(|mv| {
            let die = (mv.die_value > 0).then_some(mv.die_value);
            state.engine.find_move(mv.from, mv.to, die)
        });
        let mv = match chosen {
            Some(mv) => mv,
            None => {
                if let Some(wanted) = wanted {
                    warn!(from = wanted.from, to = wanted.to, "Bot chose an illegal move; using first legal");
                    state.bot_plan.clear();
                }
                match view.valid_moves.first() {
                    Some(first) => first.clone(),
                    None => return Action::EndTurn,
                }
            }
        };
        Action::MakeMove {
            from: mv.from,
            to: mv.to,
            die: Some(mv.die_value),
        }
    }
}
