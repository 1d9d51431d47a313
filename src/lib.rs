//! Gammon Server - backgammon sessions, matches and persistence
//!
//! Sits between clients and the [`strictly_backgammon`] rule engine. Every
//! live game is a [`Session`] that serializes actions, persists each change
//! before anyone else sees it, and pushes viewer-specific projections to the
//! attached connections.
//!
//! # Architecture
//!
//! - **Session**: one game, its connections and its commit path
//! - **Registry**: the sharded map of live sessions and its sweeps
//! - **Matches**: scoring, the Crawford rule and correspondence deadlines
//! - **Persistence**: versioned game and match records (SQLite or memory)
//! - **Analysis**: the GNU Backgammon service used by bot seats
//!
//! # Example
//!
//! ```no_run
//! use gammon_server::{
//!     MemoryStore, Participant, RecordingBroadcaster, ServerConfig, SessionRegistry,
//!     SessionServices, GameSetup,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let services = SessionServices::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(RecordingBroadcaster::new()),
//!     ServerConfig::default(),
//! );
//! let registry = SessionRegistry::new(services);
//! let setup = GameSetup::default()
//!     .with_white(Participant::human("alice"))
//!     .with_red(Participant::bot("gnubg"));
//! let _session = registry.get_or_create("g1", setup).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod analysis;
mod broadcast;
mod config;
mod error;
mod matches;
mod notifier;
mod persistence;
mod projection;
mod registry;
mod session;

// Crate-level exports - Configuration
pub use config::{ConfigError, ServerConfig};

// Crate-level exports - Errors
pub use error::{
    AnalysisError, BroadcastError, GameError, Rejection, StoreError, StoreErrorKind,
};

// Crate-level exports - Persistence
pub use persistence::{
    GameId, GameQuery, GameRecord, GameStatus, GameStore, GameSummary, MatchId, MatchQuery,
    MatchRecord, MatchStatus, MemoryStore, Participant, PlayerId, SqliteStore,
};

// Crate-level exports - Push delivery
pub use broadcast::{
    Broadcaster, ChannelBroadcaster, ConnectionId, Delivery, EVENT_GAME_OVER, EVENT_GAME_STATE,
    RecordingBroadcaster, TracingBroadcaster,
};
pub use notifier::{Notification, Notifier, RecordingNotifier, TracingNotifier};

// Crate-level exports - Analysis collaborators
pub use analysis::{
    Evaluation, FirstLegalMove, GnubgClient, HintMove, MoveChooser, PositionEvaluator,
    ServiceHealth, TAKE_POINT, should_take,
};

// Crate-level exports - Sessions
pub use projection::{GameView, Role};
pub use registry::SessionRegistry;
pub use session::{
    Action, ActionOutcome, DiceFactory, GameEvent, GameSetup, Session, SessionServices,
};

// Crate-level exports - Matches
pub use matches::{MatchCoordinator, MatchSettings, event_channel};
