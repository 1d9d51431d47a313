//! Integration tests for sessions: connections, the commit path and bots.

use async_trait::async_trait;
use gammon_server::{
    Action, BroadcastError, Broadcaster, ConnectionId, DiceFactory, EVENT_GAME_OVER,
    EVENT_GAME_STATE, FirstLegalMove, GameError, GameEvent, GameSetup, GameStatus, GameStore,
    MemoryStore, Participant, RecordingBroadcaster, Role, ServerConfig, Session, SessionServices,
    event_channel,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use strictly_backgammon::{Color, DiceRoller, EndReason, FixedDice, RuleEngine};

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn test_config() -> ServerConfig {
    ServerConfig::default()
        .with_persist_backoff_ms(1)
        .with_lock_timeout_ms(2000)
}

fn dice(rolls: &'static [(u8, u8)]) -> DiceFactory {
    Arc::new(move || Box::new(FixedDice::new(rolls).unwrap()) as Box<dyn DiceRoller>)
}

fn services(
    store: Arc<MemoryStore>,
    broadcaster: Arc<dyn Broadcaster>,
    config: ServerConfig,
) -> SessionServices {
    SessionServices::new(store, broadcaster, config).with_dice(dice(&[(3, 1), (6, 5), (4, 2)]))
}

fn humans() -> GameSetup {
    GameSetup::default()
        .with_white(Participant::human("alice"))
        .with_red(Participant::human("bob"))
}

/// Creates a game and seats `w1` as White and `r1` as Red.
async fn started_game(services: SessionServices) -> Session {
    let session = Session::create("g1".to_string(), humans(), services)
        .await
        .unwrap();
    session
        .add_connection(Role::Seat(Color::White), "w1".to_string())
        .await
        .unwrap();
    session
        .add_connection(Role::Seat(Color::Red), "r1".to_string())
        .await
        .unwrap();
    session
}

async fn stored_version(store: &MemoryStore, game_id: &str) -> u64 {
    store.get_game(game_id).await.unwrap().unwrap().version
}

/// Records, for every delivery, the version the store held at that moment.
struct VersionProbe {
    store: Arc<MemoryStore>,
    seen: Mutex<Vec<(u64, u64)>>,
}

#[async_trait]
impl Broadcaster for VersionProbe {
    async fn send(
        &self,
        _connections: &[ConnectionId],
        _event: &str,
        payload: Value,
    ) -> Result<(), BroadcastError> {
        let shown = payload["version"].as_u64().unwrap_or(0);
        let game_id = payload["game_id"].as_str().unwrap_or_default().to_string();
        let stored = match self.store.get_game(&game_id).await {
            Ok(Some(record)) => record.version,
            _ => 0,
        };
        self.seen.lock().unwrap().push((shown, stored));
        Ok(())
    }
}

/// Makes the next store write fail the first time Red is shown on move.
struct FailOnRedTurn {
    store: Arc<MemoryStore>,
    fired: Mutex<bool>,
}

#[async_trait]
impl Broadcaster for FailOnRedTurn {
    async fn send(
        &self,
        _connections: &[ConnectionId],
        _event: &str,
        payload: Value,
    ) -> Result<(), BroadcastError> {
        let mut fired = self.fired.lock().unwrap();
        if payload["current_player"] == "red" && !*fired {
            *fired = true;
            self.store.fail_next_puts(1);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Connections
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn add_connection_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = Session::create(
        "g1".to_string(),
        humans(),
        services(store.clone(), broadcaster.clone(), test_config()),
    )
    .await
    .unwrap();

    let first = session
        .add_connection(Role::Seat(Color::White), "w1".to_string())
        .await
        .unwrap();
    assert_eq!(first.status, GameStatus::WaitingForPlayers);
    assert_eq!(broadcaster.deliveries_to("w1").len(), 1);

    let again = session
        .add_connection(Role::Seat(Color::White), "w1".to_string())
        .await
        .unwrap();
    assert_eq!(again, first);
    assert_eq!(broadcaster.deliveries_to("w1").len(), 1);
    assert_eq!(
        session.connections(Role::Seat(Color::White)).await.unwrap(),
        vec!["w1".to_string()]
    );

    let started = session
        .add_connection(Role::Seat(Color::Red), "r1".to_string())
        .await
        .unwrap();
    assert_eq!(started.status, GameStatus::InProgress);
    assert_eq!(stored_version(&store, "g1").await, 2);

    let deliveries = broadcaster.deliveries().len();
    session
        .add_connection(Role::Seat(Color::Red), "r1".to_string())
        .await
        .unwrap();
    assert_eq!(broadcaster.deliveries().len(), deliveries);
    assert_eq!(stored_version(&store, "g1").await, 2);
}

#[tokio::test]
async fn connection_can_switch_role() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = started_game(services(store, broadcaster, test_config())).await;

    session
        .add_connection(Role::Spectator, "w1".to_string())
        .await
        .unwrap();
    assert!(session
        .connections(Role::Seat(Color::White))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        session.remove_connection("w1").await.unwrap(),
        Some(Role::Spectator)
    );
    assert_eq!(session.status().await.unwrap(), GameStatus::InProgress);
}

// ─────────────────────────────────────────────────────────────
//  Rejections
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn rejections_change_nothing() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = started_game(services(store.clone(), broadcaster.clone(), test_config())).await;
    session
        .add_connection(Role::Spectator, "s1".to_string())
        .await
        .unwrap();
    let version = stored_version(&store, "g1").await;
    let deliveries = broadcaster.deliveries().len();

    let spectator = session.apply_action(Action::RollDice, "s1").await.unwrap_err();
    assert_eq!(spectator.code(), "spectator");

    let unknown = session.apply_action(Action::RollDice, "zz").await.unwrap_err();
    assert_eq!(unknown.code(), "unknown_connection");

    let out_of_turn = session.apply_action(Action::RollDice, "r1").await.unwrap_err();
    assert_eq!(out_of_turn.code(), "not_your_turn");

    let early = session.apply_action(Action::EndTurn, "w1").await.unwrap_err();
    assert!(matches!(early, GameError::Validation(_)));
    assert!(!early.is_retryable());

    assert_eq!(stored_version(&store, "g1").await, version);
    assert_eq!(broadcaster.deliveries().len(), deliveries);
}

#[tokio::test]
async fn bot_seat_cannot_be_taken() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let setup = GameSetup::default()
        .with_white(Participant::human("alice"))
        .with_red(Participant::bot("gnubg"));
    let session = Session::create(
        "g1".to_string(),
        setup,
        services(store, broadcaster, test_config()),
    )
    .await
    .unwrap();

    let err = session
        .add_connection(Role::Seat(Color::Red), "r1".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bot_seat");
}

// ─────────────────────────────────────────────────────────────
//  Turn flow
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_turn_passes_the_move() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = started_game(services(store.clone(), broadcaster.clone(), test_config())).await;

    let rolled = session.apply_action(Action::RollDice, "w1").await.unwrap();
    assert_eq!(rolled.view.remaining_moves.len(), 2);
    assert!(!rolled.view.valid_moves.is_empty());

    session
        .apply_action(
            Action::MakeMove {
                from: 8,
                to: 5,
                die: None,
            },
            "w1",
        )
        .await
        .unwrap();
    session
        .apply_action(
            Action::PlayNotation {
                token: "6/5".to_string(),
            },
            "w1",
        )
        .await
        .unwrap();
    let ended = session.apply_action(Action::EndTurn, "w1").await.unwrap();

    assert_eq!(ended.view.current_player, Color::Red);
    assert!(ended.view.valid_moves.is_empty());
    assert_eq!(ended.version, stored_version(&store, "g1").await);

    let red_view = session.get_state(Some("r1")).await.unwrap();
    assert_eq!(red_view.board.count(Color::White, 5), 4);
    assert_eq!(red_view.viewer, Some(Role::Seat(Color::Red)));
    assert!(red_view.can_double);

    let last = broadcaster.deliveries_to("r1").pop().unwrap();
    assert_eq!(last.event, EVENT_GAME_STATE);
    assert_eq!(last.payload["sequence"].as_u64(), Some(ended.sequence));
}

#[tokio::test]
async fn undo_restores_the_turn() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = started_game(services(store, broadcaster, test_config())).await;

    session.apply_action(Action::RollDice, "w1").await.unwrap();
    let moved = session
        .apply_action(
            Action::MakeMove {
                from: 8,
                to: 5,
                die: Some(3),
            },
            "w1",
        )
        .await
        .unwrap();
    assert_eq!(moved.view.turn_moves, vec!["8/5".to_string()]);

    let undone = session.apply_action(Action::UndoMove, "w1").await.unwrap();
    assert!(undone.view.turn_moves.is_empty());
    assert_eq!(undone.view.remaining_moves.len(), 2);
    assert_eq!(undone.view.board.count(Color::White, 8), 3);
}

#[tokio::test]
async fn concurrent_rolls_serialize() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = Arc::new(started_game(services(store.clone(), broadcaster, test_config())).await);
    let before = stored_version(&store, "g1").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            session.apply_action(Action::RollDice, "w1").await
        }));
    }
    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(stored_version(&store, "g1").await, before + 1);
}

#[tokio::test]
async fn concurrent_roll_and_move_serialize() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = Arc::new(started_game(services(store.clone(), broadcaster, test_config())).await);
    let before = stored_version(&store, "g1").await;

    let roll = {
        let session = session.clone();
        tokio::spawn(async move { session.apply_action(Action::RollDice, "w1").await })
    };
    let play = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .apply_action(
                    Action::MakeMove {
                        from: 8,
                        to: 5,
                        die: None,
                    },
                    "w1",
                )
                .await
        })
    };
    let roll = roll.await.unwrap();
    let play = play.await.unwrap();

    // The roll always lands; the move only if it ran second.
    assert!(roll.is_ok());
    let applied = 1 + u64::from(play.is_ok());
    assert_eq!(stored_version(&store, "g1").await, before + applied);
    if let Ok(outcome) = play {
        assert_eq!(outcome.view.turn_moves, vec!["8/5".to_string()]);
    }
}

// ─────────────────────────────────────────────────────────────
//  Persistence
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcasts_only_after_persisting() {
    let store = Arc::new(MemoryStore::new());
    let probe = Arc::new(VersionProbe {
        store: store.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let session = started_game(services(store.clone(), probe.clone(), test_config())).await;

    store.fail_next_puts(1);
    session.apply_action(Action::RollDice, "w1").await.unwrap();
    session
        .apply_action(
            Action::MakeMove {
                from: 8,
                to: 5,
                die: None,
            },
            "w1",
        )
        .await
        .unwrap();

    let seen = probe.seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    for (shown, stored) in seen {
        assert!(shown <= stored, "view v{} broadcast before store had it (v{})", shown, stored);
    }
}

#[tokio::test]
async fn lost_acknowledgement_applies_once() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = started_game(services(store.clone(), broadcaster, test_config())).await;
    let writes = store.game_writes();
    let before = stored_version(&store, "g1").await;

    store.lose_next_acks(1);
    let outcome = session.apply_action(Action::RollDice, "w1").await.unwrap();

    assert_eq!(store.game_writes(), writes + 1);
    assert_eq!(outcome.version, before + 1);
    assert_eq!(stored_version(&store, "g1").await, before + 1);
}

#[tokio::test]
async fn exhausted_retries_roll_back_and_resync() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let config = test_config().with_persist_max_attempts(2);
    let session = started_game(services(store.clone(), broadcaster.clone(), config)).await;
    let deliveries = broadcaster.deliveries().len();
    let before = stored_version(&store, "g1").await;

    store.fail_next_puts(2);
    let err = session.apply_action(Action::RollDice, "w1").await.unwrap_err();
    assert_eq!(err.code(), "unavailable");
    assert!(err.is_retryable());
    assert_eq!(broadcaster.deliveries().len(), deliveries);
    assert_eq!(stored_version(&store, "g1").await, before);

    let view = session.get_state(Some("w1")).await.unwrap();
    assert!(view.dice.is_none());

    let retried = session.apply_action(Action::RollDice, "w1").await.unwrap();
    assert!(retried.view.dice.is_some());
    assert_eq!(retried.version, before + 1);
    assert_eq!(
        session.connections(Role::Seat(Color::Red)).await.unwrap(),
        vec!["r1".to_string()]
    );
}

#[tokio::test]
async fn restore_replays_the_current_turn() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let services = services(store.clone(), broadcaster, test_config());
    let session = started_game(services.clone()).await;
    session.apply_action(Action::RollDice, "w1").await.unwrap();
    session
        .apply_action(
            Action::PlayNotation {
                token: "8/5".to_string(),
            },
            "w1",
        )
        .await
        .unwrap();

    let record = store.get_game("g1").await.unwrap().unwrap();
    let restored = Session::restore(record, services).unwrap();
    restored
        .add_connection(Role::Seat(Color::White), "w2".to_string())
        .await
        .unwrap();

    let view = restored.get_state(Some("w2")).await.unwrap();
    assert_eq!(view.turn_moves, vec!["8/5".to_string()]);
    let undone = restored.apply_action(Action::UndoMove, "w2").await.unwrap();
    assert_eq!(undone.view.board.count(Color::White, 8), 3);
}

// ─────────────────────────────────────────────────────────────
//  Endings, bots and correspondence
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn resignation_finishes_the_game() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let (events, mut receiver) = event_channel();
    let services = services(store.clone(), broadcaster.clone(), test_config()).with_events(events);
    let session = started_game(services).await;

    let outcome = session.apply_action(Action::Resign, "r1").await.unwrap();
    let result = outcome.result.unwrap();
    assert_eq!(result.winner, Color::White);
    assert_eq!(result.points, 1);
    assert_eq!(result.reason, EndReason::Resigned);
    assert_eq!(outcome.view.status, GameStatus::Completed);

    assert_eq!(broadcaster.deliveries_to("w1").pop().unwrap().event, EVENT_GAME_OVER);
    assert!(matches!(
        receiver.try_recv().unwrap(),
        GameEvent::Completed { ref game_id, .. } if game_id == "g1"
    ));

    let late = session.apply_action(Action::RollDice, "w1").await.unwrap_err();
    assert_eq!(late.code(), "game_not_in_progress");
}

#[tokio::test]
async fn declined_double_awards_the_cube() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let session = started_game(services(store, broadcaster, test_config())).await;

    let offered = session.apply_action(Action::OfferDouble, "w1").await.unwrap();
    assert!(offered.view.cube.pending_offer().is_some());

    let blocked = session.apply_action(Action::RollDice, "w1").await.unwrap_err();
    assert!(matches!(blocked, GameError::Validation(_)));

    let declined = session.apply_action(Action::DeclineDouble, "r1").await.unwrap();
    let result = declined.result.unwrap();
    assert_eq!(result.winner, Color::White);
    assert_eq!(result.reason, EndReason::DoubleDeclined);
    assert_eq!(result.points, 1);
}

#[tokio::test]
async fn bot_replies_before_the_lock_is_released() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let services = services(store.clone(), broadcaster, test_config())
        .with_chooser(Arc::new(FirstLegalMove));
    let setup = GameSetup::default()
        .with_white(Participant::human("alice"))
        .with_red(Participant::bot("gnubg"));
    let session = Session::create("g1".to_string(), setup, services).await.unwrap();
    let started = session
        .add_connection(Role::Seat(Color::White), "w1".to_string())
        .await
        .unwrap();
    assert_eq!(started.status, GameStatus::InProgress);

    let doubled = session.apply_action(Action::OfferDouble, "w1").await.unwrap();
    assert_eq!(doubled.view.cube.value(), 2);
    assert_eq!(doubled.view.cube.owner(), Some(Color::Red));
    assert_eq!(doubled.view.current_player, Color::White);

    session.apply_action(Action::RollDice, "w1").await.unwrap();
    session
        .apply_action(Action::PlayNotation { token: "8/5".to_string() }, "w1")
        .await
        .unwrap();
    session
        .apply_action(Action::PlayNotation { token: "6/5".to_string() }, "w1")
        .await
        .unwrap();
    let back = session.apply_action(Action::EndTurn, "w1").await.unwrap();

    assert_eq!(back.view.current_player, Color::White);
    assert!(back.view.dice.is_none());

    let record = store.get_game("g1").await.unwrap().unwrap();
    let engine = RuleEngine::restore(record.snapshot).unwrap();
    assert_eq!(engine.log().len(), 2);
    assert_eq!(engine.log()[1].player, Color::Red);
    assert!(!engine.log()[1].moves.is_empty());
}

#[tokio::test]
async fn failed_bot_step_is_played_on_the_next_request() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(FailOnRedTurn {
        store: store.clone(),
        fired: Mutex::new(false),
    });
    let services = services(store.clone(), broadcaster, test_config().with_persist_max_attempts(1))
        .with_chooser(Arc::new(FirstLegalMove));
    let setup = GameSetup::default()
        .with_white(Participant::human("alice"))
        .with_red(Participant::bot("gnubg"));
    let session = Session::create("g1".to_string(), setup, services).await.unwrap();
    session
        .add_connection(Role::Seat(Color::White), "w1".to_string())
        .await
        .unwrap();

    session.apply_action(Action::RollDice, "w1").await.unwrap();
    for token in ["8/5", "6/5"] {
        session
            .apply_action(Action::PlayNotation { token: token.to_string() }, "w1")
            .await
            .unwrap();
    }
    // The turn passes, but the bot's roll cannot be stored.
    let ended = session.apply_action(Action::EndTurn, "w1").await.unwrap();
    assert_eq!(ended.view.current_player, Color::Red);
    assert!(ended.view.dice.is_none());

    let rolled = session.apply_action(Action::RollDice, "w1").await.unwrap();
    assert_eq!(rolled.view.current_player, Color::White);
    assert!(rolled.view.dice.is_some());

    let record = store.get_game("g1").await.unwrap().unwrap();
    let engine = RuleEngine::restore(record.snapshot).unwrap();
    assert_eq!(engine.log().len(), 2);
    assert_eq!(engine.log()[1].player, Color::Red);
}

#[tokio::test]
async fn correspondence_game_times_out() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let (events, mut receiver) = event_channel();
    let services = services(store.clone(), broadcaster, test_config()).with_events(events);
    let session = Session::create("g1".to_string(), humans().with_time_per_move_days(2), services)
        .await
        .unwrap();

    assert_eq!(session.status().await.unwrap(), GameStatus::InProgress);
    let deadline = session.get_state(None).await.unwrap().deadline.unwrap();

    assert!(session
        .expire_deadline(deadline - chrono::Duration::hours(1))
        .await
        .unwrap()
        .is_none());

    let (loser, result) = session
        .expire_deadline(deadline + chrono::Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loser, Color::White);
    assert_eq!(result.winner, Color::Red);
    assert_eq!(result.reason, EndReason::Timeout);
    assert_eq!(session.status().await.unwrap(), GameStatus::Completed);
    assert!(session.get_state(None).await.unwrap().deadline.is_none());

    let mut completed = false;
    while let Ok(event) = receiver.try_recv() {
        completed |= matches!(event, GameEvent::Completed { .. });
    }
    assert!(completed);
}
