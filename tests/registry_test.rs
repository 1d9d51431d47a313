//! Integration tests for the session registry.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use gammon_server::{
    Action, BroadcastError, Broadcaster, ConnectionId, FirstLegalMove, GameError, GameEvent,
    GameSetup, GameStatus, GameStore, MemoryStore, Participant, RecordingBroadcaster, Role,
    ServerConfig, SessionRegistry, SessionServices, event_channel,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use strictly_backgammon::{Color, DiceRoller, FixedDice};

fn registry_with(store: Arc<MemoryStore>, config: ServerConfig) -> SessionRegistry {
    let services = SessionServices::new(store, Arc::new(RecordingBroadcaster::new()), config)
        .with_dice(Arc::new(|| {
            Box::new(FixedDice::new(&[(3, 1)]).unwrap()) as Box<dyn DiceRoller>
        }));
    SessionRegistry::new(services)
}

fn humans() -> GameSetup {
    GameSetup::default()
        .with_white(Participant::human("alice"))
        .with_red(Participant::human("bob"))
}

async fn seat_both(registry: &SessionRegistry, game_id: &str) {
    let session = registry.get(game_id).await.unwrap();
    session
        .add_connection(Role::Seat(Color::White), format!("{}-w", game_id))
        .await
        .unwrap();
    session
        .add_connection(Role::Seat(Color::Red), format!("{}-r", game_id))
        .await
        .unwrap();
}

#[tokio::test]
async fn get_or_create_returns_the_same_session() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), ServerConfig::default());

    let first = registry.get_or_create("g1", humans()).await.unwrap();
    let second = registry.get_or_create("g1", GameSetup::default()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    registry.get_or_create("g2", humans()).await.unwrap();
    assert_eq!(registry.list_all().await, vec!["g1".to_string(), "g2".to_string()]);
    assert_eq!(registry.len().await, 2);
    assert_eq!(store.game_writes(), 2);
}

#[tokio::test]
async fn unknown_games_are_not_found() {
    let registry = registry_with(Arc::new(MemoryStore::new()), ServerConfig::default());
    let err = registry.get_or_load("nope").await.unwrap_err();
    assert!(matches!(err, GameError::NotFound { kind: "game", .. }));
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn unreadable_store_is_unavailable() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), ServerConfig::default());
    store.set_offline(true);
    let err = registry.get_or_load("g1").await.unwrap_err();
    assert_eq!(err.code(), "unavailable");
}

#[tokio::test]
async fn idle_sessions_are_evicted_and_reloaded() {
    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig::default()
        .with_idle_eviction_secs(0)
        .with_completed_grace_secs(0);
    let registry = registry_with(store.clone(), config);

    let session = registry.get_or_create("g1", humans()).await.unwrap();
    seat_both(&registry, "g1").await;
    session.apply_action(Action::RollDice, "g1-w").await.unwrap();
    session
        .apply_action(
            Action::PlayNotation {
                token: "13/10".to_string(),
            },
            "g1-w",
        )
        .await
        .unwrap();

    assert_eq!(registry.evict_idle().await, 1);
    assert!(registry.get("g1").await.is_none());

    let stale = session.get_state(None).await.unwrap_err();
    assert_eq!(stale.code(), "busy");

    let reloaded = registry.get_or_load("g1").await.unwrap();
    assert!(!Arc::ptr_eq(&session, &reloaded));
    reloaded
        .add_connection(Role::Seat(Color::White), "g1-w".to_string())
        .await
        .unwrap();
    let view = reloaded.get_state(Some("g1-w")).await.unwrap();
    assert_eq!(view.turn_moves, vec!["13/10".to_string()]);

    let undone = reloaded.apply_action(Action::UndoMove, "g1-w").await.unwrap();
    assert!(undone.view.turn_moves.is_empty());
}

#[tokio::test]
async fn recently_active_sessions_stay_in_memory() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store, ServerConfig::default());
    registry.get_or_create("g1", humans()).await.unwrap();
    assert_eq!(registry.evict_idle().await, 0);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn active_games_load_at_startup() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), ServerConfig::default());
    registry.get_or_create("live", humans()).await.unwrap();
    seat_both(&registry, "live").await;
    registry.get_or_create("waiting", humans()).await.unwrap();

    let restarted = registry_with(store, ServerConfig::default());
    assert_eq!(restarted.load_active_games().await.unwrap(), 1);
    assert_eq!(restarted.list_all().await, vec!["live".to_string()]);
    assert_eq!(
        restarted.get("live").await.unwrap().status().await.unwrap(),
        GameStatus::InProgress
    );
}

#[tokio::test]
async fn stale_games_are_abandoned() {
    let store = Arc::new(MemoryStore::new());
    let (events, mut receiver) = event_channel();
    let services = SessionServices::new(
        store.clone(),
        Arc::new(RecordingBroadcaster::new()),
        ServerConfig::default(),
    )
    .with_events(events);
    let registry = SessionRegistry::new(services);

    let live = registry.get_or_create("live", humans()).await.unwrap();
    seat_both(&registry, "live").await;
    registry.get_or_create("stored", humans()).await.unwrap();
    registry.remove("stored").await;

    assert_eq!(registry.sweep_abandoned(Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + Duration::days(91);
    assert_eq!(registry.sweep_abandoned(later).await.unwrap(), 2);

    assert_eq!(live.status().await.unwrap(), GameStatus::Abandoned);
    let stored = store.get_game("stored").await.unwrap().unwrap();
    assert_eq!(stored.status, GameStatus::Abandoned);

    let mut abandoned = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let GameEvent::Abandoned { game_id, .. } = event {
            abandoned.push(game_id);
        }
    }
    abandoned.sort();
    assert_eq!(abandoned, vec!["live".to_string(), "stored".to_string()]);

    assert_eq!(registry.sweep_abandoned(later).await.unwrap(), 0);
}

#[tokio::test]
async fn drain_closes_every_session() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(registry_with(store, ServerConfig::default()));
    let session = registry.get_or_create("g1", humans()).await.unwrap();
    registry.start();

    registry.drain().await;
    assert!(registry.is_empty().await);
    assert_eq!(session.status().await.unwrap_err().code(), "busy");
}

/// Fails the next store write once Red is first shown on move.
struct StallRed {
    store: Arc<MemoryStore>,
    fired: Mutex<bool>,
}

#[async_trait]
impl Broadcaster for StallRed {
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

#[tokio::test]
async fn stalled_bot_turns_resume_on_sweep() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(StallRed {
        store: store.clone(),
        fired: Mutex::new(false),
    });
    let services = SessionServices::new(
        store.clone(),
        broadcaster,
        ServerConfig::default().with_persist_max_attempts(1),
    )
    .with_dice(Arc::new(|| {
        Box::new(FixedDice::new(&[(3, 1)]).unwrap()) as Box<dyn DiceRoller>
    }))
    .with_chooser(Arc::new(FirstLegalMove));
    let registry = SessionRegistry::new(services);

    let setup = GameSetup::default()
        .with_white(Participant::human("alice"))
        .with_red(Participant::bot("gnubg"));
    let session = registry.get_or_create("g1", setup).await.unwrap();
    session
        .add_connection(Role::Seat(Color::White), "w".to_string())
        .await
        .unwrap();
    session.apply_action(Action::RollDice, "w").await.unwrap();
    for token in ["8/5", "6/5"] {
        session
            .apply_action(Action::PlayNotation { token: token.to_string() }, "w")
            .await
            .unwrap();
    }
    session.apply_action(Action::EndTurn, "w").await.unwrap();
    assert!(session.bot_due().await.unwrap());

    assert_eq!(registry.resume_due_bots().await, 1);
    assert!(!session.bot_due().await.unwrap());
    let view = session.get_state(Some("w")).await.unwrap();
    assert_eq!(view.current_player, Color::White);
    assert_eq!(registry.resume_due_bots().await, 0);
}

#[tokio::test]
async fn slow_creation_does_not_block_lookups() {
    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig::default()
        .with_persist_backoff_ms(300)
        .with_persist_max_attempts(2);
    let registry = Arc::new(registry_with(store.clone(), config));
    registry.get_or_create("ready", humans()).await.unwrap();

    store.fail_next_puts(1);
    let creating = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.get_or_create("slow", humans()).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let listed = tokio::time::timeout(std::time::Duration::from_millis(150), registry.list_all())
        .await
        .expect("lookups waited on the store");
    assert_eq!(listed, vec!["ready".to_string()]);

    creating.await.unwrap().unwrap();
    assert_eq!(registry.len().await, 2);
}

#[tokio::test]
async fn concurrent_creation_yields_one_session() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), ServerConfig::default());
    let (a, b) = tokio::join!(
        registry.get_or_create("g1", humans()),
        registry.get_or_create("g1", humans()),
    );
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(registry.len().await, 1);
}
