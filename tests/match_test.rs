//! Integration tests for the match coordinator.

use chrono::Utc;
use gammon_server::{
    Action, GameQuery, GameStatus, GameStore, MatchCoordinator, MatchRecord, MatchSettings,
    MatchStatus, MemoryStore, Notification, RecordingBroadcaster, RecordingNotifier, Role,
    ServerConfig, SessionRegistry, SessionServices, event_channel,
};
use std::sync::Arc;
use strictly_backgammon::{Color, EndReason, GameResult, WinType};

struct Harness {
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    coordinator: MatchCoordinator,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let (events, receiver) = event_channel();
    let services = SessionServices::new(
        store.clone(),
        Arc::new(RecordingBroadcaster::new()),
        ServerConfig::default().with_persist_backoff_ms(1),
    )
    .with_events(events);
    let registry = Arc::new(SessionRegistry::new(services));
    let coordinator = MatchCoordinator::new(registry, notifier.clone(), receiver);
    Harness {
        store,
        notifier,
        coordinator,
    }
}

fn win(winner: Color, win_type: WinType) -> GameResult {
    let points = match win_type {
        WinType::Normal => 1,
        WinType::Gammon => 2,
        WinType::Backgammon => 3,
    };
    GameResult {
        winner,
        win_type,
        cube_value: 1,
        points,
        reason: EndReason::BorneOff,
    }
}

fn settings(target: u32) -> MatchSettings {
    MatchSettings::new(
        "alice".to_string(),
        Some("bob".to_string()),
        target,
        None,
    )
}

#[tokio::test]
async fn creating_a_match_starts_the_first_game() {
    let h = harness();
    let record = h.coordinator.create_match(settings(5)).await.unwrap();

    assert_eq!(record.status, MatchStatus::InProgress);
    let game_id = record.current_game_id.clone().unwrap();
    let game = h.coordinator.game_detail(&game_id).await.unwrap();
    assert_eq!(game.seat_of("alice"), Some(Color::White));
    assert_eq!(game.seat_of("bob"), Some(Color::Red));
    assert_eq!(game.match_id.as_deref(), Some(record.match_id.as_str()));

    for player in ["alice", "bob"] {
        assert!(h.notifier.sent_to(player).contains(&Notification::MatchCreated {
            match_id: record.match_id.clone(),
            game_id: Some(game_id.clone()),
        }));
    }
    let listed = h.coordinator.matches_for("bob", None).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let h = harness();
    let zero = h.coordinator.create_match(settings(0)).await.unwrap_err();
    assert_eq!(zero.code(), "invalid_settings");

    let alone = MatchSettings::new("alice".to_string(), Some("alice".to_string()), 3, None);
    let err = h.coordinator.create_match(alone).await.unwrap_err();
    assert_eq!(err.code(), "already_in_match");
}

#[tokio::test]
async fn second_player_joins_once() {
    let h = harness();
    let open = MatchSettings::new("alice".to_string(), None, 3, None);
    let record = h.coordinator.create_match(open).await.unwrap();
    assert_eq!(record.status, MatchStatus::WaitingForPlayers);
    assert!(record.current_game_id.is_none());

    let own = h
        .coordinator
        .join_match(&record.match_id, "alice".to_string())
        .await
        .unwrap_err();
    assert_eq!(own.code(), "already_in_match");

    let joined = h
        .coordinator
        .join_match(&record.match_id, "bob".to_string())
        .await
        .unwrap();
    assert_eq!(joined.status, MatchStatus::InProgress);
    assert_eq!(joined.player2.as_deref(), Some("bob"));
    assert!(joined.current_game_id.is_some());

    let late = h
        .coordinator
        .join_match(&record.match_id, "carol".to_string())
        .await
        .unwrap_err();
    assert_eq!(late.code(), "match_not_joinable");

    let missing = h
        .coordinator
        .join_match("m-nope", "carol".to_string())
        .await
        .unwrap_err();
    assert_eq!(missing.code(), "not_found");
}

#[tokio::test]
async fn failed_match_write_starts_no_game() {
    let h = harness();
    h.store.fail_next_puts(100);
    let err = h.coordinator.create_match(settings(5)).await.unwrap_err();
    assert_eq!(err.code(), "unavailable");
    h.store.fail_next_puts(0);

    let games = h
        .store
        .query_games(&GameQuery::default().with_player("alice".to_string()))
        .await
        .unwrap();
    assert!(games.is_empty());
    assert!(h.coordinator.registry().is_empty().await);
    assert!(h.coordinator.matches_for("alice", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn invited_player_starts_a_waiting_match() {
    let h = harness();
    let now = Utc::now();
    let waiting = MatchRecord {
        match_id: "m-invite".to_string(),
        player1: "alice".to_string(),
        player2: Some("bob".to_string()),
        target_score: 3,
        player1_score: 0,
        player2_score: 0,
        games: Vec::new(),
        is_crawford_game: false,
        crawford_used: false,
        status: MatchStatus::WaitingForPlayers,
        current_game_id: None,
        time_per_move_days: None,
        version: 0,
        created_at: now,
        updated_at: now,
    };
    h.store.put_match(&waiting, Some(0)).await.unwrap();

    let intruder = h
        .coordinator
        .join_match("m-invite", "carol".to_string())
        .await
        .unwrap_err();
    assert_eq!(intruder.code(), "match_not_joinable");

    let started = h
        .coordinator
        .join_match("m-invite", "bob".to_string())
        .await
        .unwrap();
    assert_eq!(started.status, MatchStatus::InProgress);
    let game = h
        .coordinator
        .game_detail(started.current_game_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(game.seat_of("bob"), Some(Color::Red));
}

#[tokio::test]
async fn crawford_game_comes_once_at_match_point() {
    let h = harness();
    let record = h.coordinator.create_match(settings(5)).await.unwrap();
    let match_id = record.match_id.clone();

    // Game 1: alice is White and wins a gammon.
    let g1 = record.current_game_id.unwrap();
    let after1 = h
        .coordinator
        .complete_game(&match_id, &g1, win(Color::White, WinType::Gammon))
        .await
        .unwrap();
    assert_eq!((after1.player1_score, after1.player2_score), (2, 0));
    assert!(!after1.is_crawford_game);

    // Game 2: colors swap; bob is White and wins a backgammon.
    let g2 = after1.current_game_id.clone().unwrap();
    let game2 = h.coordinator.game_detail(&g2).await.unwrap();
    assert_eq!(game2.seat_of("bob"), Some(Color::White));
    let after2 = h
        .coordinator
        .complete_game(&match_id, &g2, win(Color::White, WinType::Backgammon))
        .await
        .unwrap();
    assert_eq!((after2.player1_score, after2.player2_score), (2, 3));
    assert!(!after2.is_crawford_game);

    // Game 3: bob, now Red, reaches match point.
    let g3 = after2.current_game_id.clone().unwrap();
    let after3 = h
        .coordinator
        .complete_game(&match_id, &g3, win(Color::Red, WinType::Normal))
        .await
        .unwrap();
    assert_eq!((after3.player1_score, after3.player2_score), (2, 4));
    assert!(after3.is_crawford_game);
    assert!(after3.crawford_used);

    // The Crawford game forbids doubling.
    let g4 = after3.current_game_id.clone().unwrap();
    let session = h.coordinator.registry().get(&g4).await.unwrap();
    let view = session.get_state(None).await.unwrap();
    assert!(view.crawford);
    session
        .add_connection(Role::Seat(Color::White), "bob-1".to_string())
        .await
        .unwrap();
    session
        .add_connection(Role::Seat(Color::Red), "alice-1".to_string())
        .await
        .unwrap();
    let refused = session
        .apply_action(Action::OfferDouble, "bob-1")
        .await
        .unwrap_err();
    assert_eq!(refused.code(), "crawford_game");

    // Alice, as Red, wins the Crawford game; the next one is not Crawford.
    let after4 = h
        .coordinator
        .complete_game(&match_id, &g4, win(Color::Red, WinType::Normal))
        .await
        .unwrap();
    assert_eq!((after4.player1_score, after4.player2_score), (3, 4));
    assert!(!after4.is_crawford_game);
    assert!(after4.games[3].crawford);

    let g5 = after4.current_game_id.clone().unwrap();
    let after5 = h
        .coordinator
        .complete_game(&match_id, &g5, win(Color::Red, WinType::Normal))
        .await
        .unwrap();
    assert_eq!(after5.status, MatchStatus::Completed);
    assert_eq!((after5.player1_score, after5.player2_score), (3, 5));
    assert!(after5.current_game_id.is_none());
    assert_eq!(after5.games.len(), 5);
    assert_eq!(after5.games[4].winner, "bob");

    assert!(h.notifier.sent_to("alice").contains(&Notification::MatchFinished {
        match_id: match_id.clone(),
        winner: "bob".to_string(),
        player1_score: 3,
        player2_score: 5,
    }));
}

#[tokio::test]
async fn completing_a_game_twice_counts_once() {
    let h = harness();
    let record = h.coordinator.create_match(settings(7)).await.unwrap();
    let g1 = record.current_game_id.unwrap();

    let first = h
        .coordinator
        .complete_game(&record.match_id, &g1, win(Color::Red, WinType::Normal))
        .await
        .unwrap();
    let second = h
        .coordinator
        .complete_game(&record.match_id, &g1, win(Color::Red, WinType::Normal))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.games.len(), 1);
    assert_eq!(second.player2_score, 1);
    let stored = h.store.get_match(&record.match_id).await.unwrap().unwrap();
    assert_eq!(stored.version, first.version);
}

#[tokio::test]
async fn session_results_reach_the_match() {
    let h = harness();
    let record = h.coordinator.create_match(settings(3)).await.unwrap();
    let g1 = record.current_game_id.unwrap();

    let session = h.coordinator.registry().get(&g1).await.unwrap();
    session
        .add_connection(Role::Seat(Color::White), "a".to_string())
        .await
        .unwrap();
    session
        .add_connection(Role::Seat(Color::Red), "b".to_string())
        .await
        .unwrap();
    session.apply_action(Action::Resign, "a").await.unwrap();

    assert!(h.coordinator.process_pending_events().await >= 1);
    let updated = h.coordinator.get_match(&record.match_id).await.unwrap();
    assert_eq!(updated.player2_score, 1);
    assert_eq!(updated.games[0].reason, EndReason::Resigned);
    assert_ne!(updated.current_game_id.as_deref(), Some(g1.as_str()));
}

#[tokio::test]
async fn expired_correspondence_moves_lose_on_time() {
    let h = harness();
    let record = h
        .coordinator
        .create_match(MatchSettings::new(
            "alice".to_string(),
            Some("bob".to_string()),
            3,
            Some(1),
        ))
        .await
        .unwrap();
    let g1 = record.current_game_id.clone().unwrap();

    let game = h.coordinator.game_detail(&g1).await.unwrap();
    assert_eq!(game.status, GameStatus::InProgress);
    assert!(game.deadline.is_some());
    assert!(h
        .notifier
        .sent_to("alice")
        .iter()
        .any(|n| matches!(n, Notification::YourTurn { game_id, .. } if *game_id == g1)));

    assert_eq!(h.coordinator.sweep_deadlines(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + chrono::Duration::days(2);
    assert_eq!(h.coordinator.sweep_deadlines(later).await.unwrap(), 1);
    h.coordinator.process_pending_events().await;

    assert!(h.notifier.sent_to("alice").contains(&Notification::GameTimedOut {
        game_id: g1.clone(),
        you_lost: true,
    }));
    assert!(h.notifier.sent_to("bob").contains(&Notification::GameTimedOut {
        game_id: g1.clone(),
        you_lost: false,
    }));

    let updated = h.coordinator.get_match(&record.match_id).await.unwrap();
    assert_eq!(updated.games.len(), 1);
    assert_eq!(updated.games[0].reason, EndReason::Timeout);
    assert_eq!(updated.games[0].winner, "bob");
    assert_eq!(updated.player2_score, 1);
    assert_eq!(updated.status, MatchStatus::InProgress);
}
