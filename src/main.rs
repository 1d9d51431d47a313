//! Gammon - backgammon session and match server
//!
//! Runs the session registry and match coordinator against a SQLite store,
//! and offers offline replay and migration commands.

#![warn(missing_docs)]

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use gammon_server::{
    GameRecord, GameStore, GnubgClient, MatchCoordinator, MoveChooser, Participant,
    PositionEvaluator, ServerConfig, SessionRegistry, SessionServices, SqliteStore,
    TracingBroadcaster, TracingNotifier, event_channel,
};
use std::path::PathBuf;
use std::sync::Arc;
use strictly_backgammon::{BAR, Color, OFF, RuleEngine};
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gammon_server=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, db_path } => run_server(config, db_path).await,
        Command::Replay { game_id, db_path } => run_replay(game_id, db_path).await,
        Command::Migrate { db_path } => run_migrate(db_path).await,
    }
}

/// Run the server until Ctrl-C
#[instrument(skip_all)]
async fn run_server(config_path: Option<PathBuf>, db_path: Option<String>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(db_path) = db_path {
        config = config.with_database_path(db_path);
    }
    info!(database = %config.database_path(), "Starting gammon server");

    let store = SqliteStore::new(config.database_path().clone());
    store.run_migrations().await?;

    let (events, receiver) = event_channel();
    let mut services = SessionServices::new(
        Arc::new(store),
        Arc::new(TracingBroadcaster),
        config.clone(),
    )
    .with_events(events);

    if let Some(client) = GnubgClient::from_config(&config)? {
        match client.health().await {
            Ok(health) => info!(status = %health.status, gnubg = health.gnubg_available, "Analysis service reachable"),
            Err(e) => warn!(error = %e, "Analysis service not reachable yet"),
        }
        let client = Arc::new(client);
        let chooser: Arc<dyn MoveChooser> = client.clone();
        let evaluator: Arc<dyn PositionEvaluator> = client;
        services = services.with_chooser(chooser).with_evaluator(evaluator);
    } else {
        info!("No analysis service configured; bots play the first legal move");
    }

    let registry = Arc::new(SessionRegistry::new(services));
    let coordinator = Arc::new(MatchCoordinator::new(
        registry.clone(),
        Arc::new(TracingNotifier),
        receiver,
    ));

    let loaded = registry.load_active_games().await?;
    registry.start();
    coordinator.start().await;
    info!(loaded, "Server ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    coordinator.drain().await;
    registry.drain().await;
    Ok(())
}

/// Rebuild a stored game and print it
#[instrument]
async fn run_replay(game_id: String, db_path: String) -> Result<()> {
    let store = SqliteStore::new(db_path);
    let record = store
        .get_game(&game_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("game {} not found", game_id))?;
    let engine = RuleEngine::restore(record.snapshot.clone())?;
    print!("{}", describe(&record, &engine));
    Ok(())
}

/// Apply pending migrations
#[instrument]
async fn run_migrate(db_path: String) -> Result<()> {
    let applied = SqliteStore::new(db_path).run_migrations().await?;
    println!("Applied {} migration(s)", applied);
    Ok(())
}

fn seat(participant: Option<&Participant>) -> String {
    match participant {
        Some(Participant::Human { player_id }) => player_id.clone(),
        Some(Participant::Bot { name }) => format!("{} (bot)", name),
        None => "-".to_string(),
    }
}

fn describe(record: &GameRecord, engine: &RuleEngine) -> String {
    let mut out = String::new();
    let board = engine.board();
    out.push_str(&format!("Game {} ({})\n", record.game_id, record.status));
    out.push_str(&format!(
        "White: {}  Red: {}  Cube: {}\n",
        seat(record.white.as_ref()),
        seat(record.red.as_ref()),
        engine.cube().value()
    ));

    for point in (1..=24u8).rev() {
        let stack = board.stack(point);
        if let Some(color) = stack.color()
            && stack.count() > 0
        {
            out.push_str(&format!("{:>3}: {} x{}\n", point, color, stack.count()));
        }
    }
    for color in [Color::White, Color::Red] {
        out.push_str(&format!(
            "{}: bar {} off {}\n",
            color,
            board.count(color, BAR),
            board.count(color, OFF)
        ));
    }

    out.push_str("\nHistory:\n");
    for (n, turn) in engine.log().iter().enumerate() {
        let dice = turn.dice.map(|d| d.to_string()).unwrap_or_default();
        out.push_str(&format!(
            "{:>3}. {} {} {}\n",
            n + 1,
            turn.player,
            dice,
            turn.moves.join(" ")
        ));
    }
    if !engine.history_notation().is_empty() {
        out.push_str(&format!(
            "  .. {} {}\n",
            engine.current_player(),
            engine.history_notation().join(" ")
        ));
    }

    match engine.result() {
        Some(result) => out.push_str(&format!(
            "\n{} wins {} point(s) ({:?}, {:?})\n",
            result.winner, result.points, result.win_type, result.reason
        )),
        None => out.push_str(&format!("\n{} to play\n", engine.current_player())),
    }
    out
}
