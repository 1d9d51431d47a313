//! Move choice and position evaluation for bot seats.
//!
//! The core does not play backgammon itself. It consumes two capabilities,
//! [`MoveChooser`] and [`PositionEvaluator`], and ships a client for the GNU
//! Backgammon HTTP service that provides both.

use crate::config::ServerConfig;
use crate::error::AnalysisError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strictly_backgammon::{BAR, BoardView, Color, Move, OFF, position_id};
use tracing::{debug, info, instrument, warn};

/// Lowest equity, from the taker's side, at which a double is taken.
pub const TAKE_POINT: f64 = -0.5;

/// Whether to take a double when the offerer's equity is `offerer_equity`.
pub fn should_take(offerer_equity: f64) -> bool {
    -offerer_equity >= TAKE_POINT
}

/// Picks checker plays for the side on roll.
#[async_trait]
pub trait MoveChooser: Send + Sync {
    /// One move for the current position, or `None` to defer to the
    /// caller's fallback.
    async fn choose_move(&self, view: &BoardView) -> Result<Option<Move>, AnalysisError>;

    /// The whole play for the roll, in order. Later moves are requests
    /// (`from`/`to` only) that the engine resolves when they are reached.
    async fn choose_play(&self, view: &BoardView) -> Result<Vec<Move>, AnalysisError> {
        Ok(self.choose_move(view).await?.into_iter().collect())
    }
}

/// Scores a position.
#[async_trait]
pub trait PositionEvaluator: Send + Sync {
    /// Cubeless equity for `view.on_roll`, roughly in `-3.0..=3.0`.
    async fn evaluate_position(&self, view: &BoardView) -> Result<f64, AnalysisError>;
}

/// Plays the first legal move.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstLegalMove;

#[async_trait]
impl MoveChooser for FirstLegalMove {
    async fn choose_move(&self, view: &BoardView) -> Result<Option<Move>, AnalysisError> {
        Ok(view.valid_moves.first().cloned())
    }
}

// ─────────────────────────────────────────────────────────────
//  GNU Backgammon service
// ─────────────────────────────────────────────────────────────

/// A ranked candidate play from `/hint-native`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintMove {
    /// 1 for the best play.
    pub rank: u32,
    /// gnubg notation from the perspective of the side on roll.
    pub notation: String,
    /// Equity after the play.
    pub equity: f64,
}

#[derive(Debug, Deserialize)]
struct HintResponse {
    moves: Vec<HintMove>,
}

/// Result of `/eval-native`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Evaluation {
    /// Cubeless equity for the side on roll.
    #[serde(default)]
    pub equity: f64,
    /// Probability of winning.
    #[serde(default)]
    pub win_prob: f64,
    /// Probability of winning a gammon or better.
    #[serde(default)]
    pub gammon_prob: f64,
    /// Probability of winning a backgammon.
    #[serde(default)]
    pub bg_prob: f64,
}

/// Result of `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// "ok" or "degraded".
    pub status: String,
    /// Whether the gnubg executable answered.
    pub gnubg_available: bool,
}

#[derive(Debug, Serialize)]
struct NativeRequest {
    position: String,
    dice: [u8; 2],
    player: &'static str,
    plies: u8,
}

/// Roll sent to `/eval-native` before the side on roll has rolled. The
/// service insists on dice but the evaluation does not depend on them.
const PLACEHOLDER_ROLL: [u8; 2] = [3, 1];

/// HTTP client for the GNU Backgammon analysis service.
#[derive(Debug, Clone)]
pub struct GnubgClient {
    base_url: String,
    plies: u8,
    client: reqwest::Client,
}

impl GnubgClient {
    /// Creates a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError`] if the HTTP client cannot be built.
    #[instrument(skip(base_url), fields(base_url = %base_url))]
    pub fn new(base_url: String, timeout: Duration, plies: u8) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        info!(plies, "Analysis client ready");
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            plies,
            client,
        })
    }

    /// Builds a client when the configuration names a service.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError`] if the HTTP client cannot be built.
    pub fn from_config(config: &ServerConfig) -> Result<Option<Self>, AnalysisError> {
        config
            .analysis_url()
            .clone()
            .map(|url| Self::new(url, config.analysis_timeout(), *config.analysis_plies()))
            .transpose()
    }

    fn request(&self, view: &BoardView, dice: [u8; 2]) -> NativeRequest {
        NativeRequest {
            position: position_id(&view.board, view.on_roll),
            dice,
            player: match view.on_roll {
                Color::White => "O",
                Color::Red => "X",
            },
            plies: self.plies,
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &NativeRequest,
    ) -> Result<T, AnalysisError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::GATEWAY_TIMEOUT {
            return Err(AnalysisError::new(format!("{} timed out in gnubg", path)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AnalysisError::new(format!(
                "{} returned {}: {}",
                path, status, text
            )));
        }
        Ok(response.json::<T>().await?)
    }

    /// Ranked plays for the roll in `view`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError`] before the roll or when the service fails.
    #[instrument(skip(self, view), fields(on_roll = %view.on_roll))]
    pub async fn hint(&self, view: &BoardView) -> Result<Vec<HintMove>, AnalysisError> {
        let dice = view
            .dice
            .ok_or_else(|| AnalysisError::new("cannot ask for a hint before rolling"))?;
        let (first, second) = dice.values();
        let response: HintResponse = self
            .post("/hint-native", &self.request(view, [first, second]))
            .await?;
        debug!(count = response.moves.len(), "Hints received");
        Ok(response.moves)
    }

    /// Full evaluation of `view`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError`] when the service fails.
    #[instrument(skip(self, view), fields(on_roll = %view.on_roll))]
    pub async fn evaluate(&self, view: &BoardView) -> Result<Evaluation, AnalysisError> {
        let dice = view
            .dice
            .map(|d| {
                let (first, second) = d.values();
                [first, second]
            })
            .unwrap_or(PLACEHOLDER_ROLL);
        self.post("/eval-native", &self.request(view, dice)).await
    }

    /// Service health.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError`] if the service is unreachable.
    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<ServiceHealth, AnalysisError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.json::<ServiceHealth>().await?)
    }
}

#[async_trait]
impl MoveChooser for GnubgClient {
    async fn choose_move(&self, view: &BoardView) -> Result<Option<Move>, AnalysisError> {
        let play = self.choose_play(view).await?;
        Ok(play.first().and_then(|request| {
            view.valid_moves
                .iter()
                .filter(|m| m.from == request.from && m.to == request.to)
                .min_by_key(|m| m.die_value)
                .cloned()
        }))
    }

    async fn choose_play(&self, view: &BoardView) -> Result<Vec<Move>, AnalysisError> {
        let hints = self.hint(view).await?;
        let Some(best) = hints.iter().min_by_key(|h| h.rank) else {
            return Ok(Vec::new());
        };
        let hops = hint_hops(&best.notation, view.on_roll)?;
        debug!(notation = %best.notation, ?hops, "Best play");
        Ok(hops
            .into_iter()
            .map(|(from, to)| Move::request(from, to, None))
            .collect())
    }
}

#[async_trait]
impl PositionEvaluator for GnubgClient {
    async fn evaluate_position(&self, view: &BoardView) -> Result<f64, AnalysisError> {
        Ok(self.evaluate(view).await?.equity)
    }
}

/// Splits gnubg play notation into single hops in absolute points.
///
/// gnubg writes every play from the side on roll's point of view, marks hits
/// with `*`, and repeats identical moves with a `(n)` suffix: `8/5(2) 6/1*`,
/// `bar/22`, `13/7*/4`, `6/off`.
pub(crate) fn hint_hops(notation: &str, on_roll: Color) -> Result<Vec<(u8, u8)>, AnalysisError> {
    let invalid = || AnalysisError::new(format!("unparseable hint '{}'", notation));
    let mut hops = Vec::new();

    for token in notation.split_whitespace() {
        let (route, repeat) = match token.strip_suffix(')').and_then(|t| t.split_once('(')) {
            Some((route, count)) => (route, count.parse::<usize>().map_err(|_| invalid())?),
            None => (token, 1),
        };
        let points = route
            .split('/')
            .map(|label| match label.trim_end_matches('*') {
                "bar" => Ok(BAR),
                "off" => Ok(OFF),
                digits => digits
                    .parse::<u8>()
                    .ok()
                    .filter(|p| (1..=24).contains(p))
                    .map(|p| on_roll.perspective(p))
                    .ok_or_else(invalid),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if points.len() < 2 {
            return Err(invalid());
        }
        for _ in 0..repeat {
            hops.extend(points.windows(2).map(|w| (w[0], w[1])));
        }
    }

    if hops.is_empty() {
        warn!(notation, "Hint contained no moves");
    }
    Ok(hops)
}
