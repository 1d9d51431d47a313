//! The backgammon rule engine.
//!
//! `RuleEngine` owns the board, dice, cube and the current turn's move
//! history. It is deterministic and free of I/O: dice come from a caller
//! supplied [`DiceRoller`], and every operation either fully applies or
//! returns a [`RuleError`] without touching state.

use crate::cube::{DEFAULT_MAX_CUBE, DoublingCube};
use crate::generator;
use crate::invariants::{BackgammonInvariants, InvariantSet};
use crate::moves::AppliedMove;
use crate::notation;
use crate::types::{Board, CHECKERS_PER_SIDE, Color};
use crate::{Dice, DiceRoller, Move, RuleError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// How decisively a game was won.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum WinType {
    /// Loser bore off at least one checker.
    Normal,
    /// Loser bore off nothing.
    Gammon,
    /// Loser bore off nothing and still has a checker on the bar or in the
    /// winner's home board.
    Backgammon,
}

impl WinType {
    /// Points multiplier applied to the cube value.
    pub fn multiplier(self) -> u32 {
        match self {
            WinType::Normal => 1,
            WinType::Gammon => 2,
            WinType::Backgammon => 3,
        }
    }
}

/// Why a game ended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum EndReason {
    /// The winner bore off all fifteen checkers.
    BorneOff,
    /// The loser refused a double.
    DoubleDeclined,
    /// The loser resigned.
    Resigned,
    /// The loser ran out of time on a correspondence move.
    Timeout,
}

/// Final result of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameResult {
    /// Winning side.
    pub winner: Color,
    /// Normal, gammon or backgammon.
    pub win_type: WinType,
    /// Cube value the game was decided at.
    pub cube_value: u32,
    /// `cube_value * win_type.multiplier()`.
    pub points: u32,
    /// How the game ended.
    pub reason: EndReason,
}

impl GameResult {
    fn new(winner: Color, win_type: WinType, cube_value: u32, reason: EndReason) -> Self {
        Self {
            winner,
            win_type,
            cube_value,
            points: cube_value * win_type.multiplier(),
            reason,
        }
    }
}

/// A completed turn kept for the game record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Side that moved.
    pub player: Color,
    /// Roll for the turn.
    pub dice: Option<Dice>,
    /// Notation of every move played, in order.
    pub moves: Vec<String>,
}

/// Read-only position handed to move-choosing and evaluating collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardView {
    /// Current board.
    pub board: Board,
    /// Side to act.
    pub on_roll: Color,
    /// Roll for the turn, if rolled.
    pub dice: Option<Dice>,
    /// Unused dice.
    pub remaining_moves: Vec<u8>,
    /// Legal moves including combined ones.
    pub valid_moves: Vec<Move>,
    /// Cube state.
    pub cube: DoublingCube,
    /// Whether the cube is disabled for this game.
    pub crawford: bool,
}

/// Plain-data image of an engine, suitable for persistence.
///
/// The current turn is stored as the board at the start of the turn plus the
/// notation of each move played since; restoring replays those moves, so the
/// undo history survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Board after all moves so far.
    pub board: Board,
    /// Board before the first move of the current turn.
    pub turn_start_board: Board,
    /// Side on move.
    pub current_player: Color,
    /// Roll for the current turn, if rolled.
    pub dice: Option<Dice>,
    /// Unused dice.
    pub remaining_moves: Vec<u8>,
    /// Notation of moves played this turn.
    pub history: Vec<String>,
    /// Cube state.
    pub cube: DoublingCube,
    /// Crawford game flag.
    pub crawford: bool,
    /// Cube ceiling.
    pub max_cube: u32,
    /// Result once the game is over.
    pub result: Option<GameResult>,
    /// Completed turns.
    pub log: Vec<TurnRecord>,
}

/// Deterministic backgammon rules and state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEngine {
    board: Board,
    turn_start_board: Board,
    current: Color,
    dice: Option<Dice>,
    remaining: Vec<u8>,
    history: Vec<AppliedMove>,
    cube: DoublingCube,
    crawford: bool,
    max_cube: u32,
    result: Option<GameResult>,
    log: Vec<TurnRecord>,
}

// ─────────────────────────────────────────────────────────────
//  Construction
// ─────────────────────────────────────────────────────────────

impl RuleEngine {
    /// A fresh game from the opening position, White to move.
    #[instrument]
    pub fn new() -> Self {
        Self::with_options(false, DEFAULT_MAX_CUBE)
    }

    /// A fresh game with an explicit Crawford flag and cube ceiling.
    #[instrument]
    pub fn with_options(crawford: bool, max_cube: u32) -> Self {
        let board = Board::opening();
        Self {
            turn_start_board: board.clone(),
            board,
            current: Color::White,
            dice: None,
            remaining: Vec::new(),
            history: Vec::new(),
            cube: DoublingCube::new(),
            crawford,
            max_cube,
            result: None,
            log: Vec::new(),
        }
    }

    /// Starts a game from an arbitrary position with `to_move` on roll.
    ///
    /// Used for analysis and test fixtures; the board is taken as-is.
    #[instrument(skip(board))]
    pub fn from_position(board: Board, to_move: Color) -> Self {
        let mut engine = Self::new();
        engine.turn_start_board = board.clone();
        engine.board = board;
        engine.current = to_move;
        engine
    }

    /// Resets to the opening position, keeping the Crawford flag and ceiling.
    #[instrument(skip(self))]
    pub fn new_game(&mut self) {
        info!("Resetting to opening position");
        *self = Self::with_options(self.crawford, self.max_cube);
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────
//  Accessors
// ─────────────────────────────────────────────────────────────

impl RuleEngine {
    /// Current board.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Side on move.
    pub fn current_player(&self) -> Color {
        self.current
    }

    /// This turn's roll, `None` before rolling.
    pub fn dice(&self) -> Option<Dice> {
        self.dice
    }

    /// Unused die values, largest first.
    pub fn remaining_moves(&self) -> &[u8] {
        &self.remaining
    }

    /// Moves applied this turn.
    pub fn history(&self) -> &[AppliedMove] {
        &self.history
    }

    /// Notation tokens for this turn's moves.
    pub fn history_notation(&self) -> Vec<String> {
        self.history.iter().map(AppliedMove::notation).collect()
    }

    /// Cube state.
    pub fn cube(&self) -> &DoublingCube {
        &self.cube
    }

    /// Whether the cube is disabled for this game.
    pub fn is_crawford(&self) -> bool {
        self.crawford
    }

    /// Result once the game has ended.
    pub fn result(&self) -> Option<&GameResult> {
        self.result.as_ref()
    }

    /// True once a result exists.
    pub fn is_over(&self) -> bool {
        self.result.is_some()
    }

    /// Completed turns.
    pub fn log(&self) -> &[TurnRecord] {
        &self.log
    }

    /// Whether `by` may offer a double right now.
    pub fn can_offer_double(&self, by: Color) -> bool {
        self.check_offer(by).is_ok()
    }

    /// Whether the current player may end the turn right now.
    pub fn can_end_turn(&self) -> bool {
        self.dice.is_some()
            && self.result.is_none()
            && (self.remaining.is_empty() || self.valid_moves(true).is_empty())
    }

    /// Position handed to AI collaborators.
    pub fn board_view(&self) -> BoardView {
        BoardView {
            board: self.board.clone(),
            on_roll: self.current,
            dice: self.dice,
            remaining_moves: self.remaining.clone(),
            valid_moves: self.valid_moves(true),
            cube: self.cube,
            crawford: self.crawford,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Turn flow
// ─────────────────────────────────────────────────────────────

impl RuleEngine {
    fn ensure_in_progress(&self) -> Result<(), RuleError> {
        if self.result.is_some() {
            Err(RuleError::GameOver)
        } else {
            Ok(())
        }
    }

    /// Rolls for the current player.
    ///
    /// # Errors
    ///
    /// [`RuleError::TurnNotReady`] if dice were already rolled this turn,
    /// [`RuleError::DoublePending`] while an offer is unanswered.
    #[instrument(skip(self, roller), fields(player = %self.current))]
    pub fn roll_dice(&mut self, roller: &mut dyn DiceRoller) -> Result<Dice, RuleError> {
        self.check_roll()?;
        let dice = roller.roll();
        self.apply_roll(dice);
        Ok(dice)
    }

    /// Uses a known roll instead of a roller, with the same checks as
    /// [`RuleEngine::roll_dice`].
    #[instrument(skip(self), fields(player = %self.current))]
    pub fn set_dice(&mut self, dice: Dice) -> Result<Dice, RuleError> {
        self.check_roll()?;
        self.apply_roll(dice);
        Ok(dice)
    }

    fn check_roll(&self) -> Result<(), RuleError> {
        self.ensure_in_progress()?;
        if self.cube.pending_offer().is_some() {
            return Err(RuleError::DoublePending);
        }
        if !self.remaining.is_empty() || self.dice.is_some() {
            return Err(RuleError::TurnNotReady);
        }
        Ok(())
    }

    fn apply_roll(&mut self, dice: Dice) {
        self.dice = Some(dice);
        self.remaining = dice.moves();
        self.turn_start_board = self.board.clone();
        info!(player = %self.current, dice = %dice, "Dice rolled");
    }

    /// Every legal move for the current player.
    ///
    /// Empty before rolling, once the dice are used, or after the game ends.
    pub fn valid_moves(&self, include_combined: bool) -> Vec<Move> {
        if self.result.is_some() || self.remaining.is_empty() {
            return Vec::new();
        }
        generator::legal_moves(&self.board, self.current, &self.remaining, include_combined)
    }

    /// Finds the legal move joining `from` and `to`.
    ///
    /// With `die` of `None` the smallest qualifying die is chosen, which
    /// prefers an exact bear-off over an oversized one.
    pub fn find_move(&self, from: u8, to: u8, die: Option<u8>) -> Option<Move> {
        self.valid_moves(true)
            .into_iter()
            .filter(|m| m.from == from && m.to == to)
            .filter(|m| die.is_none_or(|d| m.die_value == d))
            .min_by_key(|m| m.die_value)
    }

    /// Resolves a requested move against the legal set, honouring an
    /// explicit route for combined moves.
    fn resolve(&self, requested: &Move) -> Option<Move> {
        let legal = self.valid_moves(true);

        if requested.is_combined && !requested.intermediate_points.is_empty() {
            let listed = legal.iter().find(|m| m.same_play(requested))?;
            if listed.intermediate_points == requested.intermediate_points {
                return Some(listed.clone());
            }
            if !self.dice_available(&requested.dice_used) {
                return None;
            }
            let legs = generator::play_route(
                &self.board,
                self.current,
                requested.from,
                &requested.dice_used,
            )?;
            let routed = Move::from_legs(&legs);
            return (routed.to == requested.to).then_some(routed);
        }

        let die = (requested.die_value > 0).then_some(requested.die_value);
        legal
            .into_iter()
            .filter(|m| m.from == requested.from && m.to == requested.to)
            .filter(|m| die.is_none_or(|d| m.die_value == d))
            .min_by_key(|m| m.die_value)
    }

    fn dice_available(&self, dice: &[u8]) -> bool {
        let mut pool = self.remaining.clone();
        dice.iter().all(|d| match pool.iter().position(|r| r == d) {
            Some(pos) => {
                pool.remove(pos);
                true
            }
            None => false,
        })
    }

    /// Executes a move that is currently legal.
    ///
    /// # Errors
    ///
    /// [`RuleError::IllegalMove`] if `mv` is not in [`RuleEngine::valid_moves`].
    #[instrument(skip(self, mv), fields(player = %self.current, mv = %mv))]
    pub fn execute_move(&mut self, mv: &Move) -> Result<&AppliedMove, RuleError> {
        self.ensure_in_progress()?;
        if self.dice.is_none() {
            return Err(RuleError::DiceNotRolled);
        }
        let resolved = self.resolve(mv).ok_or_else(|| {
            warn!(from = mv.from, to = mv.to, "Rejected illegal move");
            RuleError::IllegalMove {
                from: mv.from,
                to: mv.to,
            }
        })?;

        let color = self.current;
        let mut legs = Vec::with_capacity(resolved.dice_used.len());
        let mut at = resolved.from;
        let mut waypoints = resolved.intermediate_points.clone();
        waypoints.push(resolved.to);
        for (die, to) in resolved.dice_used.iter().zip(waypoints) {
            let hit = self.board.apply_leg(color, at, to);
            legs.push(crate::types::Leg {
                from: at,
                to,
                die: *die,
                hit,
            });
            at = to;
        }
        for die in &resolved.dice_used {
            if let Some(pos) = self.remaining.iter().position(|r| r == die) {
                self.remaining.remove(pos);
            }
        }

        let applied = AppliedMove::new(resolved, legs);
        debug!(notation = %applied.notation(), remaining = ?self.remaining, "Move executed");
        self.history.push(applied);

        if self.board.player(color).checkers_borne_off() == CHECKERS_PER_SIDE {
            let result = self.score_bear_off(color);
            info!(winner = %color, win_type = %result.win_type, points = result.points, "Game won");
            self.result = Some(result);
            self.remaining.clear();
        }

        self.debug_check();
        self.history
            .last()
            .ok_or(RuleError::NothingToUndo)
    }

    /// Parses and executes a notation token for the current player.
    ///
    /// # Errors
    ///
    /// [`RuleError::InvalidNotation`] or any error of
    /// [`RuleEngine::execute_move`].
    pub fn execute_notation(&mut self, token: &str) -> Result<&AppliedMove, RuleError> {
        let mv = notation::parse(token, self.current)?;
        self.execute_move(&mv)
    }

    /// Reverts the most recent move of this turn.
    ///
    /// # Errors
    ///
    /// [`RuleError::NothingToUndo`] when no move was played this turn.
    #[instrument(skip(self), fields(player = %self.current))]
    pub fn undo_last_move(&mut self) -> Result<Move, RuleError> {
        self.ensure_in_progress()?;
        let applied = self.history.pop().ok_or(RuleError::NothingToUndo)?;
        for leg in applied.legs().iter().rev() {
            self.board.revert_leg(self.current, leg);
        }
        self.remaining.extend(&applied.mv().dice_used);
        self.remaining.sort_unstable_by(|a, b| b.cmp(a));
        debug!(notation = %applied.notation(), "Move undone");
        self.debug_check();
        Ok(applied.mv().clone())
    }

    /// Ends the current turn and passes the dice.
    ///
    /// # Errors
    ///
    /// [`RuleError::MovesRemaining`] while a remaining die can be played.
    #[instrument(skip(self), fields(player = %self.current))]
    pub fn end_turn(&mut self) -> Result<(), RuleError> {
        self.ensure_in_progress()?;
        if self.dice.is_none() {
            return Err(RuleError::DiceNotRolled);
        }
        if !self.remaining.is_empty() && !self.valid_moves(true).is_empty() {
            return Err(RuleError::MovesRemaining);
        }

        self.log.push(TurnRecord {
            player: self.current,
            dice: self.dice,
            moves: self.history_notation(),
        });
        self.history.clear();
        self.remaining.clear();
        self.dice = None;
        self.current = self.current.opponent();
        self.turn_start_board = self.board.clone();
        info!(next = %self.current, "Turn ended");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Doubling cube and concessions
// ─────────────────────────────────────────────────────────────

impl RuleEngine {
    fn check_offer(&self, by: Color) -> Result<(), RuleError> {
        self.ensure_in_progress()?;
        if by != self.current {
            return Err(RuleError::WrongPlayer(by));
        }
        if self.crawford {
            return Err(RuleError::CrawfordGame);
        }
        if self.dice.is_some() {
            return Err(RuleError::DoubleAfterRoll);
        }
        self.cube.check_offer(by, self.max_cube)
    }

    /// Offers a double before rolling.
    ///
    /// # Errors
    ///
    /// Refused in the Crawford game, after rolling, when the opponent owns
    /// the cube, at the ceiling, or when it is not `by`'s turn.
    #[instrument(skip(self))]
    pub fn offer_double(&mut self, by: Color) -> Result<(), RuleError> {
        self.check_offer(by)?;
        self.cube.offer(by);
        info!(proposer = %by, value = self.cube.value() * 2, "Double offered");
        Ok(())
    }

    fn responder(&self, by: Color) -> Result<(), RuleError> {
        self.ensure_in_progress()?;
        let offer = self.cube.pending_offer().ok_or(RuleError::NoPendingOffer)?;
        if offer.proposer == by {
            return Err(RuleError::WrongPlayer(by));
        }
        Ok(())
    }

    /// Takes the pending double; `by` becomes cube owner.
    ///
    /// # Errors
    ///
    /// [`RuleError::NoPendingOffer`], or [`RuleError::WrongPlayer`] when the
    /// proposer tries to answer their own offer.
    #[instrument(skip(self))]
    pub fn accept_double(&mut self, by: Color) -> Result<(), RuleError> {
        self.responder(by)?;
        self.cube.accept(by)?;
        info!(acceptor = %by, value = self.cube.value(), "Double accepted");
        self.debug_check();
        Ok(())
    }

    /// Refuses the pending double; the proposer wins at the current value.
    ///
    /// # Errors
    ///
    /// As for [`RuleEngine::accept_double`].
    #[instrument(skip(self))]
    pub fn decline_double(&mut self, by: Color) -> Result<GameResult, RuleError> {
        self.responder(by)?;
        self.cube.clear_offer();
        let result = GameResult::new(
            by.opponent(),
            WinType::Normal,
            self.cube.value(),
            EndReason::DoubleDeclined,
        );
        info!(winner = %result.winner, points = result.points, "Double declined");
        self.result = Some(result);
        Ok(result)
    }

    /// `loser` concedes a single game at the current cube value.
    ///
    /// # Errors
    ///
    /// [`RuleError::GameOver`] if the game already ended.
    #[instrument(skip(self))]
    pub fn concede(&mut self, loser: Color, reason: EndReason) -> Result<GameResult, RuleError> {
        self.ensure_in_progress()?;
        self.cube.clear_offer();
        let result = GameResult::new(loser.opponent(), WinType::Normal, self.cube.value(), reason);
        info!(winner = %result.winner, reason = %reason, "Game conceded");
        self.result = Some(result);
        Ok(result)
    }

    fn score_bear_off(&self, winner: Color) -> GameResult {
        let loser = winner.opponent();
        let loser_state = self.board.player(loser);
        let win_type = if loser_state.checkers_borne_off() > 0 {
            WinType::Normal
        } else {
            let stuck_in_home = (1..=24u8)
                .filter(|p| winner.is_home(*p))
                .any(|p| self.board.stack(p).is_owned_by(loser));
            if loser_state.checkers_on_bar() > 0 || stuck_in_home {
                WinType::Backgammon
            } else {
                WinType::Gammon
            }
        };
        GameResult::new(winner, win_type, self.cube.value(), EndReason::BorneOff)
    }
}

// ─────────────────────────────────────────────────────────────
//  Snapshots
// ─────────────────────────────────────────────────────────────

impl RuleEngine {
    /// Captures the engine as plain data.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            board: self.board.clone(),
            turn_start_board: self.turn_start_board.clone(),
            current_player: self.current,
            dice: self.dice,
            remaining_moves: self.remaining.clone(),
            history: self.history_notation(),
            cube: self.cube,
            crawford: self.crawford,
            max_cube: self.max_cube,
            result: self.result,
            log: self.log.clone(),
        }
    }

    /// Rebuilds an engine from a snapshot.
    ///
    /// Starts from the turn-start board and replays the turn's notation, so
    /// the move history (and therefore undo) is exactly what it was. The
    /// replayed board and dice must match the stored ones.
    ///
    /// # Errors
    ///
    /// [`RuleError::SnapshotMismatch`] if a token fails to replay or the
    /// result disagrees with the stored board.
    #[instrument(skip(snapshot), fields(player = %snapshot.current_player, moves = snapshot.history.len()))]
    pub fn restore(snapshot: EngineSnapshot) -> Result<Self, RuleError> {
        let mut engine = Self {
            board: snapshot.turn_start_board.clone(),
            turn_start_board: snapshot.turn_start_board,
            current: snapshot.current_player,
            dice: snapshot.dice,
            remaining: snapshot.dice.map(|d| d.moves()).unwrap_or_default(),
            history: Vec::new(),
            cube: snapshot.cube,
            crawford: snapshot.crawford,
            max_cube: snapshot.max_cube,
            result: None,
            log: snapshot.log,
        };

        for token in &snapshot.history {
            engine
                .execute_notation(token)
                .map_err(|e| RuleError::SnapshotMismatch(format!("{}: {}", token, e)))?;
        }

        if engine.board != snapshot.board {
            return Err(RuleError::SnapshotMismatch(
                "replayed board differs from stored board".to_string(),
            ));
        }
        let mut expected = snapshot.remaining_moves;
        expected.sort_unstable_by(|a, b| b.cmp(a));
        if snapshot.result.is_none() && engine.remaining != expected {
            return Err(RuleError::SnapshotMismatch(format!(
                "remaining dice {:?} differ from stored {:?}",
                engine.remaining, expected
            )));
        }

        engine.result = snapshot.result;
        if engine.result.is_some() {
            engine.remaining.clear();
        }
        debug!("Engine restored from snapshot");
        Ok(engine)
    }

    fn debug_check(&self) {
        debug_assert_eq!(BackgammonInvariants::check_all(self), Ok(()));
    }
}
