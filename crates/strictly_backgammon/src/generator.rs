//! Legal move generation.
//!
//! Pure functions of (board, color, remaining dice). Nothing here is cached:
//! combined moves are validated leg by leg against a scratch copy of the
//! board, so every intermediate landing, hit and bear-off is judged on the
//! position as it would be at that moment.

use crate::types::{BAR, Board, Color, Leg, OFF};
use crate::Move;
use tracing::{debug, instrument};

/// A single hop of `die` pips for the checker on `from`, if legal.
///
/// Bearing off requires every checker home. An exact die always bears off;
/// a larger die only from the farthest occupied point, judged on `board` as
/// it stands (which, for later legs of a combined move, already reflects the
/// earlier legs).
pub fn single_leg(board: &Board, color: Color, from: u8, die: u8) -> Option<Leg> {
    if board.count(color, from) == 0 {
        return None;
    }

    if let Some(to) = color.advance(from, die) {
        return board.is_open_for(color, to).then(|| Leg {
            from,
            to,
            die,
            hit: board.is_blot_against(color, to),
        });
    }

    if from == BAR || !board.all_home(color) {
        return None;
    }
    let distance = color.pips_to_off(from);
    let bears_off =
        die == distance || (die > distance && board.farthest_point(color) == Some(from));
    bears_off.then_some(Leg {
        from,
        to: OFF,
        die,
        hit: false,
    })
}

/// Plays `dice` in order starting from `from` on a scratch board.
///
/// Returns the legs if every hop is legal and only the final hop bears off.
pub fn play_route(board: &Board, color: Color, from: u8, dice: &[u8]) -> Option<Vec<Leg>> {
    let mut scratch = board.clone();
    let mut legs = Vec::with_capacity(dice.len());
    let mut at = from;
    for (i, die) in dice.iter().enumerate() {
        let leg = single_leg(&scratch, color, at, *die)?;
        if leg.to == OFF && i + 1 != dice.len() {
            return None;
        }
        let hit = scratch.apply_leg(color, leg.from, leg.to);
        legs.push(Leg { hit, ..leg });
        at = leg.to;
    }
    Some(legs)
}

fn distinct_desc(dice: &[u8]) -> Vec<u8> {
    let mut values = dice.to_vec();
    values.sort_unstable_by(|a, b| b.cmp(a));
    values.dedup();
    values
}

/// Every distinct ordering of every sub-multiset of `dice` with at least two
/// elements, shortest first.
pub(crate) fn dice_sequences(dice: &[u8]) -> Vec<Vec<u8>> {
    fn extend(prefix: &mut Vec<u8>, pool: &mut Vec<u8>, out: &mut Vec<Vec<u8>>) {
        if prefix.len() >= 2 {
            out.push(prefix.clone());
        }
        for value in distinct_desc(pool) {
            if let Some(pos) = pool.iter().position(|d| *d == value) {
                pool.remove(pos);
                prefix.push(value);
                extend(prefix, pool, out);
                prefix.pop();
                pool.insert(pos, value);
            }
        }
    }

    let mut out = Vec::new();
    extend(&mut Vec::new(), &mut dice.to_vec(), &mut out);
    out.sort_by_key(Vec::len);
    out
}

/// Single-die moves. While checkers are on the bar, only entries.
#[instrument(skip(board))]
pub fn simple_moves(board: &Board, color: Color, remaining: &[u8]) -> Vec<Move> {
    singles(board, color, remaining)
}

fn singles(board: &Board, color: Color, remaining: &[u8]) -> Vec<Move> {
    let dice = distinct_desc(remaining);
    let sources: Vec<u8> = if board.player(color).checkers_on_bar() > 0 {
        vec![BAR]
    } else {
        color.points_back_to_front().collect()
    };

    let mut moves = Vec::new();
    for from in sources {
        for die in &dice {
            if let Some(leg) = single_leg(board, color, from, *die) {
                moves.push(Move::from_legs(&[leg]));
            }
        }
    }
    moves
}

/// Multi-die moves from each source point, excluding destinations a single
/// die already reaches from the same source. Never offered while the bar is
/// occupied.
#[instrument(skip(board, simple))]
pub fn combined_moves(board: &Board, color: Color, remaining: &[u8], simple: &[Move]) -> Vec<Move> {
    if remaining.len() < 2 || board.player(color).checkers_on_bar() > 0 {
        return Vec::new();
    }

    let sequences = dice_sequences(remaining);
    let mut moves: Vec<Move> = Vec::new();
    for from in color.points_back_to_front() {
        if board.count(color, from) == 0 {
            continue;
        }
        for dice in &sequences {
            let Some(legs) = play_route(board, color, from, dice) else {
                continue;
            };
            let candidate = Move::from_legs(&legs);
            let reachable_by_one = simple
                .iter()
                .any(|m| m.from == candidate.from && m.to == candidate.to);
            let already_listed = moves
                .iter()
                .any(|m| m.from == candidate.from && m.to == candidate.to);
            if !reachable_by_one && !already_listed {
                moves.push(candidate);
            }
        }
    }
    moves
}

/// `remaining` with one copy of each die in `used` taken out.
fn without(remaining: &[u8], used: &[u8]) -> Vec<u8> {
    let mut rest = remaining.to_vec();
    for die in used {
        if let Some(pos) = rest.iter().position(|d| d == die) {
            rest.remove(pos);
        }
    }
    rest
}

/// The board after `mv`, replayed leg by leg.
fn after_move(board: &Board, color: Color, mv: &Move) -> Option<Board> {
    let legs = play_route(board, color, mv.from, &mv.dice_used)?;
    let mut scratch = board.clone();
    for leg in legs {
        scratch.apply_leg(color, leg.from, leg.to);
    }
    Some(scratch)
}

/// Most dice `color` can still play, one checker hop at a time.
fn max_playable(board: &Board, color: Color, remaining: &[u8]) -> usize {
    let mut best = 0;
    for mv in singles(board, color, remaining) {
        if best == remaining.len() {
            break;
        }
        let mut scratch = board.clone();
        scratch.apply_leg(color, mv.from, mv.to);
        let rest = without(remaining, &mv.dice_used);
        best = best.max(1 + max_playable(&scratch, color, &rest));
    }
    best
}

/// All legal moves for `color` with `remaining` dice.
///
/// A move is offered only if the dice left after it can still be played up
/// to the most that any sequence from this position plays. When that most
/// is a single die of a non-double pair and the larger die is playable,
/// only the larger die is offered.
#[instrument(skip(board))]
pub fn legal_moves(board: &Board, color: Color, remaining: &[u8], include_combined: bool) -> Vec<Move> {
    let simple = simple_moves(board, color, remaining);
    let mut moves = if include_combined {
        let combined = combined_moves(board, color, remaining, &simple);
        let mut all = simple;
        all.extend(combined);
        all
    } else {
        simple
    };

    let most = max_playable(board, color, remaining);
    let offered = moves.len();
    moves.retain(|mv| {
        after_move(board, color, mv).is_some_and(|after| {
            let rest = without(remaining, &mv.dice_used);
            mv.dice_used.len() + max_playable(&after, color, &rest) >= most
        })
    });
    if moves.len() < offered {
        debug!(most, dropped = offered - moves.len(), "Dropped moves that waste a die");
    }

    if most == 1
        && let [a, b] = remaining
        && a != b
    {
        let high = (*a).max(*b);
        if moves.iter().any(|m| m.die_value == high) {
            debug!(high, "Only one die playable, restricting to the larger");
            moves.retain(|m| m.die_value == high);
        }
    }

    moves
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_sequences_grow_to_four() {
        let seqs = dice_sequences(&[3, 3, 3, 3]);
        assert_eq!(seqs, vec![vec![3, 3], vec![3, 3, 3], vec![3, 3, 3, 3]]);
    }

    #[test]
    fn pair_sequences_have_both_orders() {
        let seqs = dice_sequences(&[6, 1]);
        assert_eq!(seqs, vec![vec![6, 1], vec![1, 6]]);
    }

    #[test]
    fn bar_entry_only_while_on_bar() {
        let mut board = Board::opening();
        board.set_point(24, Color::White, 1);
        board.set_bar(Color::White, 1);
        let moves = legal_moves(&board, Color::White, &[6, 1], true);
        assert!(!moves.is_empty());
        assert!(moves.iter().all(|m| m.from == BAR && !m.is_combined));
        // Red holds 19 with five checkers, so a six cannot enter.
        assert!(moves.iter().all(|m| m.to != 19));
        assert!(moves.iter().any(|m| m.to == 24 && m.die_value == 1));
    }

    #[test]
    fn exact_and_oversized_bear_off() {
        let mut board = Board::empty();
        board.set_point(4, Color::White, 1);
        board.set_point(2, Color::White, 1);
        board.set_borne_off(Color::White, 13);

        let sixes = simple_moves(&board, Color::White, &[6]);
        assert_eq!(sixes.len(), 1);
        assert_eq!((sixes[0].from, sixes[0].to), (4, OFF));

        let twos = simple_moves(&board, Color::White, &[2]);
        assert!(twos.iter().any(|m| m.from == 2 && m.to == OFF));
        assert!(twos.iter().any(|m| m.from == 4 && m.to == 2));
    }

    #[test]
    fn no_bear_off_with_checker_outside() {
        let mut board = Board::empty();
        board.set_point(7, Color::White, 1);
        board.set_point(3, Color::White, 1);
        board.set_borne_off(Color::White, 13);
        let moves = simple_moves(&board, Color::White, &[3]);
        assert!(moves.iter().all(|m| m.to != OFF));
    }

    #[test]
    fn larger_die_forced_when_only_one_playable() {
        // 24/20 and 24/21 are each open, but 17 is blocked so the checker
        // cannot continue with the other die.
        let mut board = Board::empty();
        board.set_point(24, Color::White, 1);
        board.set_borne_off(Color::White, 14);
        board.set_point(17, Color::Red, 2);
        board.set_borne_off(Color::Red, 13);

        let moves = legal_moves(&board, Color::White, &[4, 3], true);
        assert_eq!(moves.len(), 1, "{moves:?}");
        assert_eq!((moves[0].from, moves[0].to, moves[0].die_value), (24, 20, 4));
    }

    #[test]
    fn moves_that_strand_a_die_are_dropped() {
        let mut board = Board::empty();
        board.set_point(24, Color::White, 1);
        board.set_point(8, Color::White, 1);
        board.set_borne_off(Color::White, 13);
        board.set_point(17, Color::Red, 2);
        board.set_point(7, Color::Red, 2);
        board.set_borne_off(Color::Red, 11);

        let moves = legal_moves(&board, Color::White, &[6, 1], true);
        let plays: Vec<(u8, u8)> = moves.iter().map(|m| (m.from, m.to)).collect();
        assert!(!plays.contains(&(24, 18)), "{plays:?}");
        assert!(plays.contains(&(24, 23)));
        assert!(plays.contains(&(8, 2)));
        assert!(plays.contains(&(8, 1)));
    }

    #[test]
    fn max_playable_counts_doubles() {
        let mut board = Board::empty();
        board.set_point(24, Color::White, 1);
        board.set_borne_off(Color::White, 14);
        board.set_point(15, Color::Red, 2);
        board.set_borne_off(Color::Red, 13);
        assert_eq!(max_playable(&board, Color::White, &[3, 3, 3, 3]), 2);
        assert_eq!(max_playable(&board, Color::White, &[]), 0);
    }
}
