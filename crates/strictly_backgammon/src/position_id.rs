//! GNU Backgammon position IDs.
//!
//! A position ID is the 80-bit checker layout packed into ten bytes and
//! written as 14 base64 characters. Each side contributes, from its ace point
//! up to its 24-point and then the bar, one `1` bit per checker followed by
//! a `0` separator. The side not on roll is encoded first.

use crate::types::{BAR, Board, Color};
use tracing::instrument;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const KEY_BYTES: usize = 10;
const ID_LEN: usize = 14;

fn push_side(bits: &mut Vec<bool>, board: &Board, color: Color) {
    let points = (1..=24u8).map(|own| color.perspective(own)).chain([BAR]);
    for point in points {
        bits.extend(std::iter::repeat_n(true, usize::from(board.count(color, point))));
        bits.push(false);
    }
}

fn encode_base64(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let group = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        let chars = chunk.len() + 1;
        for i in 0..4 {
            if i < chars {
                let index = (group >> (18 - 6 * i)) & 0x3f;
                out.push(char::from(ALPHABET[index as usize]));
            } else {
                out.push('=');
            }
        }
    }
    out
}

/// Position ID for `board` with `on_roll` to act.
#[instrument(skip(board))]
pub fn position_id(board: &Board, on_roll: Color) -> String {
    let mut bits = Vec::with_capacity(KEY_BYTES * 8);
    push_side(&mut bits, board, on_roll.opponent());
    push_side(&mut bits, board, on_roll);

    let mut key = [0u8; KEY_BYTES];
    for (i, bit) in bits.iter().enumerate().take(KEY_BYTES * 8) {
        if *bit {
            key[i / 8] |= 1 << (i % 8);
        }
    }

    let mut id = encode_base64(&key);
    id.truncate(ID_LEN);
    id
}
