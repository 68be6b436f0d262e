/* Zobrist 哈希：每种棋子在每个格子上一个随机数，再加一个走棋方随机数 */
use common::Color;

use crate::board::{Chess, BOARD_HEIGHT, BOARD_WIDTH};

const CHESS_KINDS: usize = 14;

#[derive(Debug, Clone)]
pub struct Zobristable {
    chesses: [[[u64; BOARD_WIDTH as usize]; BOARD_HEIGHT as usize]; CHESS_KINDS],
    turn: u64,
}

impl Zobristable {
    pub fn with_seed(seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut chesses = [[[0u64; BOARD_WIDTH as usize]; BOARD_HEIGHT as usize]; CHESS_KINDS];
        for kind in chesses.iter_mut() {
            for row in kind.iter_mut() {
                for cell in row.iter_mut() {
                    *cell = rng.u64(..);
                }
            }
        }
        Zobristable {
            chesses,
            turn: rng.u64(..),
        }
    }

    fn index(chess: Chess) -> Option<usize> {
        match chess {
            Chess::Red(ct) => Some(ct.value() as usize),
            Chess::Black(ct) => Some(7 + ct.value() as usize),
            Chess::None => None,
        }
    }

    pub fn calc_chesses(
        &self,
        chesses: &[[Chess; BOARD_WIDTH as usize]; BOARD_HEIGHT as usize],
        turn: Color,
    ) -> u64 {
        let mut value = 0u64;
        for (i, row) in chesses.iter().enumerate() {
            for (j, chess) in row.iter().enumerate() {
                if let Some(k) = Self::index(*chess) {
                    value ^= self.chesses[k][i][j];
                }
            }
        }
        if turn == Color::Black {
            value ^= self.turn;
        }
        value
    }
}
