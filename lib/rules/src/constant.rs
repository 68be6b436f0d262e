use crate::{board::*, zobrist::*};
use std::{collections::HashMap, sync::LazyLock};

/// 固定种子，保证不同进程、不同次运行算出的哈希一致（书库按哈希存储）
pub const ZOBRIST_SEED: u64 = 0x5851_F42D_4C95_7F2D;

pub static FEN_MAP: LazyLock<HashMap<char, Chess>> = LazyLock::new(|| {
    HashMap::from([
        ('k', Chess::Black(ChessType::King)),
        ('a', Chess::Black(ChessType::Advisor)),
        ('b', Chess::Black(ChessType::Bishop)),
        ('n', Chess::Black(ChessType::Knight)),
        ('r', Chess::Black(ChessType::Rook)),
        ('c', Chess::Black(ChessType::Cannon)),
        ('p', Chess::Black(ChessType::Pawn)),
        ('K', Chess::Red(ChessType::King)),
        ('A', Chess::Red(ChessType::Advisor)),
        ('B', Chess::Red(ChessType::Bishop)),
        ('N', Chess::Red(ChessType::Knight)),
        ('R', Chess::Red(ChessType::Rook)),
        ('C', Chess::Red(ChessType::Cannon)),
        ('P', Chess::Red(ChessType::Pawn)),
    ])
});
pub static ZOBRIST_TABLE: LazyLock<Zobristable> = LazyLock::new(|| Zobristable::with_seed(ZOBRIST_SEED));
