use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;

use crate::Color;

/// 空棋盘，编辑局面时的占位
pub const EMPTY_BOARD: &str = "9/9/9/9/9/9/9/9/9/9";
pub const START_POSITION: &str = "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w";

static FEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<board>[kabnrcpKABNRCP1-9/]+) (?P<side>[wrb])(?: .*)?$")
        .expect("FEN regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParsePositionError {
    #[error("malformed FEN `{0}`")]
    Malformed(String),
    #[error("rank {rank} of `{fen}` does not cover 9 files")]
    BadRank { fen: String, rank: usize },
    #[error("`{0}` does not have 10 ranks")]
    BadRankCount(String),
}

/// 局面：棋盘部分加走棋方，构造后不再修改。
///
/// 只保留 FEN 的前两段（`trim_fen`），所以走子计数不同的同一局面
/// 在缓存里是同一个键。内部用 `Arc<str>`，克隆很便宜。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position(Arc<str>);

impl Position {
    pub fn parse(fen: &str) -> Result<Self, ParsePositionError> {
        let fen = fen.trim();
        let captures = FEN_REGEX
            .captures(fen)
            .ok_or_else(|| ParsePositionError::Malformed(fen.to_owned()))?;
        let board = &captures["board"];
        let side = Color::from_fen_token(&captures["side"])
            .ok_or_else(|| ParsePositionError::Malformed(fen.to_owned()))?;
        Self::from_parts(board, side)
    }

    pub fn from_parts(board: &str, side: Color) -> Result<Self, ParsePositionError> {
        let ranks: Vec<&str> = board.split('/').collect();
        if ranks.len() != 10 {
            return Err(ParsePositionError::BadRankCount(board.to_owned()));
        }
        for (i, rank) in ranks.iter().enumerate() {
            let width: u32 = rank.chars().map(|c| c.to_digit(10).unwrap_or(1)).sum();
            if width != 9 {
                return Err(ParsePositionError::BadRank {
                    fen: board.to_owned(),
                    rank: i,
                });
            }
        }
        Ok(Position(format!("{} {}", board, side.fen_token()).into()))
    }

    pub fn startpos() -> Self {
        Position(START_POSITION.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn board(&self) -> &str {
        self.0.split(' ').next().unwrap_or_default()
    }

    pub fn side_to_move(&self) -> Color {
        match self.0.rsplit(' ').next() {
            Some("b") => Color::Black,
            _ => Color::Red,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.board() == EMPTY_BOARD
    }

    /// 引擎需要完整的六段 FEN
    pub fn to_engine_fen(&self) -> String {
        format!("{} - - 0 1", self.0)
    }

    /// 左右镜像后的局面，走棋方不变
    pub fn mirrored(&self) -> Position {
        let board = self
            .board()
            .split('/')
            .map(|rank| {
                // 数字表示连续空格，整体倒序后仍然合法
                rank.chars().rev().collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("/");
        Position(format!("{} {}", board, self.side_to_move().fen_token()).into())
    }
}

impl FromStr for Position {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Position::parse(s)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_counters() {
        let p = Position::parse(
            "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w - - 0 1",
        )
        .unwrap();
        assert_eq!(p, Position::startpos());
        assert_eq!(p.side_to_move(), Color::Red);
        assert_eq!(p.to_engine_fen(), format!("{} - - 0 1", START_POSITION));
    }

    #[test]
    fn test_parse_red_token() {
        let p = Position::parse("4k4/9/9/9/9/9/9/9/9/4K4 r").unwrap();
        assert_eq!(p.as_str(), "4k4/9/9/9/9/9/9/9/9/4K4 w");
    }

    #[test]
    fn test_reject_malformed() {
        assert!(Position::parse("").is_err());
        assert!(Position::parse("4k4/9/9 w").is_err());
        assert!(Position::parse("4k3/9/9/9/9/9/9/9/9/4K4 w").is_err());
        assert!(Position::parse("4k4/9/9/9/9/9/9/9/9/4K4 x").is_err());
    }

    #[test]
    fn test_placeholder() {
        let p = Position::from_parts(EMPTY_BOARD, Color::Red).unwrap();
        assert!(p.is_placeholder());
        assert!(!Position::startpos().is_placeholder());
    }

    #[test]
    fn test_mirror() {
        let p = Position::parse("3k5/9/9/9/9/9/9/9/9/R3K4 b").unwrap();
        let m = p.mirrored();
        assert_eq!(m.as_str(), "5k3/9/9/9/9/9/9/9/9/4K3R b");
        assert_eq!(m.mirrored(), p);
        assert_eq!(Position::startpos().mirrored(), Position::startpos());
    }
}
