use std::fmt;

/// 走棋方，红方在下先走
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Color {
    Red,
    Black,
}

impl Color {
    /// 红方 +1，黑方 -1，用于把走棋方视角的分数换算到红方视角
    pub fn sign(&self) -> i32 {
        if self == &Color::Red { 1 } else { -1 }
    }

    pub fn opponent(&self) -> Color {
        if self == &Color::Red {
            Color::Black
        } else {
            Color::Red
        }
    }

    /// FEN 里的走棋方标记，`r` 是部分软件对红方的写法
    pub fn from_fen_token(token: &str) -> Option<Color> {
        match token {
            "w" | "r" => Some(Color::Red),
            "b" => Some(Color::Black),
            _ => None,
        }
    }

    pub fn fen_token(&self) -> &'static str {
        match self {
            Color::Red => "w",
            Color::Black => "b",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Red => write!(f, "red"),
            Color::Black => write!(f, "black"),
        }
    }
}
