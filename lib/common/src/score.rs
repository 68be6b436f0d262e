use std::fmt;

use crate::Color;

/// 引擎报杀时使用的分数
pub const MATE_SCORE: i32 = 29999;
/// 云库返回 `checkmate` 时使用的分数
pub const CHECKMATE_SCORE: i32 = 30000;

/// 红方视角的分数，正数表示红方占优。
///
/// 各来源给出的分数都是走棋方视角，进入缓存前统一用 [`RedScore::from_mover`] 换算。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct RedScore(i32);

impl RedScore {
    pub const fn new(value: i32) -> Self {
        RedScore(value)
    }

    /// 超出 ±[`CHECKMATE_SCORE`] 的分数先截断，换算不会溢出
    pub fn from_mover(raw: i32, mover: Color) -> Self {
        RedScore(raw.clamp(-CHECKMATE_SCORE, CHECKMATE_SCORE) * mover.sign())
    }

    /// 外部来源（云库、开局库、引擎）给的分数，截断到 ±[`MATE_SCORE`]
    pub fn from_external(raw: i32, mover: Color) -> Self {
        RedScore(raw.clamp(-MATE_SCORE, MATE_SCORE) * mover.sign())
    }

    /// `mate` 为走棋方视角的杀棋步数，正数表示走棋方杀对方
    pub fn mate_in(mate: i32, mover: Color) -> Self {
        let sign = if mate > 0 { 1 } else { -1 };
        RedScore(MATE_SCORE * sign * mover.sign())
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    /// 换回某一方视角
    pub fn for_mover(&self, mover: Color) -> i32 {
        self.0 * mover.sign()
    }

    pub fn is_mate(&self) -> bool {
        self.0.abs() >= MATE_SCORE
    }
}

impl fmt::Display for RedScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
