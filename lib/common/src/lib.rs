/**
 * 公共类型库（common）
 *
 * 说明
 * - 走棋方 Color、着法 MoveId（ICCS 坐标）、局面 Position（裁剪后的 FEN）
 * - 统一换算到红方视角的分数 RedScore
 * - 各来源（本地库、开局库、云库、引擎）返回的候选着法 CandidateMove / MoveSet
 * - 规则适配器接口 GameRules：走子、镜像、哈希由外部实现
 * - 分差（diff）计算等合并工具
 */
mod candidate;
mod color;
pub mod merge;
mod moves;
mod position;
mod rules;
mod score;

pub use candidate::{CandidateMove, MoveSet, Outcome, Precision, SourceTag};
pub use color::Color;
pub use moves::{MoveId, ParseMoveError};
pub use position::{ParsePositionError, Position, EMPTY_BOARD, START_POSITION};
pub use rules::{GameRules, IllegalMoveError};
pub use score::{RedScore, CHECKMATE_SCORE, MATE_SCORE};
