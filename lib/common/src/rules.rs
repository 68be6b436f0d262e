use thiserror::Error;

use crate::{Color, MoveId, Position};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal move {mv} in {position}: {reason}")]
pub struct IllegalMoveError {
    pub position: Position,
    pub mv: MoveId,
    pub reason: String,
}

impl IllegalMoveError {
    pub fn new(position: &Position, mv: MoveId, reason: impl Into<String>) -> Self {
        IllegalMoveError {
            position: position.clone(),
            mv,
            reason: reason.into(),
        }
    }
}

/// 规则适配器：走子、镜像、哈希都交给外部实现
pub trait GameRules: Send + Sync {
    fn apply_move(&self, position: &Position, mv: MoveId) -> Result<Position, IllegalMoveError>;

    fn mirror(&self, position: &Position) -> Position;

    /// 区分左右的局面哈希
    fn position_hash(&self, position: &Position) -> u64;

    /// 镜像不变的哈希：局面与其镜像取较小值
    fn symmetry_hash(&self, position: &Position) -> u64 {
        let direct = self.position_hash(position);
        let mirrored = self.position_hash(&self.mirror(position));
        direct.min(mirrored)
    }

    fn side_to_move(&self, position: &Position) -> Color {
        position.side_to_move()
    }
}
