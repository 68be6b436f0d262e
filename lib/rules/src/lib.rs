/**
 * 详细中文注释 - 规则库入口
 *
 * 说明
 * - 暴露三个子模块：board, constant, zobrist
 * - XiangqiRules 实现 common::GameRules，供缓存与各个着法来源使用
 * - 只负责走子合法性、生成新局面、镜像与哈希，不做搜索
 */
pub mod board;
pub mod constant;
pub mod zobrist;

use board::{Board, Square};
use common::{GameRules, IllegalMoveError, MoveId, Position};

#[derive(Debug, Clone, Copy, Default)]
pub struct XiangqiRules;

impl XiangqiRules {
    pub fn new() -> Self {
        XiangqiRules
    }

    pub fn legal_moves(&self, position: &Position) -> Vec<MoveId> {
        Board::from_position(position).legal_moves()
    }
}

impl GameRules for XiangqiRules {
    fn apply_move(&self, position: &Position, mv: MoveId) -> Result<Position, IllegalMoveError> {
        let mut board = Board::from_position(position);
        let from = Square::from_iccs(mv.from_square());
        let to = Square::from_iccs(mv.to_square());
        board
            .is_move_legal(from, to)
            .map_err(|reason| IllegalMoveError::new(position, mv, reason))?;
        board.apply(from, to);
        board
            .to_position()
            .map_err(|e| IllegalMoveError::new(position, mv, e.to_string()))
    }

    fn mirror(&self, position: &Position) -> Position {
        position.mirrored()
    }

    fn position_hash(&self, position: &Position) -> u64 {
        Board::from_position(position).zobrist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_apply_move() {
        let rules = XiangqiRules::new();
        let next = rules
            .apply_move(&Position::startpos(), MoveId::parse("h2e2").unwrap())
            .unwrap();
        assert_eq!(
            next.as_str(),
            "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C2C4/9/RNBAKABNR b"
        );
        let err = rules
            .apply_move(&Position::startpos(), MoveId::parse("a0a5").unwrap())
            .unwrap_err();
        assert_eq!(err.mv.to_string(), "a0a5");
    }

    #[test]
    fn test_symmetry_hash() {
        let rules = XiangqiRules::new();
        let left = rules
            .apply_move(&Position::startpos(), MoveId::parse("b2e2").unwrap())
            .unwrap();
        let right = rules
            .apply_move(&Position::startpos(), MoveId::parse("h2e2").unwrap())
            .unwrap();
        assert_ne!(rules.position_hash(&left), rules.position_hash(&right));
        assert_eq!(rules.symmetry_hash(&left), rules.symmetry_hash(&right));
        assert_eq!(rules.mirror(&left), right);
    }

    proptest! {
        #[test]
        fn mirrored_move_reaches_mirrored_position(steps in prop::collection::vec(0usize..64, 0..6)) {
            let rules = XiangqiRules::new();
            let mut position = Position::startpos();
            for step in steps {
                let moves = rules.legal_moves(&position);
                if moves.is_empty() {
                    break;
                }
                let mv = moves[step % moves.len()];
                let direct = rules.apply_move(&position, mv).unwrap();
                let mirrored = rules.mirror(&position);
                prop_assert_eq!(rules.mirror(&mirrored), position.clone());
                let via_mirror = rules.apply_move(&mirrored, mv.mirror()).unwrap();
                prop_assert_eq!(rules.mirror(&via_mirror), direct.clone());
                position = direct;
            }
        }
    }
}
