/* 分差计算：所有分数都是红方视角，分差换算到走棋方视角后恒 <= 0 */
use crate::{Color, RedScore};

/// 对 `mover` 最有利的分数
pub fn best_for_mover<I>(scores: I, mover: Color) -> Option<RedScore>
where
    I: IntoIterator<Item = RedScore>,
{
    scores.into_iter().max_by_key(|s| s.for_mover(mover))
}

/// 走棋方视角的分差，0 表示最佳着法
pub fn diff(score: RedScore, best: RedScore, mover: Color) -> i32 {
    (score.value() - best.value()) * mover.sign()
}

/// `limit` 为 0 表示不过滤
pub fn within_limit(diff: i32, limit: i32) -> bool {
    limit <= 0 || diff.abs() <= limit
}

pub fn is_best(diff: i32, tolerance: i32) -> bool {
    diff >= -tolerance.abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_diff_sign() {
        let best = RedScore::new(25);
        assert_eq!(diff(RedScore::new(23), best, Color::Red), -2);
        // 黑方走时红方视角 -25 比 -23 更好
        let best = RedScore::new(-25);
        assert_eq!(diff(RedScore::new(-23), best, Color::Black), -2);
    }

    #[test]
    fn test_limit() {
        assert!(within_limit(-90, 90));
        assert!(!within_limit(-91, 90));
        assert!(within_limit(-5000, 0));
        assert!(is_best(-5, 5));
        assert!(!is_best(-6, 5));
    }

    proptest! {
        #[test]
        fn best_move_has_zero_diff(
            raw in prop::collection::vec(-2000i32..2000, 1..12),
            black in any::<bool>(),
        ) {
            let mover = if black { Color::Black } else { Color::Red };
            let scores: Vec<RedScore> = raw.iter().map(|r| RedScore::from_mover(*r, mover)).collect();
            let best = best_for_mover(scores.iter().copied(), mover).unwrap();
            let max_raw = *raw.iter().max().unwrap();
            prop_assert_eq!(best.for_mover(mover), max_raw);
            for s in &scores {
                prop_assert!(diff(*s, best, mover) <= 0);
            }
            prop_assert!(scores.iter().any(|s| diff(*s, best, mover) == 0));
        }
    }
}
