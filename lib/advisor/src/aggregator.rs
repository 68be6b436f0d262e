/*
 * 多来源着法合并
 *
 * 说明
 * - 一个局面同时发给所有启用的来源，同一来源同一局面同一时间只有一个请求
 * - 同一着法只保留一条：标记（mark）保留，分数由可信度不低于原来源的新结果覆盖
 * - 排序：有分数的按分差从大到小，分差相同按发现顺序；没有分数的排在最后
 * - 分差超过 score_limit 的着法不显示，但仍然保留，调整限制后重新排序即可
 */
use std::collections::{HashMap, HashSet};

use common::merge::{best_for_mover, diff, within_limit};
use common::{CandidateMove, MoveId, MoveSet, Outcome, Position, RedScore, SourceTag, CHECKMATE_SCORE};
use tracing::{debug, info, warn};

use crate::config::MergeConfig;
use crate::error::SourceError;
use crate::source::{Completion, Lookup, MoveSource, SourceOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct MergedMove {
    pub candidate: CandidateMove,
    /// 走棋方视角的分差，没有分数时为 None
    pub diff: Option<i32>,
    pub shown: bool,
    /// 分数来自哪个来源
    pub score_source: Option<SourceTag>,
    order: usize,
}

/// 一个局面合并后的着法表
#[derive(Debug, Clone, PartialEq)]
pub struct MergedMoves {
    pub position: Position,
    pub best: Option<RedScore>,
    pub outcome: Outcome,
    pub mirrored: bool,
    pub sources: Vec<SourceTag>,
    pub moves: Vec<MergedMove>,
    next_order: usize,
}

impl MergedMoves {
    fn new(position: Position) -> Self {
        MergedMoves {
            position,
            best: None,
            outcome: Outcome::Unknown,
            mirrored: false,
            sources: vec![],
            moves: vec![],
            next_order: 0,
        }
    }

    pub fn get(&self, mv: MoveId) -> Option<&MergedMove> {
        self.moves.iter().find(|m| m.candidate.move_id == mv)
    }

    pub fn shown(&self) -> impl Iterator<Item = &MergedMove> {
        self.moves.iter().filter(|m| m.shown)
    }

    /// 局面分数：无着可走时用终局分数，否则取最佳着法的分数
    pub fn score(&self) -> Option<RedScore> {
        match self.outcome {
            Outcome::Checkmate | Outcome::Stalemate => {
                Some(RedScore::from_mover(-CHECKMATE_SCORE, self.position.side_to_move()))
            }
            Outcome::Moves | Outcome::Unknown => self.best,
        }
    }

    fn absorb(&mut self, set: &MoveSet) {
        if !self.sources.contains(&set.source) {
            self.sources.push(set.source);
        }
        self.mirrored |= set.mirrored;
        match set.outcome {
            Outcome::Checkmate | Outcome::Stalemate => self.outcome = set.outcome,
            Outcome::Moves if self.outcome == Outcome::Unknown => self.outcome = Outcome::Moves,
            _ => {}
        }
        for incoming in &set.candidates {
            match self.moves.iter_mut().find(|m| m.candidate.move_id == incoming.move_id) {
                Some(existing) => merge_into(existing, incoming),
                None => {
                    self.moves.push(MergedMove {
                        candidate: incoming.clone(),
                        diff: None,
                        shown: true,
                        score_source: incoming.score.map(|_| incoming.source),
                        order: self.next_order,
                    });
                    self.next_order += 1;
                }
            }
        }
    }

    fn rank(&mut self, score_limit: i32) {
        let mover = self.position.side_to_move();
        self.best = best_for_mover(self.moves.iter().filter_map(|m| m.candidate.score), mover);
        for m in &mut self.moves {
            m.diff = match (m.candidate.score, self.best) {
                (Some(score), Some(best)) => Some(diff(score, best, mover)),
                _ => None,
            };
            m.shown = m.diff.map_or(true, |d| within_limit(d, score_limit));
        }
        self.moves.sort_by(|a, b| match (a.diff, b.diff) {
            (Some(x), Some(y)) => y.cmp(&x).then(a.order.cmp(&b.order)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.order.cmp(&b.order),
        });
    }
}

fn merge_into(existing: &mut MergedMove, incoming: &CandidateMove) {
    let target = &mut existing.candidate;
    if target.mark.is_none() {
        target.mark = incoming.mark.clone();
    }
    if incoming.memo.is_some() {
        target.memo = incoming.memo.clone();
    }
    let Some(score) = incoming.score else {
        return;
    };
    let keep = existing
        .score_source
        .is_some_and(|held| held.trust() > incoming.source.trust());
    if keep {
        return;
    }
    target.score = Some(score);
    target.mate = incoming.mate;
    existing.score_source = Some(incoming.source);
}

pub struct SourceAggregator {
    sources: Vec<Box<dyn MoveSource>>,
    settings: MergeConfig,
    pending: HashSet<(SourceTag, Position)>,
    tables: HashMap<Position, MergedMoves>,
}

impl SourceAggregator {
    pub fn new(settings: MergeConfig) -> Self {
        SourceAggregator {
            sources: vec![],
            settings,
            pending: HashSet::new(),
            tables: HashMap::new(),
        }
    }

    pub fn add_source(&mut self, source: Box<dyn MoveSource>) {
        debug!(source = %source.tag(), "source enabled");
        self.sources.push(source);
    }

    /// 换掉同类来源：旧的先关闭，它在途的查询作废
    pub fn replace_source(&mut self, source: Box<dyn MoveSource>) {
        let tag = source.tag();
        for old in self.sources.iter_mut().filter(|s| s.tag() == tag) {
            old.shutdown();
        }
        self.sources.retain(|s| s.tag() != tag);
        self.pending.retain(|(t, _)| *t != tag);
        info!(source = %tag, "source replaced");
        self.sources.push(source);
    }

    pub fn tags(&self) -> Vec<SourceTag> {
        self.sources.iter().map(|s| s.tag()).collect()
    }

    pub fn has_source(&self, tag: SourceTag) -> bool {
        self.sources.iter().any(|s| s.tag() == tag)
    }

    pub fn settings(&self) -> MergeConfig {
        self.settings
    }

    /// 发给所有来源
    pub fn evaluate(&mut self, position: &Position) -> Vec<SourceOutcome> {
        self.dispatch(position, |_| true)
    }

    /// 只发给指定的来源
    pub fn evaluate_with(&mut self, position: &Position, tags: &[SourceTag]) -> Vec<SourceOutcome> {
        self.dispatch(position, |tag| tags.contains(&tag))
    }

    fn dispatch(&mut self, position: &Position, wanted: impl Fn(SourceTag) -> bool) -> Vec<SourceOutcome> {
        let mut outcomes = vec![];
        for source in self.sources.iter_mut() {
            let tag = source.tag();
            if !wanted(tag) {
                continue;
            }
            let key = (tag, position.clone());
            if self.pending.contains(&key) {
                debug!(source = %tag, "request already pending for {}", position);
                continue;
            }
            match source.lookup(position) {
                Lookup::Ready(set) => outcomes.push(SourceOutcome::Moves(set)),
                Lookup::Pending => {
                    // 引擎一次只分析一个局面，新的分析让旧的作废
                    if tag == SourceTag::Engine {
                        self.pending.retain(|(t, _)| *t != SourceTag::Engine);
                    }
                    self.pending.insert(key);
                }
                Lookup::Unavailable(error) => {
                    warn!(source = %tag, "source unavailable for {}: {}", position, error);
                    outcomes.push(SourceOutcome::Unavailable {
                        source: tag,
                        position: position.clone(),
                        error,
                    });
                }
            }
        }
        for outcome in &outcomes {
            if let SourceOutcome::Moves(set) = outcome {
                self.merge(set);
            }
        }
        outcomes
    }

    /// 异步结果交给各来源确认，确认过的才合并
    pub fn complete(&mut self, completion: &Completion) -> Vec<SourceOutcome> {
        let mut outcomes = vec![];
        for source in self.sources.iter_mut() {
            if let Some(outcome) = source.complete(completion) {
                self.pending.remove(&(outcome.source(), outcome.position().clone()));
                outcomes.push(outcome);
            }
        }
        for outcome in &outcomes {
            if let SourceOutcome::Moves(set) = outcome {
                self.merge(set);
            }
        }
        outcomes
    }

    pub fn is_pending(&self, tag: SourceTag, position: &Position) -> bool {
        self.pending.contains(&(tag, position.clone()))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn merge(&mut self, set: &MoveSet) -> &MergedMoves {
        debug_assert!(set.candidates.iter().all(|c| c.source == set.source));
        let limit = self.settings.score_limit;
        let table = self
            .tables
            .entry(set.position.clone())
            .or_insert_with(|| MergedMoves::new(set.position.clone()));
        table.absorb(set);
        table.rank(limit);
        table
    }

    pub fn table(&self, position: &Position) -> Option<&MergedMoves> {
        self.tables.get(position)
    }

    pub fn shown(&self, position: &Position) -> Vec<&MergedMove> {
        self.tables.get(position).map(|t| t.shown().collect()).unwrap_or_default()
    }

    /// 调整显示范围，已有的着法重新排序
    pub fn set_score_limit(&mut self, limit: i32) {
        self.settings.score_limit = limit;
        for table in self.tables.values_mut() {
            table.rank(limit);
        }
    }

    /// 放弃某个来源正在进行的查询。云库请求无法中途取消，结果回来后由协调者丢弃
    pub fn cancel_source(&mut self, tag: SourceTag) {
        for source in self.sources.iter_mut().filter(|s| s.tag() == tag) {
            source.cancel();
        }
        if tag == SourceTag::Engine {
            self.pending.retain(|(t, _)| *t != tag);
        }
    }

    pub fn forget(&mut self, position: &Position) {
        self.tables.remove(position);
    }

    /// 清空合并结果与各来源的缓存
    pub fn clear(&mut self) {
        self.tables.clear();
        for source in self.sources.iter_mut() {
            source.forget();
        }
    }

    pub fn save_line(&mut self, line: &[(Position, MoveId)]) -> Result<usize, SourceError> {
        let mut saved = 0;
        for source in self.sources.iter_mut() {
            saved += source.save_line(line)?;
        }
        Ok(saved)
    }

    pub fn shutdown(&mut self) {
        for source in self.sources.iter_mut() {
            source.shutdown();
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn red() -> Position {
        Position::parse("4k4/9/9/9/9/9/9/9/9/R3K4 w").unwrap()
    }

    fn mv(text: &str) -> MoveId {
        MoveId::parse(text).unwrap()
    }

    fn cand(text: &str, score: Option<i32>, source: SourceTag) -> CandidateMove {
        let c = CandidateMove::new(mv(text), red(), source);
        match score {
            Some(s) => c.with_score(RedScore::new(s)),
            None => c,
        }
    }

    fn set(source: SourceTag, candidates: Vec<CandidateMove>) -> MoveSet {
        MoveSet::with_moves(red(), source, candidates)
    }

    /// 同步返回固定结果的来源
    struct Fixed(MoveSet);

    impl MoveSource for Fixed {
        fn tag(&self) -> SourceTag {
            self.0.source
        }
        fn lookup(&mut self, _position: &Position) -> Lookup {
            Lookup::Ready(self.0.clone())
        }
    }

    /// 永远在途的来源，记录查询次数
    struct Slow(usize);

    impl MoveSource for Slow {
        fn tag(&self) -> SourceTag {
            SourceTag::Cloud
        }
        fn lookup(&mut self, _position: &Position) -> Lookup {
            self.0 += 1;
            Lookup::Pending
        }
    }

    struct Broken;

    impl MoveSource for Broken {
        fn tag(&self) -> SourceTag {
            SourceTag::MasterBook
        }
        fn lookup(&mut self, _position: &Position) -> Lookup {
            Lookup::Unavailable(SourceError::Transport("disk gone".to_owned()))
        }
    }

    #[test]
    fn test_cloud_scenario_ranking() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        let table = agg.merge(&set(
            SourceTag::Cloud,
            vec![
                cand("a0a1", Some(23), SourceTag::Cloud),
                cand("a0a2", Some(25), SourceTag::Cloud),
            ],
        ));
        assert_eq!(table.moves[0].candidate.move_id, mv("a0a2"));
        assert_eq!(table.moves[0].diff, Some(0));
        assert_eq!(table.moves[1].candidate.move_id, mv("a0a1"));
        assert_eq!(table.moves[1].diff, Some(-2));
        assert_eq!(table.best, Some(RedScore::new(25)));
    }

    #[test]
    fn test_black_to_move_diff_sign() {
        let black = Position::parse("4k4/9/9/9/9/9/9/9/9/R3K4 b").unwrap();
        let mut agg = SourceAggregator::new(MergeConfig::default());
        let scored = |text: &str, raw: i32| {
            CandidateMove::new(mv(text), black.clone(), SourceTag::Cloud)
                .with_score(RedScore::from_mover(raw, common::Color::Black))
        };
        let table = agg.merge(&MoveSet::with_moves(
            black.clone(),
            SourceTag::Cloud,
            vec![scored("e9e8", 23), scored("e9d9", 25)],
        ));
        assert_eq!(table.moves[0].candidate.move_id, mv("e9d9"));
        assert_eq!(table.moves[0].diff, Some(0));
        assert_eq!(table.moves[1].diff, Some(-2));
        assert_eq!(table.best, Some(RedScore::new(-25)));
    }

    #[test]
    fn test_merge_keeps_mark_and_respects_trust() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        agg.merge(&set(
            SourceTag::Local,
            vec![cand("a0a1", Some(5), SourceTag::Local).with_mark("*")],
        ));
        agg.merge(&set(SourceTag::Cloud, vec![cand("a0a1", Some(40), SourceTag::Cloud)]));
        // 引擎可信度低于云库，不覆盖
        let table = agg.merge(&set(SourceTag::Engine, vec![cand("a0a1", Some(10), SourceTag::Engine)]));
        let merged = table.get(mv("a0a1")).unwrap();
        assert_eq!(merged.candidate.mark.as_deref(), Some("*"));
        assert_eq!(merged.candidate.score, Some(RedScore::new(40)));
        assert_eq!(merged.score_source, Some(SourceTag::Cloud));
        assert_eq!(table.sources, vec![SourceTag::Local, SourceTag::Cloud, SourceTag::Engine]);
    }

    #[test]
    fn test_equal_trust_later_overwrites() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        agg.merge(&set(SourceTag::Engine, vec![cand("a0a1", Some(10), SourceTag::Engine)]));
        let table = agg.merge(&set(SourceTag::ScoreDb, vec![cand("a0a1", Some(12), SourceTag::ScoreDb)]));
        assert_eq!(table.get(mv("a0a1")).unwrap().candidate.score, Some(RedScore::new(12)));
    }

    #[test]
    fn test_unscored_moves_are_kept_last() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        agg.merge(&set(SourceTag::MasterBook, vec![cand("a0b0", None, SourceTag::MasterBook)]));
        let table = agg.merge(&set(
            SourceTag::Cloud,
            vec![
                cand("a0a1", Some(3), SourceTag::Cloud),
                cand("a0a2", Some(3), SourceTag::Cloud),
            ],
        ));
        let order: Vec<&str> = table.moves.iter().map(|m| m.candidate.move_id.as_str()).collect();
        // 同分按发现顺序
        assert_eq!(order, vec!["a0a1", "a0a2", "a0b0"]);
        assert_eq!(table.moves[2].diff, None);
        assert!(table.moves[2].shown);
    }

    #[test]
    fn test_score_limit_hides_but_keeps() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        agg.merge(&set(
            SourceTag::Cloud,
            vec![
                cand("a0a1", Some(100), SourceTag::Cloud),
                cand("a0a2", Some(0), SourceTag::Cloud),
            ],
        ));
        assert_eq!(agg.shown(&red()).len(), 1);
        assert_eq!(agg.table(&red()).unwrap().moves.len(), 2);
        agg.set_score_limit(0);
        assert_eq!(agg.shown(&red()).len(), 2);
        assert_eq!(agg.table(&red()).unwrap().moves[0].diff, Some(0));
    }

    #[test]
    fn test_pending_request_is_not_repeated() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        agg.add_source(Box::new(Slow(0)));
        assert!(agg.evaluate(&red()).is_empty());
        assert!(agg.evaluate(&red()).is_empty());
        assert!(agg.is_pending(SourceTag::Cloud, &red()));
        assert_eq!(agg.pending_count(), 1);
    }

    #[test]
    fn test_replaced_source_drops_pending_requests() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        agg.add_source(Box::new(Broken));
        agg.add_source(Box::new(Slow(0)));
        agg.evaluate(&red());
        assert!(agg.is_pending(SourceTag::Cloud, &red()));

        agg.replace_source(Box::new(Slow(0)));
        assert!(!agg.is_pending(SourceTag::Cloud, &red()));
        assert_eq!(agg.tags(), vec![SourceTag::MasterBook, SourceTag::Cloud]);
        // 新来源重新接受同一局面的查询
        agg.evaluate(&red());
        assert!(agg.is_pending(SourceTag::Cloud, &red()));
    }

    #[test]
    fn test_broken_source_does_not_block_others() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        agg.add_source(Box::new(Broken));
        agg.add_source(Box::new(Fixed(set(
            SourceTag::Local,
            vec![cand("a0a1", None, SourceTag::Local)],
        ))));
        let outcomes = agg.evaluate(&red());
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], SourceOutcome::Unavailable { source: SourceTag::MasterBook, .. }));
        assert_eq!(agg.table(&red()).unwrap().moves.len(), 1);

        let only_local = agg.evaluate_with(&red(), &[SourceTag::Local]);
        assert_eq!(only_local.len(), 1);
    }

    #[test]
    fn test_checkmate_outcome_scores_position() {
        let mut agg = SourceAggregator::new(MergeConfig::default());
        let table = agg.merge(&MoveSet::terminal(red(), SourceTag::Cloud, Outcome::Checkmate));
        assert_eq!(table.score(), Some(RedScore::new(-common::CHECKMATE_SCORE)));
    }

    proptest! {
        #[test]
        fn diffs_are_never_positive(
            scores in prop::collection::vec(-500i32..500, 1..9),
            black in any::<bool>(),
        ) {
            let side = if black { "b" } else { "w" };
            let position = Position::parse(&format!("4k4/9/9/9/9/9/9/9/9/R3K4 {}", side)).unwrap();
            let targets = ["a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8", "a9"];
            let candidates = scores
                .iter()
                .zip(targets)
                .map(|(s, to)| {
                    CandidateMove::new(mv(&format!("a0{}", to)), position.clone(), SourceTag::Cloud)
                        .with_score(RedScore::new(*s))
                })
                .collect();
            let mut agg = SourceAggregator::new(MergeConfig { score_limit: 0, ..MergeConfig::default() });
            let table = agg.merge(&MoveSet::with_moves(position.clone(), SourceTag::Cloud, candidates));
            let mover = position.side_to_move();
            let top = table.moves[0].candidate.score.unwrap();
            prop_assert_eq!(table.moves[0].diff, Some(0));
            for m in &table.moves {
                prop_assert!(m.diff.unwrap() <= 0);
                prop_assert!(m.candidate.score.unwrap().for_mover(mover) <= top.for_mover(mover));
            }
        }
    }
}
