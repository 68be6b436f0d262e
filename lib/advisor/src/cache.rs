/*
 * 局面评估缓存
 *
 * 说明
 * - 每个见过的局面一条记录：分数（红方视角）、最佳着法集合、父局面、分差、失误提示
 * - 分数只接受精度更高的结果；精度相同时，可信度不低于原来源才覆盖。reevaluate 之后解除这个限制
 * - 最佳着法集合由已知的全部子局面分数算出，不只看最近一次结果
 * - 父局面先到先得；实际走出的着法优先于来源列出的着法
 * - 只由协调者持有与修改，其它地方只拿快照
 */
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use common::merge::{best_for_mover, diff, is_best};
use common::{MoveId, MoveSet, Position, Precision, RedScore, SourceTag};
use tracing::{debug, info};

use crate::config::MergeConfig;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionRecord {
    pub score: Option<RedScore>,
    pub precision: Option<Precision>,
    /// 给出当前分数的来源
    pub source: Option<SourceTag>,
    pub best_moves: BTreeSet<MoveId>,
    /// 已知的全部着法及其到达的局面
    pub children: BTreeMap<MoveId, Position>,
    pub parent: Option<Position>,
    /// 从父局面走到这里的着法
    pub via: Option<MoveId>,
    /// 父链接来自实际对局
    pub played: bool,
    /// 走到这里的着法相对父局面最佳着法的分差，父局面走棋方视角
    pub diff: Option<i32>,
    /// 走出的着法明显不如最佳着法时，记下当时的最佳着法
    pub flagged_alternative: Option<BTreeSet<MoveId>>,
}

impl PositionRecord {
    fn clear_scores(&mut self) {
        self.score = None;
        self.precision = None;
        self.source = None;
        self.best_moves.clear();
        self.diff = None;
        self.flagged_alternative = None;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildScore {
    pub move_id: MoveId,
    pub produced: Position,
    pub score: Option<RedScore>,
}

/// 一次来源结果带来的新信息
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationUpdate {
    pub source: SourceTag,
    pub score: Option<RedScore>,
    pub children: Vec<ChildScore>,
}

impl From<&MoveSet> for EvaluationUpdate {
    fn from(set: &MoveSet) -> Self {
        EvaluationUpdate {
            source: set.source,
            score: set.terminal_score().or_else(|| set.best_score()),
            children: set
                .candidates
                .iter()
                .map(|c| ChildScore {
                    move_id: c.move_id,
                    produced: c.produced.clone(),
                    score: c.score,
                })
                .collect(),
        }
    }
}

pub struct EvaluationCache {
    records: HashMap<Position, PositionRecord>,
    settings: MergeConfig,
}

impl EvaluationCache {
    pub fn new(settings: MergeConfig) -> Self {
        EvaluationCache {
            records: HashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> MergeConfig {
        self.settings
    }

    pub fn get(&self, position: &Position) -> Option<&PositionRecord> {
        self.records.get(position)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn accepts(record: &PositionRecord, source: SourceTag) -> bool {
        let precision = source.precision();
        match (record.precision, record.source) {
            (None, _) => true,
            (Some(held), Some(by)) if precision == held => source.trust() >= by.trust(),
            (Some(held), _) => precision > held,
        }
    }

    fn store(record: &mut PositionRecord, score: RedScore, source: SourceTag) {
        record.score = Some(score);
        record.precision = Some(source.precision());
        record.source = Some(source);
    }

    /// 合并一个来源的结果，返回分数有变化的局面（包括子局面）
    pub fn record(&mut self, position: &Position, update: &EvaluationUpdate) -> Vec<Position> {
        let source = update.source;
        let mut changed = vec![];

        let record = self.records.entry(position.clone()).or_default();
        if let Some(score) = update.score {
            if Self::accepts(record, source) {
                Self::store(record, score, source);
                changed.push(position.clone());
                debug!(%source, score = score.value(), "recorded {}", position);
            } else {
                debug!(%source, "kept the held score of {}", position);
            }
        }

        for child in &update.children {
            self.propagate(&child.produced, position, child.move_id);
            let Some(score) = child.score else {
                continue;
            };
            let record = self.records.entry(child.produced.clone()).or_default();
            if Self::accepts(record, source) {
                Self::store(record, score, source);
                changed.push(child.produced.clone());
            }
        }

        // 子局面分数变了，所有列出过它的父局面都要重算最佳着法
        let mut parents: HashSet<Position> = HashSet::new();
        parents.insert(position.clone());
        for p in &changed {
            parents.extend(self.parents_of(p));
        }
        for p in &parents {
            self.refresh_best_moves(p);
        }

        // 父局面的分数或最佳着法变了，它的子局面要重新判断；它自己也要和它的父局面比较
        let mut checks: HashSet<Position> = changed.iter().cloned().collect();
        for p in &parents {
            checks.extend(self.children_of(p));
        }
        for p in checks {
            self.flag_if_blunder(&p);
        }
        changed
    }

    fn children_of(&self, parent: &Position) -> Vec<Position> {
        self.records
            .get(parent)
            .map(|r| r.children.values().cloned().collect())
            .unwrap_or_default()
    }

    fn parents_of(&self, child: &Position) -> Vec<Position> {
        self.records
            .iter()
            .filter(|(_, r)| r.children.values().any(|c| c == child))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// 在已知子局面里找出与最佳分数相差不超过容差的着法
    fn refresh_best_moves(&mut self, position: &Position) {
        let Some(record) = self.records.get(position) else {
            return;
        };
        let mover = position.side_to_move();
        let tolerance = self.settings.best_tolerance;
        let scored: Vec<(MoveId, RedScore)> = record
            .children
            .iter()
            .filter_map(|(mv, p)| self.records.get(p).and_then(|r| r.score).map(|s| (*mv, s)))
            .collect();
        let best_moves = match best_for_mover(scored.iter().map(|(_, s)| *s), mover) {
            Some(best) => scored
                .iter()
                .filter(|(_, s)| is_best(diff(*s, best, mover), tolerance))
                .map(|(mv, _)| *mv)
                .collect(),
            None => BTreeSet::new(),
        };
        if let Some(record) = self.records.get_mut(position) {
            record.best_moves = best_moves;
        }
    }

    fn link(&mut self, produced: &Position, parent: &Position, mv: MoveId, played: bool) -> bool {
        if produced == parent {
            return false;
        }
        self.records
            .entry(parent.clone())
            .or_default()
            .children
            .insert(mv, produced.clone());
        let record = self.records.entry(produced.clone()).or_default();
        let replace = match (&record.parent, record.played) {
            (None, _) => true,
            (Some(_), held) => played && !held,
        };
        if !replace {
            return false;
        }
        record.parent = Some(parent.clone());
        record.via = Some(mv);
        record.played = played;
        true
    }

    /// 来源列出 parent 走 mv 到达 produced。第一次知道时记下父局面，之后不再改写
    pub fn propagate(&mut self, produced: &Position, parent: &Position, mv: MoveId) -> bool {
        self.link(produced, parent, mv, false)
    }

    /// 对局里实际走出的着法：替换来源列出的父链接，但不替换更早走出的
    pub fn link_played(&mut self, produced: &Position, parent: &Position, mv: MoveId) -> bool {
        let linked = self.link(produced, parent, mv, true);
        self.refresh_best_moves(parent);
        linked
    }

    /// 自己的分数与父局面的分数都已知时，计算走出着法的分差，差得多就标记当时的最佳着法
    pub fn flag_if_blunder(&mut self, position: &Position) -> bool {
        let Some(record) = self.records.get(position) else {
            return false;
        };
        let (Some(parent), Some(score)) = (record.parent.clone(), record.score) else {
            return false;
        };
        let via = record.via;
        let Some(parent_record) = self.records.get(&parent) else {
            return false;
        };
        let Some(best) = parent_record.score else {
            return false;
        };
        let mover = parent.side_to_move();
        let played = diff(score, best, mover).min(0);
        let alternatives = parent_record.best_moves.clone();
        let blunder = played < self.settings.blunder_threshold
            && !alternatives.is_empty()
            && !via.is_some_and(|mv| alternatives.contains(&mv));

        let Some(record) = self.records.get_mut(position) else {
            return false;
        };
        record.diff = Some(played);
        record.flagged_alternative = if blunder { Some(alternatives) } else { None };
        if blunder {
            debug!(diff = played, "better move existed before {}", position);
        }
        blunder
    }

    /// 清空分数。keep_graph 为 true 时保留父子关系
    pub fn purge_scores(&mut self, keep_graph: bool) {
        if keep_graph {
            self.records.values_mut().for_each(PositionRecord::clear_scores);
        } else {
            self.records.clear();
        }
        info!(keep_graph, records = self.records.len(), "scores purged");
    }

    /// 只保留当前对局路线上的局面，指向已删除局面的父链接断开
    pub fn reset_to_line(&mut self, line: &[Position]) {
        let keep: HashSet<&Position> = line.iter().collect();
        self.records.retain(|p, _| keep.contains(p));
        for record in self.records.values_mut() {
            record.children.retain(|_, p| keep.contains(p));
            if record.parent.as_ref().is_some_and(|p| !keep.contains(p)) {
                record.parent = None;
                record.via = None;
                record.played = false;
                record.diff = None;
                record.flagged_alternative = None;
            }
        }
        for p in line {
            self.records.entry(p.clone()).or_default();
        }
    }

    /// 解除精度限制，下一个结果无论来源都会覆盖
    pub fn reevaluate(&mut self, position: &Position) {
        if let Some(record) = self.records.get_mut(position) {
            record.precision = None;
            record.source = None;
        }
    }
}
