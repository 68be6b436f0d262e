/* 引擎作为着法来源：只给出最佳着法，多线分析时每条线一个着法 */
use std::collections::BTreeMap;

use common::{CandidateMove, MoveSet, Outcome, Position, SourceTag};
use tracing::{debug, warn};

use super::{Completion, Lookup, MoveSource, SourceOutcome};
use crate::engine::{EngineEvent, EngineSupervisor, Evaluation, SearchParams};
use crate::error::{EngineError, SourceError};

pub struct EngineSource {
    supervisor: Option<EngineSupervisor>,
    params: SearchParams,
    multipv: u32,
    /// 正在分析的局面
    goal: Option<Position>,
    /// 多线分析时各条线最新的着法，键是线号
    lines: BTreeMap<u32, Evaluation>,
}

fn candidate(evaluation: &Evaluation) -> CandidateMove {
    let mut candidate = CandidateMove::new(evaluation.move_id, evaluation.produced.clone(), SourceTag::Engine);
    if let Some(score) = evaluation.score {
        candidate = candidate.with_score(score);
    }
    if let Some(mate) = evaluation.mate {
        candidate = candidate.with_mate(mate);
    }
    if let Some(depth) = evaluation.depth {
        candidate = candidate.with_memo(format!("depth {}", depth));
    }
    candidate
}

impl EngineSource {
    pub fn new(supervisor: EngineSupervisor, params: SearchParams, multipv: u32) -> Self {
        let multipv = multipv.max(1);
        if multipv > 1 {
            if let Err(e) = supervisor.set_option("MultiPV", &multipv.to_string()) {
                warn!("cannot enable multi-line analysis: {}", e);
            }
        }
        EngineSource {
            supervisor: Some(supervisor),
            params,
            multipv,
            goal: None,
            lines: BTreeMap::new(),
        }
    }

    pub fn supervisor(&self) -> Option<&EngineSupervisor> {
        self.supervisor.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.supervisor.as_ref().is_some_and(|s| s.is_ready())
    }

    pub fn goal(&self) -> Option<&Position> {
        self.goal.as_ref()
    }

    pub fn stop(&mut self) {
        if let Some(supervisor) = &self.supervisor {
            if let Err(e) = supervisor.stop_analysis() {
                warn!("stop analysis failed: {}", e);
            }
        }
        self.goal = None;
        self.lines.clear();
    }

    pub fn quit(&mut self) {
        self.goal = None;
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.quit();
        }
    }

    fn is_current(&self, position: &Position) -> bool {
        self.goal.as_ref() == Some(position)
    }

    fn finish(&mut self, set: MoveSet) -> Option<SourceOutcome> {
        self.goal = None;
        self.lines.clear();
        Some(SourceOutcome::Moves(set))
    }

    fn on_bestmove(&mut self, best: &Evaluation) -> Option<SourceOutcome> {
        let mut candidates = vec![candidate(best)];
        if self.multipv > 1 {
            for line in self.lines.values().filter(|l| l.multipv > 1) {
                if candidates.iter().all(|c| c.move_id != line.move_id) {
                    candidates.push(candidate(line));
                }
            }
        }
        debug!(lines = candidates.len(), "engine result for {}", best.position);
        self.finish(MoveSet::with_moves(best.position.clone(), SourceTag::Engine, candidates))
    }
}

impl MoveSource for EngineSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Engine
    }

    fn lookup(&mut self, position: &Position) -> Lookup {
        let Some(supervisor) = &self.supervisor else {
            return Lookup::Ready(MoveSet::empty(position.clone(), SourceTag::Engine));
        };
        // 同一局面还在分析中，不重复下发
        if self.is_current(position) {
            return Lookup::Pending;
        }
        match supervisor.analyze(position, self.params) {
            Ok(true) => {
                self.goal = Some(position.clone());
                self.lines.clear();
                Lookup::Pending
            }
            // 空棋盘或者引擎还没就绪
            Ok(false) => Lookup::Ready(MoveSet::empty(position.clone(), SourceTag::Engine)),
            Err(e) => {
                self.goal = None;
                Lookup::Unavailable(SourceError::Engine(e))
            }
        }
    }

    fn complete(&mut self, completion: &Completion) -> Option<SourceOutcome> {
        let Completion::Engine(event) = completion else {
            return None;
        };
        match event {
            EngineEvent::Info(evaluation) if self.is_current(&evaluation.position) => {
                self.lines.insert(evaluation.multipv, evaluation.clone());
                None
            }
            EngineEvent::BestMove(best) if self.is_current(&best.position) => self.on_bestmove(best),
            EngineEvent::Checkmate { position } if self.is_current(position) => self.finish(MoveSet::terminal(
                position.clone(),
                SourceTag::Engine,
                Outcome::Checkmate,
            )),
            EngineEvent::Resignation { position } | EngineEvent::DrawOffer { position }
                if self.is_current(position) =>
            {
                self.finish(MoveSet::empty(position.clone(), SourceTag::Engine))
            }
            EngineEvent::Failed(reason) => {
                let position = self.goal.take()?;
                self.lines.clear();
                Some(SourceOutcome::Unavailable {
                    source: SourceTag::Engine,
                    position,
                    error: SourceError::Engine(EngineError::Failed(reason.clone())),
                })
            }
            _ => None,
        }
    }

    fn cancel(&mut self) {
        self.stop();
    }

    fn shutdown(&mut self) {
        self.quit();
    }
}
