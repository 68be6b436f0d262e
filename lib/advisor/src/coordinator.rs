/*
 * 协调者
 *
 * 说明
 * - 评估缓存、合并器、各来源都只在协调者线程上修改
 * - 输入：界面命令、引擎事件、云库回复，统一用 select! 接收
 * - 输出：AdvisorEvent，界面据此刷新
 * - 只关心当前局面、对局路线和复盘中的局面，其它局面的异步结果直接丢弃
 */
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use common::{GameRules, MoveId, Outcome, Position, SourceTag};
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::aggregator::{MergedMove, SourceAggregator};
use crate::cache::{EvaluationCache, EvaluationUpdate, PositionRecord};
use crate::config::{AdvisorConfig, EngineConfig, RemoteSettings};
use crate::engine::{EngineEvent, EngineSupervisor, Evaluation, Protocol};
use crate::error::{AdvisorError, EngineError};
use crate::review::{ReviewMode, ReviewSession};
use crate::source::{
    CloudFlavor, CloudReply, CloudStore, CloudTransport, Completion, EngineSource, LocalStore, MasterBookStore,
    ReqwestTransport, SourceOutcome,
};

#[derive(Debug)]
pub enum Command {
    /// 切换当前局面并评估
    Evaluate(Position),
    /// 在 from 局面走一步，新局面接到对局路线后面
    PlayMove { from: Position, mv: MoveId },
    /// 替换对局路线，已走着法清空
    SetLine(Vec<Position>),
    PurgeScores { keep_graph: bool },
    /// 新的一局，只保留这条路线上的局面
    NewGame(Vec<Position>),
    Reevaluate(Position),
    SetScoreLimit(i32),
    /// 复盘进行中再发一次等于取消
    StartReview(ReviewMode),
    StopReview,
    SaveLine,
    /// 换一个引擎程序，缓存与其它来源不受影响
    RestartEngine { path: PathBuf, protocol: Protocol },
    Snapshot {
        position: Position,
        reply: Sender<Option<PositionRecord>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvisorEvent {
    PositionUpdated { position: Position, record: PositionRecord },
    HintsReady { position: Position, moves: Vec<MergedMove> },
    SourceUnavailable { source: SourceTag, position: Position, reason: String },
    EngineReady { name: String, options: Vec<String> },
    EngineInfo(Evaluation),
    EngineFailed(String),
    Checkmate { position: Position },
    Resignation { position: Position },
    DrawOffer { position: Position },
    MoveRejected { position: Position, mv: MoveId, reason: String },
    LineSaved(usize),
    ReviewProgress { done: usize, total: usize },
    ReviewFinished { cancelled: bool },
}

pub struct Coordinator {
    aggregator: SourceAggregator,
    cache: EvaluationCache,
    rules: Arc<dyn GameRules>,
    events: Sender<AdvisorEvent>,
    active: Option<Position>,
    line: Vec<Position>,
    played: Vec<(Position, MoveId)>,
    review: Option<ReviewSession>,
    engine: EngineConfig,
    engine_events: Option<Sender<EngineEvent>>,
}

/// 启动引擎进程，下发配置里的选项，包装成着法来源
fn start_engine(
    path: &std::path::Path,
    config: &EngineConfig,
    rules: Arc<dyn GameRules>,
    events: Sender<EngineEvent>,
) -> Result<EngineSource, EngineError> {
    let supervisor = EngineSupervisor::start(path, config.protocol, rules, events)?;
    for (name, value) in &config.options {
        supervisor.set_option(name, value)?;
    }
    Ok(EngineSource::new(supervisor, config.search_params(), config.multipv))
}

impl Coordinator {
    pub fn new(aggregator: SourceAggregator, rules: Arc<dyn GameRules>, events: Sender<AdvisorEvent>) -> Self {
        let cache = EvaluationCache::new(aggregator.settings());
        Coordinator {
            aggregator,
            cache,
            rules,
            events,
            active: None,
            line: vec![],
            played: vec![],
            review: None,
            engine: EngineConfig::default(),
            engine_events: None,
        }
    }

    /// 允许重启引擎：新引擎的事件发到 events，选项与搜索参数取自 config
    pub fn with_engine(mut self, config: EngineConfig, events: Sender<EngineEvent>) -> Self {
        self.engine = config;
        self.engine_events = Some(events);
        self
    }

    pub fn cache(&self) -> &EvaluationCache {
        &self.cache
    }

    pub fn aggregator(&self) -> &SourceAggregator {
        &self.aggregator
    }

    pub fn active(&self) -> Option<&Position> {
        self.active.as_ref()
    }

    pub fn line(&self) -> &[Position] {
        &self.line
    }

    /// 事件循环，收到 Shutdown 或命令通道关闭时退出
    pub fn run(
        mut self,
        commands: Receiver<Command>,
        engine_events: Receiver<EngineEvent>,
        cloud_replies: Receiver<CloudReply>,
    ) {
        let mut engine_events = engine_events;
        let mut cloud_replies = cloud_replies;
        loop {
            select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(engine_events) -> msg => match msg {
                    Ok(event) => self.on_engine(event),
                    Err(_) => engine_events = never(),
                },
                recv(cloud_replies) -> msg => match msg {
                    Ok(reply) => self.on_cloud(reply),
                    Err(_) => cloud_replies = never(),
                },
            }
        }
        info!("coordinator stopped");
        self.aggregator.shutdown();
    }

    fn emit(&self, event: AdvisorEvent) {
        if self.events.send(event).is_err() {
            debug!("no one is listening to advisor events");
        }
    }

    fn is_of_interest(&self, position: &Position) -> bool {
        self.active.as_ref() == Some(position)
            || self.line.contains(position)
            || self.review.as_ref().and_then(|r| r.current()) == Some(position)
    }

    /// 处理一条命令，返回 false 表示退出
    pub fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Evaluate(position) => {
                if self.review.is_some() {
                    debug!("ignore evaluate during review");
                    return true;
                }
                self.evaluate(position);
            }
            Command::PlayMove { from, mv } => self.play_move(from, mv),
            Command::SetLine(line) => {
                // 换路线时正在进行的复盘作废
                self.stop_review(true);
                self.played.clear();
                self.line = line;
                if let Some(last) = self.line.last().cloned() {
                    self.evaluate(last);
                }
            }
            Command::PurgeScores { keep_graph } => {
                self.cache.purge_scores(keep_graph);
                self.aggregator.clear();
            }
            Command::NewGame(line) => {
                self.stop_review(true);
                self.cache.reset_to_line(&line);
                self.aggregator.clear();
                self.played.clear();
                self.line = line;
                self.active = None;
                if let Some(last) = self.line.last().cloned() {
                    self.evaluate(last);
                }
            }
            Command::Reevaluate(position) => {
                self.cache.reevaluate(&position);
                self.aggregator.forget(&position);
                self.evaluate(position);
            }
            Command::SetScoreLimit(limit) => {
                self.aggregator.set_score_limit(limit);
                if let Some(active) = self.active.clone() {
                    self.emit_hints(&active);
                }
            }
            Command::StartReview(mode) => {
                if self.review.is_some() {
                    self.stop_review(true);
                } else {
                    self.start_review(mode);
                }
            }
            Command::StopReview => self.stop_review(true),
            Command::SaveLine => match self.aggregator.save_line(&self.played) {
                Ok(saved) => {
                    info!(saved, "line saved");
                    self.emit(AdvisorEvent::LineSaved(saved));
                }
                Err(e) => {
                    warn!("save line failed: {}", e);
                    let position = self.played.first().map(|(p, _)| p.clone()).unwrap_or_else(Position::startpos);
                    self.emit(AdvisorEvent::SourceUnavailable {
                        source: SourceTag::Local,
                        position,
                        reason: e.to_string(),
                    });
                }
            },
            Command::RestartEngine { path, protocol } => self.restart_engine(path, protocol),
            Command::Snapshot { position, reply } => {
                let _ = reply.send(self.cache.get(&position).cloned());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn evaluate(&mut self, position: Position) {
        if self.active.as_ref() != Some(&position) {
            debug!("active position {}", position);
        }
        self.active = Some(position.clone());
        self.emit_hints(&position);
        let outcomes = self.aggregator.evaluate(&position);
        self.absorb(outcomes);
    }

    fn play_move(&mut self, from: Position, mv: MoveId) {
        let next = match self.rules.apply_move(&from, mv) {
            Ok(next) => next,
            Err(e) => {
                warn!("{}", e);
                self.emit(AdvisorEvent::MoveRejected {
                    position: from,
                    mv,
                    reason: e.reason,
                });
                return;
            }
        };
        // 从路线中间走出新的分支时，截掉后面的部分
        match self.line.iter().position(|p| *p == from) {
            Some(index) => {
                self.line.truncate(index + 1);
                self.played.truncate(index);
            }
            None => {
                self.line = vec![from.clone()];
                self.played.clear();
            }
        }
        self.line.push(next.clone());
        self.played.push((from.clone(), mv));
        self.cache.link_played(&next, &from, mv);
        if self.cache.flag_if_blunder(&next) {
            self.emit_record(&next);
        }
        if self.review.is_none() {
            self.evaluate(next);
        }
    }

    /// 新引擎就绪后会收到 Ready，那时再补上当前局面的分析
    fn restart_engine(&mut self, path: PathBuf, protocol: Protocol) {
        let Some(events) = self.engine_events.clone() else {
            warn!("engine restart requested without an engine channel");
            self.emit(AdvisorEvent::EngineFailed("engine restart is not available".to_owned()));
            return;
        };
        if self.review.as_ref().is_some_and(|r| r.mode() == ReviewMode::Engine) {
            self.stop_review(true);
        }
        self.engine.path = Some(path.clone());
        self.engine.protocol = protocol;
        match start_engine(&path, &self.engine, self.rules.clone(), events) {
            Ok(source) => {
                info!(%protocol, "engine restarted: {}", path.display());
                self.aggregator.replace_source(Box::new(source));
            }
            Err(e) => {
                warn!("engine restart failed: {}", e);
                self.emit(AdvisorEvent::EngineFailed(e.to_string()));
            }
        }
    }

    fn start_review(&mut self, mode: ReviewMode) {
        let missing = mode.sources().iter().find(|tag| !self.aggregator.has_source(**tag));
        if let Some(tag) = missing {
            let position = self.active.clone().unwrap_or_else(Position::startpos);
            self.emit(AdvisorEvent::SourceUnavailable {
                source: *tag,
                position,
                reason: format!("{} is not enabled", tag),
            });
            return;
        }
        self.cache.purge_scores(true);
        self.aggregator.clear();
        let review = ReviewSession::new(mode, self.line.clone());
        let (done, total) = review.progress();
        let first = review.current().cloned();
        self.review = Some(review);
        self.emit(AdvisorEvent::ReviewProgress { done, total });
        match first {
            Some(first) => {
                self.active = Some(first.clone());
                let outcomes = self.aggregator.evaluate_with(&first, mode.sources());
                self.absorb(outcomes);
            }
            None => self.finish_review(false),
        }
    }

    fn stop_review(&mut self, cancelled: bool) {
        let Some(mut review) = self.review.take() else {
            return;
        };
        review.cancel();
        if review.mode() == ReviewMode::Engine {
            self.aggregator.cancel_source(SourceTag::Engine);
        }
        self.emit(AdvisorEvent::ReviewFinished { cancelled });
    }

    fn finish_review(&mut self, cancelled: bool) {
        self.review = None;
        self.emit(AdvisorEvent::ReviewFinished { cancelled });
    }

    fn on_engine(&mut self, event: EngineEvent) {
        match &event {
            EngineEvent::Ready { name, options } => {
                self.emit(AdvisorEvent::EngineReady {
                    name: name.clone(),
                    options: options.clone(),
                });
            }
            EngineEvent::Info(evaluation) if self.active.as_ref() == Some(&evaluation.position) => {
                self.emit(AdvisorEvent::EngineInfo(evaluation.clone()));
            }
            EngineEvent::Resignation { position } => self.emit(AdvisorEvent::Resignation {
                position: position.clone(),
            }),
            EngineEvent::DrawOffer { position } => self.emit(AdvisorEvent::DrawOffer {
                position: position.clone(),
            }),
            EngineEvent::Failed(reason) => self.emit(AdvisorEvent::EngineFailed(reason.clone())),
            _ => {}
        }
        let ready = matches!(event, EngineEvent::Ready { .. });
        let outcomes = self.aggregator.complete(&Completion::Engine(event));
        self.absorb(outcomes);

        // 引擎就绪后补上当前局面的分析
        if ready {
            let target = match &self.review {
                Some(review) if review.mode() == ReviewMode::Engine => review.current().cloned(),
                Some(_) => None,
                None => self.active.clone(),
            };
            if let Some(position) = target {
                let outcomes = self.aggregator.evaluate_with(&position, &[SourceTag::Engine]);
                self.absorb(outcomes);
            }
        }
    }

    fn on_cloud(&mut self, reply: CloudReply) {
        let outcomes = self.aggregator.complete(&Completion::Cloud(reply));
        self.absorb(outcomes);
    }

    /// 逐个处理来源结果。复盘前进时下一步的同步结果也放进队列里继续处理
    fn absorb(&mut self, outcomes: Vec<SourceOutcome>) {
        let mut queue: VecDeque<SourceOutcome> = outcomes.into();
        while let Some(outcome) = queue.pop_front() {
            let source = outcome.source();
            let position = outcome.position().clone();
            if !self.is_of_interest(&position) {
                debug!(%source, "discarded result for {}", position);
                continue;
            }
            match outcome {
                SourceOutcome::Moves(set) => {
                    let changed = self.cache.record(&set.position, &EvaluationUpdate::from(&set));
                    for p in &changed {
                        self.emit_record(p);
                    }
                    self.emit_hints(&set.position);
                    if set.outcome == Outcome::Checkmate && self.active.as_ref() == Some(&set.position) {
                        self.emit(AdvisorEvent::Checkmate {
                            position: set.position.clone(),
                        });
                    }
                }
                SourceOutcome::Unavailable { source, position, error } => {
                    self.emit(AdvisorEvent::SourceUnavailable {
                        source,
                        position,
                        reason: error.to_string(),
                    });
                }
            }
            queue.extend(self.advance_review(source, &position));
        }
    }

    fn advance_review(&mut self, source: SourceTag, position: &Position) -> Vec<SourceOutcome> {
        let Some(review) = self.review.as_mut() else {
            return vec![];
        };
        let next = review.on_recorded(source, position);
        let (done, total) = review.progress();
        let mode = review.mode();
        let finished = review.is_finished();
        if done == 0 {
            return vec![];
        }
        if next.is_none() && !finished {
            return vec![];
        }
        self.emit(AdvisorEvent::ReviewProgress { done, total });
        match next {
            Some(next) => {
                self.active = Some(next.clone());
                self.aggregator.evaluate_with(&next, mode.sources())
            }
            None => {
                self.finish_review(false);
                vec![]
            }
        }
    }

    fn emit_record(&self, position: &Position) {
        if let Some(record) = self.cache.get(position) {
            self.emit(AdvisorEvent::PositionUpdated {
                position: position.clone(),
                record: record.clone(),
            });
        }
    }

    fn emit_hints(&self, position: &Position) {
        let Some(table) = self.aggregator.table(position) else {
            return;
        };
        self.emit(AdvisorEvent::HintsReady {
            position: position.clone(),
            moves: table.shown().cloned().collect(),
        });
    }
}

/// 运行中的顾问：协调者线程、网络运行时和两端的通道
pub struct Advisor {
    commands: Sender<Command>,
    events: Receiver<AdvisorEvent>,
    worker: Option<JoinHandle<()>>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Advisor {
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn events(&self) -> &Receiver<AdvisorEvent> {
        &self.events
    }

    pub fn snapshot(&self, position: &Position) -> Option<PositionRecord> {
        let (reply, answer) = bounded(1);
        let asked = self.send(Command::Snapshot {
            position: position.clone(),
            reply,
        });
        if !asked {
            return None;
        }
        answer.recv().ok().flatten()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("coordinator thread panicked");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Advisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 按配置组装所有来源并启动协调者线程
pub fn launch(config: &AdvisorConfig, rules: Arc<dyn GameRules>) -> Result<Advisor, AdvisorError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("advisor-net")
        .enable_all()
        .build()
        .map_err(AdvisorError::Runtime)?;

    let (command_tx, command_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();
    let (engine_tx, engine_rx) = unbounded();
    let (cloud_tx, cloud_rx) = unbounded();

    let mut aggregator = SourceAggregator::new(config.merge);
    let local = match &config.books.local {
        Some(path) => LocalStore::open(path, rules.clone()),
        None => LocalStore::new(rules.clone()),
    };
    aggregator.add_source(Box::new(local));
    if let Some(path) = &config.books.master {
        match MasterBookStore::open(path, rules.clone(), runtime.handle().clone()) {
            Ok(book) => aggregator.add_source(Box::new(book)),
            Err(e) => {
                warn!("master book unavailable: {}", e);
                let _ = event_tx.send(AdvisorEvent::SourceUnavailable {
                    source: SourceTag::MasterBook,
                    position: Position::startpos(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let remotes = [
        (config.cloud.enabled, CloudFlavor::ChessDb, RemoteSettings::from(&config.cloud)),
        (config.score_db.enabled, CloudFlavor::ScoreDb, RemoteSettings::from(&config.score_db)),
    ];
    for (enabled, flavor, settings) in remotes {
        if !enabled {
            continue;
        }
        let transport: Arc<dyn CloudTransport> = Arc::new(ReqwestTransport::new(settings.timeout)?);
        aggregator.add_source(Box::new(CloudStore::new(
            flavor,
            settings,
            transport,
            rules.clone(),
            runtime.handle().clone(),
            cloud_tx.clone(),
        )));
    }

    // 引擎起不来不影响其它来源，之后可以用 RestartEngine 重试
    if let Some(path) = &config.engine.path {
        match start_engine(path, &config.engine, rules.clone(), engine_tx.clone()) {
            Ok(source) => aggregator.add_source(Box::new(source)),
            Err(e) => {
                warn!("engine unavailable: {}", e);
                let _ = event_tx.send(AdvisorEvent::EngineFailed(e.to_string()));
            }
        }
    }
    info!(sources = ?aggregator.tags(), "advisor sources ready");

    let coordinator = Coordinator::new(aggregator, rules, event_tx).with_engine(config.engine.clone(), engine_tx);
    let worker = thread::Builder::new()
        .name("advisor-coordinator".to_owned())
        .spawn(move || coordinator.run(command_rx, engine_rx, cloud_rx))
        .map_err(AdvisorError::Runtime)?;

    Ok(Advisor {
        commands: command_tx,
        events: event_rx,
        worker: Some(worker),
        runtime: Some(runtime),
    })
}
