/*
 * 引擎会话管理
 *
 * 说明
 * - 每个会话对应一个外部引擎进程，读线程阻塞读取引擎输出，逐行交给 Session 处理
 * - 调用方与读线程通过 Arc<Mutex<Session>> 共享会话状态，事件通过 crossbeam 通道送出
 * - 引擎分数是走棋方视角，这里统一换算到红方视角
 * - 每次 analyze 都会让之前的搜索作废，作废搜索的 bestmove 直接丢弃
 * - 发送命令失败视为会话失效，不自动重启
 */
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use common::{GameRules, MoveId, Position, RedScore};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{parse_line, EngineLine, InfoLine, Protocol, SearchParams, Verdict};
use crate::error::EngineError;

/// 一次引擎评估，分数与杀棋步数都是红方视角
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub position: Position,
    pub move_id: MoveId,
    pub produced: Position,
    pub ponder: Option<MoveId>,
    pub score: Option<RedScore>,
    pub mate: Option<i32>,
    pub depth: Option<u32>,
    pub multipv: u32,
    pub pv: Vec<MoveId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Ready { name: String, options: Vec<String> },
    BestMove(Evaluation),
    Info(Evaluation),
    /// 引擎无着可走
    Checkmate { position: Position },
    /// 引擎认输
    Resignation { position: Position },
    /// 引擎提和
    DrawOffer { position: Position },
    /// 会话失效，需要重建
    Failed(String),
}

#[derive(Debug, Clone)]
struct Goal {
    position: Position,
    params: SearchParams,
}

struct Session {
    name: String,
    protocol: Protocol,
    writer: Box<dyn Write + Send>,
    rules: Arc<dyn GameRules>,
    events: Sender<EngineEvent>,
    options: Vec<String>,
    queued_options: Vec<(String, String)>,
    ready: bool,
    closed: bool,
    goal: Option<Goal>,
    generation: u64,
    searching: bool,
    // 已作废但还没收到 bestmove 的搜索个数
    superseded: u32,
    last_info: Option<InfoLine>,
}

impl Session {
    fn send(&mut self, cmd: &str) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        debug!(engine = %self.name, ">> {}", cmd);
        let result = writeln!(self.writer, "{}", cmd).and_then(|_| self.writer.flush());
        if let Err(source) = result {
            warn!(engine = %self.name, "send failed: {}", source);
            self.closed = true;
            self.ready = false;
            let _ = self.events.send(EngineEvent::Failed(source.to_string()));
            return Err(EngineError::Protocol {
                name: self.name.clone(),
                source,
            });
        }
        Ok(())
    }

    fn on_line(&mut self, line: &str) {
        debug!(engine = %self.name, "<< {}", line);
        match parse_line(line) {
            EngineLine::IdName(name) => self.name = name,
            EngineLine::OptionName(option) => self.options.push(option),
            EngineLine::HandshakeOk => {
                let _ = self.send("isready");
            }
            EngineLine::ReadyOk => self.on_ready(),
            EngineLine::Info(info) => self.on_info(info),
            EngineLine::BestMove { mv, ponder, verdict } => self.on_bestmove(&mv, ponder.as_deref(), verdict),
            EngineLine::NoBestMove => {
                if self.finish_search() {
                    if let Some(goal) = &self.goal {
                        info!(engine = %self.name, "no move in {}", goal.position);
                        let _ = self.events.send(EngineEvent::Checkmate {
                            position: goal.position.clone(),
                        });
                    }
                }
            }
            EngineLine::Other => {}
        }
    }

    fn on_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        for (name, value) in std::mem::take(&mut self.queued_options) {
            let cmd = self.protocol.set_option(&name, &value);
            if self.send(&cmd).is_err() {
                return;
            }
        }
        info!(engine = %self.name, options = self.options.len(), "engine ready");
        let _ = self.events.send(EngineEvent::Ready {
            name: self.name.clone(),
            options: self.options.clone(),
        });
    }

    /// 返回这个 bestmove 是否属于当前搜索
    fn finish_search(&mut self) -> bool {
        if self.superseded > 0 {
            self.superseded -= 1;
            debug!(engine = %self.name, "dropped result of a superseded search");
            return false;
        }
        self.searching = false;
        true
    }

    fn on_info(&mut self, info: InfoLine) {
        if self.superseded > 0 || !self.searching {
            return;
        }
        if info.multipv <= 1 {
            self.last_info = Some(info.clone());
        }
        let Some(first) = info.pv.first() else {
            return;
        };
        let Ok(mv) = MoveId::parse(first) else {
            return;
        };
        if let Some(evaluation) = self.evaluate(mv, None, &info) {
            let _ = self.events.send(EngineEvent::Info(evaluation));
        }
    }

    fn on_bestmove(&mut self, mv: &str, ponder: Option<&str>, verdict: Verdict) {
        if !self.finish_search() {
            return;
        }
        let Some(goal) = self.goal.clone() else {
            return;
        };
        match verdict {
            Verdict::Resign => {
                let _ = self.events.send(EngineEvent::Resignation { position: goal.position });
                return;
            }
            Verdict::Draw => {
                info!(engine = %self.name, "engine offers a draw in {}", goal.position);
                let _ = self.events.send(EngineEvent::DrawOffer { position: goal.position });
                return;
            }
            Verdict::Normal => {}
        }
        let Ok(mv) = MoveId::parse(mv) else {
            warn!(engine = %self.name, "unreadable bestmove `{}`", mv);
            return;
        };
        let ponder = ponder.and_then(|p| MoveId::parse(p).ok());
        let info = self.last_info.take().unwrap_or_default();
        // 只有主变第一步就是 bestmove 时，info 里的分数才属于这个着法
        let info = if info.pv.first().map(String::as_str) == Some(mv.as_str()) || info.pv.is_empty() {
            info
        } else {
            InfoLine {
                depth: info.depth,
                ..InfoLine::default()
            }
        };
        if let Some(evaluation) = self.evaluate(mv, ponder, &info) {
            let _ = self.events.send(EngineEvent::BestMove(evaluation));
        }
    }

    fn evaluate(&self, mv: MoveId, ponder: Option<MoveId>, info: &InfoLine) -> Option<Evaluation> {
        let goal = self.goal.as_ref()?;
        // 引擎有时会输出以前局面的着法，走不通的都丢掉
        let produced = match self.rules.apply_move(&goal.position, mv) {
            Ok(p) => p,
            Err(e) => {
                debug!(engine = %self.name, "dropped stale move: {}", e);
                return None;
            }
        };
        let mover = goal.position.side_to_move();
        let score = match (info.mate, info.score) {
            (Some(mate), _) => Some(RedScore::mate_in(mate, mover)),
            (None, Some(score)) => Some(RedScore::from_external(score, mover)),
            (None, None) => None,
        };
        Some(Evaluation {
            position: goal.position.clone(),
            move_id: mv,
            produced,
            ponder,
            score,
            mate: info.mate.map(|m| m * mover.sign()),
            depth: info.depth,
            multipv: info.multipv.max(1),
            pv: info.pv.iter().filter_map(|m| MoveId::parse(m).ok()).collect(),
        })
    }
}

pub struct EngineSupervisor {
    session: Arc<Mutex<Session>>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl EngineSupervisor {
    /// 启动引擎进程并开始握手
    pub fn start(
        path: &Path,
        protocol: Protocol,
        rules: Arc<dyn GameRules>,
        events: Sender<EngineEvent>,
    ) -> Result<Self, EngineError> {
        let launch_error = |source| EngineError::Launch {
            path: path.to_owned(),
            source,
        };
        let mut command = Command::new(path);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::null());
        // 引擎通常要在自己的目录下找权重文件
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(launch_error)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error(std::io::Error::other("engine stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(std::io::Error::other("engine stdout unavailable")))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "engine".to_owned());
        info!(engine = %name, %protocol, "launching {}", path.display());

        let lines = BufReader::new(stdout).lines();
        match Self::attach(&name, lines, Box::new(stdin), protocol, rules, events) {
            Ok(mut supervisor) => {
                supervisor.child = Some(child);
                Ok(supervisor)
            }
            Err(e) => {
                warn!(engine = %name, "handshake failed: {}", e);
                reap(&mut child);
                Err(e)
            }
        }
    }

    /// 接到任意一对读写端上，测试时用内存通道代替进程
    pub fn attach<L>(
        name: &str,
        lines: L,
        writer: Box<dyn Write + Send>,
        protocol: Protocol,
        rules: Arc<dyn GameRules>,
        events: Sender<EngineEvent>,
    ) -> Result<Self, EngineError>
    where
        L: Iterator<Item = std::io::Result<String>> + Send + 'static,
    {
        let session = Arc::new(Mutex::new(Session {
            name: name.to_owned(),
            protocol,
            writer,
            rules,
            events,
            options: vec![],
            queued_options: vec![],
            ready: false,
            closed: false,
            goal: None,
            generation: 0,
            searching: false,
            superseded: 0,
            last_info: None,
        }));

        let shared = Arc::clone(&session);
        let reader = thread::Builder::new()
            .name(format!("engine-reader-{}", name))
            .spawn(move || poll_loop(lines, shared))
            .map_err(|source| EngineError::Launch {
                path: name.into(),
                source,
            })?;

        session.lock().send(protocol.handshake())?;
        Ok(EngineSupervisor {
            session,
            child: None,
            reader: Some(reader),
        })
    }

    pub fn name(&self) -> String {
        self.session.lock().name.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.session.lock().ready
    }

    pub fn generation(&self) -> u64 {
        self.session.lock().generation
    }

    /// 未就绪时先排队，就绪后一次性下发
    pub fn set_option(&self, name: &str, value: &str) -> Result<(), EngineError> {
        let mut session = self.session.lock();
        if !session.ready {
            session.queued_options.push((name.to_owned(), value.to_owned()));
            return Ok(());
        }
        let cmd = session.protocol.set_option(name, value);
        session.send(&cmd)
    }

    /// 分析新局面，之前的搜索作废。空棋盘或引擎未就绪时返回 false
    pub fn analyze(&self, position: &Position, params: SearchParams) -> Result<bool, EngineError> {
        if position.is_placeholder() {
            debug!("skip analysis of the empty board");
            return Ok(false);
        }
        let mut session = self.session.lock();
        if session.closed {
            return Err(EngineError::Closed);
        }
        if !session.ready {
            return Ok(false);
        }
        if session.searching {
            session.send("stop")?;
            session.superseded += 1;
        }
        session.generation += 1;
        session.last_info = None;
        session.goal = Some(Goal {
            position: position.clone(),
            params,
        });
        session.send(&format!("position fen {}", position.to_engine_fen()))?;
        let go = session.protocol.go(&params);
        session.send(&go)?;
        session.searching = true;
        info!(engine = %session.name, generation = session.generation, "analyze {}", position);
        Ok(true)
    }

    /// 当前分析目标
    pub fn goal(&self) -> Option<(Position, SearchParams)> {
        self.session
            .lock()
            .goal
            .as_ref()
            .map(|g| (g.position.clone(), g.params))
    }

    /// 空闲时调用也没关系
    pub fn stop_analysis(&self) -> Result<(), EngineError> {
        let mut session = self.session.lock();
        if !session.ready || !session.searching {
            return Ok(());
        }
        session.send("stop")
    }

    pub fn quit(&mut self) {
        {
            let mut session = self.session.lock();
            if !session.closed {
                let _ = session.send("quit");
                session.closed = true;
                session.ready = false;
                info!(engine = %session.name, "engine quit");
            }
        }
        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + Duration::from_millis(500);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                    _ => {
                        reap(&mut child);
                        break;
                    }
                }
            }
            // 进程退出后读线程会读到 EOF
            if let Some(reader) = self.reader.take() {
                let _ = reader.join();
            }
        }
    }
}

impl Drop for EngineSupervisor {
    fn drop(&mut self) {
        self.quit();
    }
}

/// 杀掉进程并回收，避免留下僵尸进程
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("kill engine: {}", e);
    }
    let _ = child.wait();
}

fn poll_loop<L>(lines: L, session: Arc<Mutex<Session>>)
where
    L: Iterator<Item = std::io::Result<String>>,
{
    for line in lines {
        match line {
            Ok(line) => session.lock().on_line(&line),
            Err(e) => {
                warn!("engine read error: {}", e);
                break;
            }
        }
    }
    let mut session = session.lock();
    if !session.closed {
        warn!(engine = %session.name, "engine output closed");
        session.closed = true;
        session.ready = false;
        let _ = session.events.send(EngineEvent::Failed(format!("{} exited", session.name)));
    }
}
