/*
 * 云库与评分服务
 *
 * 说明
 * - 网络请求在 tokio 运行时上执行，结果通过 channel 回到协调者
 * - 同一局面同一时间只有一个请求在途，重复查询直接忽略
 * - 传输失败按固定间隔重试，次数用完后报告不可用，不再自动重试
 * - 返回空、unknown、invalid board 表示“没有已知着法”，不是错误
 * - 查询结果按局面缓存，再次查询直接返回
 */
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{CandidateMove, GameRules, MoveId, MoveSet, Outcome, Position, RedScore, SourceTag};
use crossbeam_channel::Sender;
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{Completion, Lookup, MoveSource, SourceOutcome};
use crate::config::RemoteSettings;
use crate::error::SourceError;

/// HTTP 请求的抽象，测试里替换成假的实现
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn fetch(&self, url: &str, query: &[(String, String)]) -> Result<String, SourceError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl CloudTransport for ReqwestTransport {
    async fn fetch(&self, url: &str, query: &[(String, String)]) -> Result<String, SourceError> {
        let url = reqwest::Url::parse_with_params(url, query).map_err(|e| SourceError::Transport(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        response.text().await.map_err(|e| SourceError::Transport(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFlavor {
    /// chessdb.cn 云库，竖线分隔的文本
    ChessDb,
    /// 评分服务，JSON 数组
    ScoreDb,
}

#[derive(Debug, Deserialize)]
struct ScoredMove {
    #[serde(rename = "move")]
    mv: String,
    score: Option<i32>,
}

/// 一条原始记录：着法与走棋方视角的分数
type RawMove = (String, Option<i32>);

impl CloudFlavor {
    pub fn tag(&self) -> SourceTag {
        match self {
            CloudFlavor::ChessDb => SourceTag::Cloud,
            CloudFlavor::ScoreDb => SourceTag::ScoreDb,
        }
    }

    pub fn query(&self, position: &Position) -> Vec<(String, String)> {
        match self {
            CloudFlavor::ChessDb => vec![
                ("board".to_owned(), position.to_string()),
                ("action".to_owned(), "queryall".to_owned()),
            ],
            CloudFlavor::ScoreDb => vec![("fen".to_owned(), position.to_string())],
        }
    }

    /// 解析响应。Ok(Err(outcome)) 表示没有着法的结局
    fn parse_body(&self, body: &str) -> Result<Result<Vec<RawMove>, Outcome>, SourceError> {
        let body = body.trim_end_matches('\0').trim();
        let lowered = body.to_ascii_lowercase();
        match lowered.as_str() {
            "" | "unknown" | "invalid board" | "[]" => return Ok(Err(Outcome::Unknown)),
            "checkmate" => return Ok(Err(Outcome::Checkmate)),
            "stalemate" => return Ok(Err(Outcome::Stalemate)),
            _ => {}
        }
        match self {
            CloudFlavor::ChessDb => lowered
                .split('|')
                .filter(|r| !r.trim().is_empty())
                .map(parse_record)
                .collect::<Result<_, _>>()
                .map(Ok),
            CloudFlavor::ScoreDb => {
                let moves: Vec<ScoredMove> =
                    serde_json::from_str(body).map_err(|e| SourceError::Parse(e.to_string()))?;
                Ok(Ok(moves.into_iter().map(|m| (m.mv.to_ascii_lowercase(), m.score)).collect()))
            }
        }
    }

    /// 把响应转成 MoveSet，分数换算到红方视角，走不通的着法跳过
    pub fn parse(&self, body: &str, position: &Position, rules: &dyn GameRules) -> Result<MoveSet, SourceError> {
        let tag = self.tag();
        let raw = match self.parse_body(body)? {
            Ok(raw) => raw,
            Err(Outcome::Unknown) => return Ok(MoveSet::empty(position.clone(), tag)),
            Err(outcome) => return Ok(MoveSet::terminal(position.clone(), tag, outcome)),
        };
        let mover = position.side_to_move();
        let mut candidates: Vec<CandidateMove> = Vec::with_capacity(raw.len());
        for (text, score) in raw {
            let mv = MoveId::parse(&text).map_err(|e| SourceError::Parse(e.to_string()))?;
            if candidates.iter().any(|c| c.move_id == mv) {
                continue;
            }
            let produced = match rules.apply_move(position, mv) {
                Ok(p) => p,
                Err(e) => {
                    warn!(source = %tag, "cloud move rejected: {}", e);
                    continue;
                }
            };
            let mut candidate = CandidateMove::new(mv, produced, tag);
            if let Some(score) = score {
                candidate = candidate.with_score(RedScore::from_external(score, mover));
            }
            candidates.push(candidate);
        }
        Ok(MoveSet::with_moves(position.clone(), tag, candidates))
    }
}

/// `move:h2e2,score:1,rank:2,note:...`，只取 move 与 score
fn parse_record(record: &str) -> Result<RawMove, SourceError> {
    let mut mv = None;
    let mut score = None;
    for field in record.trim().split(',') {
        let Some((name, value)) = field.split_once(':') else {
            continue;
        };
        match name.trim() {
            "move" => mv = Some(value.trim().to_owned()),
            "score" => score = value.trim().parse::<i32>().ok(),
            _ => {}
        }
    }
    match mv {
        Some(mv) => Ok((mv, score)),
        None => Err(SourceError::Parse(format!("record without move: {}", record))),
    }
}

/// 传输失败时按固定间隔重试，最多 max_attempts 次
pub async fn fetch_with_retry(
    transport: &dyn CloudTransport,
    settings: &RemoteSettings,
    query: &[(String, String)],
) -> Result<String, SourceError> {
    let mut attempt = 1;
    loop {
        match transport.fetch(&settings.url, query).await {
            Ok(body) => return Ok(body),
            Err(e) if attempt < settings.max_attempts => {
                warn!(attempt, "query {} failed, retrying: {}", settings.url, e);
                attempt += 1;
                tokio::time::sleep(settings.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug)]
pub struct CloudReply {
    pub tag: SourceTag,
    pub position: Position,
    pub result: Result<MoveSet, SourceError>,
}

pub struct CloudStore {
    flavor: CloudFlavor,
    settings: Arc<RemoteSettings>,
    transport: Arc<dyn CloudTransport>,
    rules: Arc<dyn GameRules>,
    runtime: Handle,
    replies: Sender<CloudReply>,
    in_flight: HashSet<Position>,
    cache: HashMap<Position, MoveSet>,
}

impl CloudStore {
    pub fn new(
        flavor: CloudFlavor,
        settings: RemoteSettings,
        transport: Arc<dyn CloudTransport>,
        rules: Arc<dyn GameRules>,
        runtime: Handle,
        replies: Sender<CloudReply>,
    ) -> Self {
        CloudStore {
            flavor,
            settings: Arc::new(settings),
            transport,
            rules,
            runtime,
            replies,
            in_flight: HashSet::new(),
            cache: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn spawn(&mut self, position: &Position) {
        self.in_flight.insert(position.clone());
        info!(source = %self.flavor.tag(), "query {}", position);

        let flavor = self.flavor;
        let settings = self.settings.clone();
        let transport = self.transport.clone();
        let rules = self.rules.clone();
        let replies = self.replies.clone();
        let position = position.clone();
        self.runtime.spawn(async move {
            let query = flavor.query(&position);
            let result = fetch_with_retry(transport.as_ref(), &settings, &query)
                .await
                .and_then(|body| flavor.parse(&body, &position, rules.as_ref()));
            let reply = CloudReply {
                tag: flavor.tag(),
                position,
                result,
            };
            if replies.send(reply).is_err() {
                debug!("cloud reply dropped, coordinator is gone");
            }
        });
    }
}

impl MoveSource for CloudStore {
    fn tag(&self) -> SourceTag {
        self.flavor.tag()
    }

    fn lookup(&mut self, position: &Position) -> Lookup {
        if let Some(set) = self.cache.get(position) {
            return Lookup::Ready(set.clone());
        }
        if !self.in_flight.contains(position) {
            self.spawn(position);
        } else {
            debug!(source = %self.flavor.tag(), "query already in flight {}", position);
        }
        Lookup::Pending
    }

    fn forget(&mut self) {
        self.cache.clear();
    }

    fn complete(&mut self, completion: &Completion) -> Option<SourceOutcome> {
        let Completion::Cloud(reply) = completion else {
            return None;
        };
        if reply.tag != self.flavor.tag() || !self.in_flight.remove(&reply.position) {
            return None;
        }
        match &reply.result {
            Ok(set) => {
                debug!(source = %reply.tag, moves = set.candidates.len(), "reply {}", reply.position);
                self.cache.insert(reply.position.clone(), set.clone());
                Some(SourceOutcome::Moves(set.clone()))
            }
            // 响应格式不对当作没有数据，不重试
            Err(SourceError::Parse(e)) => {
                warn!(source = %reply.tag, "unreadable reply for {}: {}", reply.position, e);
                Some(SourceOutcome::Moves(MoveSet::empty(reply.position.clone(), reply.tag)))
            }
            Err(e) => {
                warn!(source = %reply.tag, "query failed for {}: {}", reply.position, e);
                Some(SourceOutcome::Unavailable {
                    source: reply.tag,
                    position: reply.position.clone(),
                    error: SourceError::Transport(e.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use common::IllegalMoveError;
    use crossbeam_channel::unbounded;

    /// 不检查合法性的规则，用于测试任意坐标的着法
    struct AnyMove;

    impl GameRules for AnyMove {
        fn apply_move(&self, position: &Position, mv: MoveId) -> Result<Position, IllegalMoveError> {
            if mv.from_square() == mv.to_square() {
                return Err(IllegalMoveError::new(position, mv, "null move"));
            }
            let side = position.side_to_move().opponent();
            Ok(Position::parse(&format!("{} {}", position.board(), side.fen_token())).unwrap())
        }

        fn mirror(&self, position: &Position) -> Position {
            position.mirrored()
        }

        fn position_hash(&self, position: &Position) -> u64 {
            position.as_str().len() as u64
        }
    }

    struct Scripted {
        calls: AtomicUsize,
        fail_first: usize,
        body: String,
    }

    impl Scripted {
        fn new(fail_first: usize, body: &str) -> Arc<Self> {
            Arc::new(Scripted {
                calls: AtomicUsize::new(0),
                fail_first,
                body: body.to_owned(),
            })
        }
    }

    #[async_trait]
    impl CloudTransport for Scripted {
        async fn fetch(&self, _url: &str, _query: &[(String, String)]) -> Result<String, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(SourceError::Transport("connection refused".to_owned()));
            }
            Ok(self.body.clone())
        }
    }

    fn settings(max_attempts: u32) -> RemoteSettings {
        RemoteSettings {
            url: "http://localhost/chessdb.php".to_owned(),
            max_attempts,
            retry_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(1),
        }
    }

    fn red() -> Position {
        Position::parse("4k4/9/9/9/9/9/9/9/9/R3K4 w").unwrap()
    }

    #[test]
    fn test_parse_chessdb_records() {
        let set = CloudFlavor::ChessDb
            .parse("move:a0a1,score:23|move:a1a2,score:25\0", &red(), &AnyMove)
            .unwrap();
        let moves: Vec<_> = set.candidates.iter().map(|c| (c.move_id.as_str(), c.score)).collect();
        assert_eq!(
            moves,
            vec![("a0a1", Some(RedScore::new(23))), ("a1a2", Some(RedScore::new(25)))]
        );
        assert_eq!(set.source, SourceTag::Cloud);
        assert_eq!(set.best_score(), Some(RedScore::new(25)));
    }

    #[test]
    fn test_parse_black_scores_are_negated() {
        let black = Position::parse("4k4/9/9/9/9/9/9/9/9/R3K4 b").unwrap();
        let set = CloudFlavor::ChessDb
            .parse("move:e9e8,score:-15,rank:0,note:? (00-00)", &black, &AnyMove)
            .unwrap();
        assert_eq!(set.candidates[0].score, Some(RedScore::new(15)));
    }

    #[test]
    fn test_parse_extreme_score_is_clamped() {
        let black = Position::parse("4k4/9/9/9/9/9/9/9/9/R3K4 b").unwrap();
        let set = CloudFlavor::ChessDb
            .parse("move:e9e8,score:-2147483648", &black, &AnyMove)
            .unwrap();
        assert_eq!(set.candidates[0].score, Some(RedScore::new(common::MATE_SCORE)));
    }

    #[test]
    fn test_parse_special_tokens() {
        for body in ["", "unknown", "invalid board", "UNKNOWN\0"] {
            let set = CloudFlavor::ChessDb.parse(body, &red(), &AnyMove).unwrap();
            assert!(set.is_empty());
            assert_eq!(set.outcome, Outcome::Unknown);
        }
        let set = CloudFlavor::ChessDb.parse("checkmate", &red(), &AnyMove).unwrap();
        assert_eq!(set.outcome, Outcome::Checkmate);
        assert_eq!(set.terminal_score(), Some(RedScore::new(-common::CHECKMATE_SCORE)));
        let set = CloudFlavor::ChessDb.parse("stalemate", &red(), &AnyMove).unwrap();
        assert_eq!(set.outcome, Outcome::Stalemate);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            CloudFlavor::ChessDb.parse("score:12", &red(), &AnyMove),
            Err(SourceError::Parse(_))
        ));
        assert!(matches!(
            CloudFlavor::ScoreDb.parse("{not json", &red(), &AnyMove),
            Err(SourceError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_score_db_json() {
        let body = r#"[{"move":"a0a1","score":12},{"move":"a0a0","score":3},{"move":"a0b0","score":null}]"#;
        let set = CloudFlavor::ScoreDb.parse(body, &red(), &AnyMove).unwrap();
        // a0a0 走不通，跳过
        assert_eq!(set.candidates.len(), 2);
        assert_eq!(set.source, SourceTag::ScoreDb);
        assert_eq!(set.candidates[1].score, None);
        assert_eq!(
            CloudFlavor::ScoreDb.query(&red()),
            vec![("fen".to_owned(), red().to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let transport = Scripted::new(2, "move:a0a1,score:1");
        let body = fetch_with_retry(transport.as_ref(), &settings(3), &[]).await.unwrap();
        assert_eq!(body, "move:a0a1,score:1");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let transport = Scripted::new(usize::MAX, "");
        let err = fetch_with_retry(transport.as_ref(), &settings(5), &[]).await.unwrap_err();
        assert!(matches!(err, SourceError::Transport(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_single_request_in_flight() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let transport = Scripted::new(0, "move:a0a1,score:23|move:a1a2,score:25");
        let (tx, rx) = unbounded();
        let mut store = CloudStore::new(
            CloudFlavor::ChessDb,
            settings(3),
            transport.clone(),
            Arc::new(AnyMove),
            runtime.handle().clone(),
            tx,
        );

        assert!(matches!(store.lookup(&red()), Lookup::Pending));
        assert!(matches!(store.lookup(&red()), Lookup::Pending));
        assert_eq!(store.in_flight(), 1);

        // 在当前线程的运行时上驱动任务，直到回复送达
        let reply = runtime.block_on(async {
            loop {
                if let Ok(reply) = rx.try_recv() {
                    break reply;
                }
                tokio::task::yield_now().await;
            }
        });
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let Some(SourceOutcome::Moves(set)) = store.complete(&Completion::Cloud(reply)) else {
            panic!("expected moves");
        };
        assert_eq!(set.candidates.len(), 2);
        assert_eq!(store.in_flight(), 0);

        // 第二次查询直接走缓存
        assert!(matches!(store.lookup(&red()), Lookup::Ready(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_query_is_reported_once() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (tx, _rx) = unbounded();
        let mut store = CloudStore::new(
            CloudFlavor::ChessDb,
            settings(3),
            Scripted::new(usize::MAX, ""),
            Arc::new(AnyMove),
            runtime.handle().clone(),
            tx,
        );
        store.lookup(&red());
        let reply = CloudReply {
            tag: SourceTag::Cloud,
            position: red(),
            result: Err(SourceError::Transport("timeout".to_owned())),
        };
        let outcome = store.complete(&Completion::Cloud(reply)).unwrap();
        assert!(matches!(outcome, SourceOutcome::Unavailable { source: SourceTag::Cloud, .. }));

        // 没有在途请求的回复不再处理
        let late = CloudReply {
            tag: SourceTag::Cloud,
            position: red(),
            result: Err(SourceError::Transport("timeout".to_owned())),
        };
        assert!(store.complete(&Completion::Cloud(late)).is_none());

        // 格式错误的回复当作没有着法
        store.lookup(&red());
        let garbled = CloudReply {
            tag: SourceTag::Cloud,
            position: red(),
            result: Err(SourceError::Parse("record without move".to_owned())),
        };
        let Some(SourceOutcome::Moves(set)) = store.complete(&Completion::Cloud(garbled)) else {
            panic!("parse errors are not failures");
        };
        assert!(set.is_empty());
    }
}
