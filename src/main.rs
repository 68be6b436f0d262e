use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use advisor::{launch, Advisor, AdvisorConfig, AdvisorEvent, Command, MergedMove, ReviewMode};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use common::{GameRules, MoveId, Position};
use crossbeam_channel::RecvTimeoutError;
use rules::XiangqiRules;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "xq-advisor")]
#[command(about = "象棋着法顾问：合并本地库、开局库、云库与引擎的着法", long_about = None)]
struct Cli {
    /// 配置文件（TOML），不给就用默认配置
    #[arg(long)]
    config: Option<PathBuf>,

    /// 起始局面 FEN，默认开局
    #[arg(long)]
    fen: Option<String>,

    /// 从起始局面依次走的着法，空格分隔，例如 "h2e2 h9g7"
    #[arg(long, default_value = "")]
    moves: String,

    /// 等待结果的秒数
    #[arg(long, default_value = "5")]
    wait: u64,

    /// 复盘整条路线
    #[arg(long, value_enum)]
    review: Option<ReviewArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReviewArg {
    Cloud,
    Engine,
}

impl From<ReviewArg> for ReviewMode {
    fn from(arg: ReviewArg) -> Self {
        match arg {
            ReviewArg::Cloud => ReviewMode::Cloud,
            ReviewArg::Engine => ReviewMode::Engine,
        }
    }
}

fn init_logging(config: &AdvisorConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// 起始局面加着法，得到整条路线上的 (局面, 着法)
fn parse_line(rules: &dyn GameRules, start: Position, moves: &str) -> anyhow::Result<Vec<(Position, MoveId)>> {
    let mut line = vec![];
    let mut position = start;
    for text in moves.split_whitespace() {
        let mv = MoveId::parse(text)?;
        let next = rules.apply_move(&position, mv)?;
        line.push((position, mv));
        position = next;
    }
    Ok(line)
}

fn print_moves(position: &Position, moves: &[MergedMove]) {
    println!("{}", position);
    if moves.is_empty() {
        println!("  (no moves)");
    }
    for m in moves {
        let c = &m.candidate;
        let score = c.score.map(|s| s.to_string()).unwrap_or_else(|| "-".to_owned());
        let diff = m.diff.map(|d| d.to_string()).unwrap_or_else(|| "-".to_owned());
        let source = m.score_source.unwrap_or(c.source);
        println!(
            "  {} {:>6} {:>5} {:<8} {}{}",
            c.move_id,
            score,
            diff,
            source,
            c.mark.as_deref().unwrap_or(""),
            c.memo.as_deref().unwrap_or("")
        );
    }
}

/// 一直收事件到截止时间，或者 done 返回 true
fn drain_until(advisor: &Advisor, deadline: Instant, mut done: impl FnMut(AdvisorEvent) -> bool) {
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match advisor.events().recv_timeout(left) {
            Ok(event) => {
                if done(event) {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => return,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("advisor stopped early");
                return;
            }
        }
    }
}

fn report_events(event: &AdvisorEvent) {
    match event {
        AdvisorEvent::EngineReady { name, .. } => info!(engine = %name, "engine ready"),
        AdvisorEvent::EngineFailed(reason) => warn!("engine failed: {}", reason),
        AdvisorEvent::SourceUnavailable { source, reason, .. } => warn!(%source, "unavailable: {}", reason),
        AdvisorEvent::Checkmate { position } => println!("checkmate: {}", position),
        AdvisorEvent::Resignation { position } => println!("engine resigns: {}", position),
        AdvisorEvent::DrawOffer { position } => println!("engine offers a draw: {}", position),
        AdvisorEvent::ReviewProgress { done, total } => info!("review {}/{}", done, total),
        _ => {}
    }
}

fn review(advisor: &Advisor, line: Vec<Position>, mode: ReviewMode, deadline: Instant) {
    advisor.send(Command::SetLine(line.clone()));
    advisor.send(Command::StartReview(mode));
    drain_until(advisor, deadline, |event| {
        report_events(&event);
        matches!(event, AdvisorEvent::ReviewFinished { .. })
    });

    for (step, position) in line.iter().enumerate() {
        let Some(record) = advisor.snapshot(position) else {
            println!("{:>3} {} -", step, position);
            continue;
        };
        let score = record.score.map(|s| s.to_string()).unwrap_or_else(|| "-".to_owned());
        let diff = record.diff.map(|d| d.to_string()).unwrap_or_default();
        let better = record
            .flagged_alternative
            .map(|moves| {
                let moves: Vec<String> = moves.iter().map(|m| m.to_string()).collect();
                format!("  better: {}", moves.join(" "))
            })
            .unwrap_or_default();
        println!("{:>3} {:>6} {:>5} {}{}", step, score, diff, position, better);
    }
}

fn hints(advisor: &Advisor, line: &[(Position, MoveId)], target: &Position, deadline: Instant) {
    if line.is_empty() {
        advisor.send(Command::Evaluate(target.clone()));
    }
    for (from, mv) in line {
        advisor.send(Command::PlayMove {
            from: from.clone(),
            mv: *mv,
        });
    }
    let mut latest: Vec<MergedMove> = vec![];
    drain_until(advisor, deadline, |event| {
        report_events(&event);
        if let AdvisorEvent::HintsReady { position, moves } = event {
            if position == *target {
                latest = moves;
            }
        }
        false
    });
    print_moves(target, &latest);
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AdvisorConfig::load(cli.config.as_deref()).context("failed to load config")?;
    init_logging(&config);

    let rules: Arc<dyn GameRules> = Arc::new(XiangqiRules::new());
    let start = match &cli.fen {
        Some(fen) => Position::parse(fen).with_context(|| format!("bad fen: {}", fen))?,
        None => Position::startpos(),
    };
    let line = parse_line(rules.as_ref(), start.clone(), &cli.moves).context("bad move list")?;
    let target = match line.last() {
        Some((from, mv)) => rules.apply_move(from, *mv)?,
        None => start,
    };

    let advisor = launch(&config, rules).context("failed to start advisor")?;
    let deadline = Instant::now() + Duration::from_secs(cli.wait);
    match cli.review {
        Some(mode) => {
            let mut positions: Vec<Position> = line.iter().map(|(p, _)| p.clone()).collect();
            positions.push(target);
            review(&advisor, positions, mode.into(), deadline);
        }
        None => hints(&advisor, &line, &target, deadline),
    }
    advisor.shutdown();
    Ok(())
}
