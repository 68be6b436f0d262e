/**
 * 着法顾问库（advisor）
 *
 * 说明
 * - engine：外部 UCCI/UCI 引擎的进程管理与协议解析
 * - source：本地库、开局库、云库、评分服务、引擎五种着法来源
 * - aggregator：把各来源的候选着法合并成一张表，按分差排序
 * - cache：局面评估缓存，记录分数、最佳着法、父子关系与失误标记
 * - review：按对局路线逐步复盘
 * - coordinator：唯一持有上面这些状态的线程，对外只暴露命令与事件通道
 */
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod review;
pub mod source;

pub use aggregator::{MergedMove, MergedMoves, SourceAggregator};
pub use cache::{EvaluationCache, EvaluationUpdate, PositionRecord};
pub use config::AdvisorConfig;
pub use coordinator::{launch, Advisor, AdvisorEvent, Command, Coordinator};
pub use error::{AdvisorError, ConfigError, EngineError, SourceError};
pub use review::{ReviewMode, ReviewSession};
