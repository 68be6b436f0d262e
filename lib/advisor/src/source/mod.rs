/*
 * 着法来源
 *
 * 说明
 * - 本地库、开局库同步返回；云库、评分服务、引擎异步返回
 * - 异步结果先回到协调者，再通过 complete 交还给对应来源，由来源决定是否完成
 * - 任何来源出错只影响自己，不影响其它来源
 */
mod book;
mod cloud;
mod engine;
mod local;
mod master;

pub use book::{decode_vmove, BookEntry, BookFormat, BookTable, DatabaseBook};
pub use cloud::{CloudFlavor, CloudReply, CloudStore, CloudTransport, ReqwestTransport};
pub use engine::EngineSource;
pub use local::LocalStore;
pub use master::MasterBookStore;

use common::{MoveId, MoveSet, Position, SourceTag};

use crate::engine::EngineEvent;
use crate::error::SourceError;

#[derive(Debug)]
pub enum Lookup {
    Ready(MoveSet),
    /// 请求已发出（或者已经在途），结果稍后通过 complete 送达
    Pending,
    Unavailable(SourceError),
}

/// 异步完成的消息
#[derive(Debug)]
pub enum Completion {
    Cloud(CloudReply),
    Engine(EngineEvent),
}

#[derive(Debug)]
pub enum SourceOutcome {
    Moves(MoveSet),
    Unavailable {
        source: SourceTag,
        position: Position,
        error: SourceError,
    },
}

impl SourceOutcome {
    pub fn source(&self) -> SourceTag {
        match self {
            SourceOutcome::Moves(set) => set.source,
            SourceOutcome::Unavailable { source, .. } => *source,
        }
    }

    pub fn position(&self) -> &Position {
        match self {
            SourceOutcome::Moves(set) => &set.position,
            SourceOutcome::Unavailable { position, .. } => position,
        }
    }
}

pub trait MoveSource: Send {
    fn tag(&self) -> SourceTag;

    fn lookup(&mut self, position: &Position) -> Lookup;

    fn complete(&mut self, _completion: &Completion) -> Option<SourceOutcome> {
        None
    }

    /// 记住一局棋的着法，只有本地库会用到
    fn save_line(&mut self, _line: &[(Position, MoveId)]) -> Result<usize, SourceError> {
        Ok(0)
    }

    /// 放弃正在进行的查询
    fn cancel(&mut self) {}

    /// 丢掉来源自己缓存的结果
    fn forget(&mut self) {}

    fn shutdown(&mut self) {}
}
