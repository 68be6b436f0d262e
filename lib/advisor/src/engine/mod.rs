/* 外部引擎：协议解析与会话管理 */
mod protocol;
mod supervisor;

pub use protocol::{parse_line, EngineLine, InfoLine, Protocol, SearchParams, Verdict};
pub use supervisor::{EngineEvent, EngineSupervisor, Evaluation};
