use std::io;
use std::path::PathBuf;

use common::IllegalMoveError;
use thiserror::Error;

/// 着法来源的错误。任何来源出错都不影响其它来源的结果
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Parse(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    IllegalMove(#[from] IllegalMoveError),
    #[error("unknown book format: {0}")]
    UnknownFormat(PathBuf),
    #[error("book database {path}: {source}")]
    Database {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// 组装顾问时的错误
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("cannot start the network runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// 引擎会话错误，出现后调用方需要重建会话
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch engine {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("engine {name} stopped accepting commands: {source}")]
    Protocol {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("engine session failed: {0}")]
    Failed(String),
    #[error("engine session is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
