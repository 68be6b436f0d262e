/* 本地库：用户自己积累的着法，着法统一带 `*` 标记，可以把对局存进来 */
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{GameRules, MoveId, Position, SourceTag};
use tracing::{info, warn};

use super::{BookTable, Lookup, MoveSource};
use crate::error::SourceError;

pub const LOCAL_MARK: &str = "*";

pub struct LocalStore {
    table: BookTable,
    rules: Arc<dyn GameRules>,
    path: Option<PathBuf>,
}

impl LocalStore {
    pub fn new(rules: Arc<dyn GameRules>) -> Self {
        LocalStore {
            table: BookTable::new(),
            rules,
            path: None,
        }
    }

    /// 文件读不出来时退化成空库，之后保存仍写回这个路径。
    /// 文件是别的格式（例如开局库数据库）时不写回，免得覆盖。
    pub fn open(path: &Path, rules: Arc<dyn GameRules>) -> Self {
        let (table, path) = match BookTable::load(path, rules.as_ref()) {
            Ok(table) => (table, Some(path.to_owned())),
            Err(e @ SourceError::UnknownFormat(_)) => {
                warn!("local book is not a text book, saving is disabled: {}", e);
                (BookTable::new(), None)
            }
            Err(e) => {
                warn!("local book unavailable, starting empty: {}", e);
                (BookTable::new(), Some(path.to_owned()))
            }
        };
        LocalStore { table, rules, path }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn add(&mut self, position: &Position, mv: MoveId, score: Option<i32>) -> Result<bool, SourceError> {
        // 先验证着法，非法着法不进库
        self.rules.apply_move(position, mv)?;
        Ok(self
            .table
            .insert(self.rules.as_ref(), position, mv, score, Some(LOCAL_MARK.to_owned())))
    }

    /// 记录对局中的每一步，已存在（含镜像）的跳过，返回新增条数
    pub fn record_line(&mut self, line: &[(Position, MoveId)]) -> Result<usize, SourceError> {
        let mut added = 0;
        for (position, mv) in line {
            if self.add(position, *mv, None)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), SourceError> {
        let io_error = |source| SourceError::Io {
            path: path.to_owned(),
            source,
        };
        let file = File::create(path).map_err(io_error)?;
        self.table.write_text(BufWriter::new(file)).map_err(io_error)?;
        info!(entries = self.table.len(), "saved local book {}", path.display());
        Ok(())
    }
}

impl MoveSource for LocalStore {
    fn tag(&self) -> SourceTag {
        SourceTag::Local
    }

    fn lookup(&mut self, position: &Position) -> Lookup {
        Lookup::Ready(self.table.lookup(self.rules.as_ref(), position, SourceTag::Local))
    }

    fn save_line(&mut self, line: &[(Position, MoveId)]) -> Result<usize, SourceError> {
        let added = self.record_line(line)?;
        if added > 0 {
            if let Some(path) = &self.path {
                self.write_to(path)?;
            }
        }
        Ok(added)
    }
}
