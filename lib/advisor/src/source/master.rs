/* 开局库：只读，支持文本库与勇芳、鹏飞两种 SQLite 库 */
use std::path::Path;
use std::sync::Arc;

use common::{GameRules, Position, SourceTag};
use tokio::runtime::Handle;
use tracing::warn;

use super::book::is_sqlite;
use super::{BookFormat, BookTable, DatabaseBook, Lookup, MoveSource};
use crate::error::SourceError;

enum Book {
    Text(BookTable),
    Database(DatabaseBook),
}

pub struct MasterBookStore {
    book: Book,
    rules: Arc<dyn GameRules>,
}

impl MasterBookStore {
    /// 按文件头选格式。数据库查询在 runtime 上执行
    pub fn open(path: &Path, rules: Arc<dyn GameRules>, runtime: Handle) -> Result<Self, SourceError> {
        let book = if is_sqlite(path)? {
            Book::Database(DatabaseBook::open(path, runtime)?)
        } else {
            Book::Text(BookTable::load(path, rules.as_ref())?)
        };
        Ok(MasterBookStore { book, rules })
    }

    pub fn format(&self) -> BookFormat {
        match &self.book {
            Book::Text(_) => BookFormat::Text,
            Book::Database(db) => db.format(),
        }
    }
}

impl MoveSource for MasterBookStore {
    fn tag(&self) -> SourceTag {
        SourceTag::MasterBook
    }

    fn lookup(&mut self, position: &Position) -> Lookup {
        let rules = self.rules.as_ref();
        match &self.book {
            Book::Text(table) => Lookup::Ready(table.lookup(rules, position, SourceTag::MasterBook)),
            Book::Database(db) => match db.lookup(rules, position, SourceTag::MasterBook) {
                Ok(set) => Lookup::Ready(set),
                Err(e) => {
                    warn!("master book query failed: {}", e);
                    Lookup::Unavailable(e)
                }
            },
        }
    }

    fn shutdown(&mut self) {
        if let Book::Database(db) = &self.book {
            db.close();
        }
    }
}
