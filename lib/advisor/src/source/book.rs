/*
 * 书库表：本地库与开局库共用
 *
 * 说明
 * - 条目按局面的镜像不变哈希（symmetry_hash）分组，同时记录存入时局面自身的哈希
 * - 查询时先找完全相同的局面，找不到再找镜像局面，镜像命中的着法要镜像回来
 * - 格式按文件头判断，与扩展名无关
 *   - 文本库每行一个条目：<ICCS 着法> <分数|-> <FEN> [#标记]
 *   - 勇芳库与鹏飞库是 SQLite 数据库，表名分别是 bhobk 与 pfBook，
 *     vkey 是局面哈希，vmove 是 16 位着法，两者高低字节相反，只取 vvalid = 1 的行
 * - 分数是走棋方视角，取出时换算到红方视角
 */
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use common::{CandidateMove, GameRules, MoveId, MoveSet, Position, RedScore, SourceTag};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::SourceError;

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookFormat {
    Text,
    Yfk,
    PengFei,
}

impl BookFormat {
    /// SQLite 文件按表名区分勇芳与鹏飞
    fn from_tables(tables: &[String]) -> Option<Self> {
        let has = |name: &str| tables.iter().any(|t| t.eq_ignore_ascii_case(name));
        if has("pfBook") {
            Some(BookFormat::PengFei)
        } else if has("bhobk") {
            Some(BookFormat::Yfk)
        } else {
            None
        }
    }

    fn table(&self) -> Option<&'static str> {
        match self {
            BookFormat::Text => None,
            BookFormat::Yfk => Some("bhobk"),
            BookFormat::PengFei => Some("pfBook"),
        }
    }
}

/// 看文件头是不是 SQLite 数据库
pub fn is_sqlite(path: &Path) -> Result<bool, SourceError> {
    let io_error = |source| SourceError::Io {
        path: path.to_owned(),
        source,
    };
    let mut header = [0u8; 16];
    match File::open(path).map_err(io_error)?.read_exact(&mut header) {
        Ok(()) => Ok(&header == SQLITE_HEADER),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(io_error(e)),
    }
}

/// 16x16 棋盘编号转 ICCS 坐标，0x33 是 a9，0xcb 是 i0
fn square_from_c90(sq: u8) -> Option<(u8, u8)> {
    let (hi, lo) = (sq >> 4, sq & 0x0f);
    if !(3..=12).contains(&hi) || !(3..=11).contains(&lo) {
        return None;
    }
    Some((lo - 3, 12 - hi))
}

/// 勇芳库低字节是起点，鹏飞库高字节是起点
pub fn decode_vmove(vmove: u16, from_in_high_byte: bool) -> Option<MoveId> {
    let [lo, hi] = vmove.to_le_bytes();
    let (from, to) = if from_in_high_byte { (hi, lo) } else { (lo, hi) };
    MoveId::from_squares(square_from_c90(from)?, square_from_c90(to)?)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookEntry {
    pub position: Position,
    pub stored_hash: u64,
    pub move_id: MoveId,
    pub score: Option<i32>,
    pub mark: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BookTable {
    entries: HashMap<u64, Vec<BookEntry>>,
}

impl BookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 已有相同或镜像相同的条目时返回 false
    pub fn insert(
        &mut self,
        rules: &dyn GameRules,
        position: &Position,
        move_id: MoveId,
        score: Option<i32>,
        mark: Option<String>,
    ) -> bool {
        let stored_hash = rules.position_hash(position);
        let mirror_hash = rules.position_hash(&rules.mirror(position));
        let bucket = self.entries.entry(stored_hash.min(mirror_hash)).or_default();
        let exists = bucket.iter().any(|e| {
            (e.stored_hash == stored_hash && e.move_id == move_id)
                || (e.stored_hash == mirror_hash && e.move_id == move_id.mirror())
        });
        if exists {
            return false;
        }
        bucket.push(BookEntry {
            position: position.clone(),
            stored_hash,
            move_id,
            score,
            mark,
        });
        true
    }

    /// 返回 (条目, 是否经过镜像)
    pub fn find(&self, rules: &dyn GameRules, position: &Position) -> (Vec<BookEntry>, bool) {
        let Some(bucket) = self.entries.get(&rules.symmetry_hash(position)) else {
            return (vec![], false);
        };
        let direct = rules.position_hash(position);
        let exact: Vec<BookEntry> = bucket.iter().filter(|e| e.stored_hash == direct).cloned().collect();
        if !exact.is_empty() {
            return (exact, false);
        }
        let mirror_hash = rules.position_hash(&rules.mirror(position));
        let mirrored = bucket
            .iter()
            .filter(|e| e.stored_hash == mirror_hash)
            .map(|e| BookEntry {
                position: position.clone(),
                stored_hash: direct,
                move_id: e.move_id.mirror(),
                score: e.score,
                mark: e.mark.clone(),
            })
            .collect::<Vec<_>>();
        let hit = !mirrored.is_empty();
        (mirrored, hit)
    }

    /// 查询并转成 MoveSet，走不通的着法跳过
    pub fn lookup(&self, rules: &dyn GameRules, position: &Position, source: SourceTag) -> MoveSet {
        let (entries, mirrored) = self.find(rules, position);
        move_set(rules, position, source, entries, mirrored)
    }

}

fn move_set(
    rules: &dyn GameRules,
    position: &Position,
    source: SourceTag,
    entries: Vec<BookEntry>,
    mirrored: bool,
) -> MoveSet {
    let mover = position.side_to_move();
    let mut candidates: Vec<CandidateMove> = Vec::with_capacity(entries.len());
    for entry in entries {
            if candidates.iter().any(|c| c.move_id == entry.move_id) {
                continue;
            }
            let produced = match rules.apply_move(position, entry.move_id) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%source, "book move rejected: {}", e);
                    continue;
                }
            };
            let mut candidate = CandidateMove::new(entry.move_id, produced, source);
            if let Some(score) = entry.score {
                candidate = candidate.with_score(RedScore::from_external(score, mover));
            }
            if let Some(mark) = entry.mark {
                candidate = candidate.with_mark(mark);
            }
            candidates.push(candidate);
        }
    debug!(%source, hits = candidates.len(), mirrored, "book lookup {}", position);
    let mut set = MoveSet::with_moves(position.clone(), source, candidates);
    set.mirrored = mirrored;
    set
}

impl BookTable {
    pub fn parse(text: &str, rules: &dyn GameRules) -> Self {
        let mut table = BookTable::new();
        let mut skipped = 0usize;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with("//")) {
            if !table.insert_line(line, rules) {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(skipped, "unreadable book lines");
        }
        table
    }

    fn insert_line(&mut self, line: &str, rules: &dyn GameRules) -> bool {
        let (body, mark) = match line.split_once('#') {
            Some((body, mark)) => (body.trim(), Some(mark.trim().to_owned()).filter(|m| !m.is_empty())),
            None => (line, None),
        };
        let mut tokens = body.splitn(3, ' ');
        let (Some(mv), Some(score), Some(fen)) = (tokens.next(), tokens.next(), tokens.next()) else {
            return false;
        };
        let Ok(move_id) = MoveId::parse(mv) else {
            return false;
        };
        let Ok(position) = Position::parse(fen) else {
            return false;
        };
        let score = score.parse::<i32>().ok();
        self.insert(rules, &position, move_id, score, mark);
        true
    }

    /// 只读文本库，数据库格式的文件报 UnknownFormat
    pub fn load(path: &Path, rules: &dyn GameRules) -> Result<Self, SourceError> {
        if is_sqlite(path)? {
            return Err(SourceError::UnknownFormat(path.to_owned()));
        }
        let text = fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_owned(),
            source,
        })?;
        let table = Self::parse(&text, rules);
        info!(entries = table.len(), "loaded book {}", path.display());
        Ok(table)
    }

    /// 按文本格式写出，保证顺序稳定
    pub fn write_text<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        let mut entries: Vec<&BookEntry> = self.entries.values().flatten().collect();
        entries.sort_by(|a, b| (&a.position, a.move_id).cmp(&(&b.position, b.move_id)));
        for e in entries {
            let score = e.score.map(|s| s.to_string()).unwrap_or_else(|| "-".to_owned());
            match &e.mark {
                Some(mark) => writeln!(writer, "{} {} {} #{}", e.move_id, score, e.position, mark)?,
                None => writeln!(writer, "{} {} {}", e.move_id, score, e.position)?,
            }
        }
        Ok(())
    }
}

/// 勇芳或鹏飞库。每次查询都直接问数据库，结果与文本库一样先找原局面、再找镜像局面。
///
/// vkey 要与规则适配器的 `position_hash` 一致才能命中。
pub struct DatabaseBook {
    path: PathBuf,
    format: BookFormat,
    pool: SqlitePool,
    runtime: Handle,
    sql: String,
}

impl DatabaseBook {
    /// 不是 SQLite 文件，或者既没有 bhobk 也没有 pfBook 表时报 UnknownFormat
    pub fn open(path: &Path, runtime: Handle) -> Result<Self, SourceError> {
        if !is_sqlite(path)? {
            return Err(SourceError::UnknownFormat(path.to_owned()));
        }
        let db_error = |source| SourceError::Database {
            path: path.to_owned(),
            source,
        };
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = runtime
            .block_on(SqlitePoolOptions::new().max_connections(1).connect_with(options))
            .map_err(db_error)?;
        let tables: Vec<String> = runtime
            .block_on(sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'").fetch_all(&pool))
            .map_err(db_error)?;
        let Some((format, table)) = BookFormat::from_tables(&tables).and_then(|f| f.table().map(|t| (f, t))) else {
            runtime.block_on(pool.close());
            return Err(SourceError::UnknownFormat(path.to_owned()));
        };
        info!(?format, "opened book database {}", path.display());
        Ok(DatabaseBook {
            path: path.to_owned(),
            format,
            pool,
            runtime,
            sql: format!(
                "SELECT vkey, vmove, vscore FROM {} WHERE (vkey = ?1 OR vkey = ?2) AND vvalid = 1 ORDER BY vscore DESC",
                table
            ),
        })
    }

    pub fn format(&self) -> BookFormat {
        self.format
    }

    pub fn close(&self) {
        self.runtime.block_on(self.pool.close());
        debug!("closed book database {}", self.path.display());
    }

    pub fn lookup(&self, rules: &dyn GameRules, position: &Position, source: SourceTag) -> Result<MoveSet, SourceError> {
        let direct = rules.position_hash(position);
        let mirror = rules.position_hash(&rules.mirror(position));
        let rows: Vec<(i64, i64, Option<i64>)> = self
            .runtime
            .block_on(
                sqlx::query_as(&self.sql)
                    .bind(direct as i64)
                    .bind(mirror as i64)
                    .fetch_all(&self.pool),
            )
            .map_err(|source| SourceError::Database {
                path: self.path.clone(),
                source,
            })?;

        let from_in_high_byte = self.format == BookFormat::PengFei;
        let mut exact = vec![];
        let mut mirrored = vec![];
        for (key, vmove, score) in rows {
            let Some(move_id) = u16::try_from(vmove).ok().and_then(|v| decode_vmove(v, from_in_high_byte)) else {
                debug!(vmove, "unreadable book move");
                continue;
            };
            let entry = BookEntry {
                position: position.clone(),
                stored_hash: key as u64,
                move_id,
                score: score.map(|s| s.clamp(i32::MIN as i64, i32::MAX as i64) as i32),
                mark: None,
            };
            if key as u64 == direct {
                exact.push(entry);
            } else {
                mirrored.push(BookEntry {
                    move_id: move_id.mirror(),
                    ..entry
                });
            }
        }
        Ok(if exact.is_empty() {
            let hit = !mirrored.is_empty();
            move_set(rules, position, source, mirrored, hit)
        } else {
            move_set(rules, position, source, exact, false)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::Outcome;
    use rules::XiangqiRules;

    const BOOK: &str = "\
h2e2 10 rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w - - 0 1 #!
b0c2 - rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w
h9g7 -3 rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C2C4/9/RNBAKABNR b
garbage line
";

    #[test]
    fn test_format_from_tables() {
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(BookFormat::from_tables(&names(&["bhobk"])), Some(BookFormat::Yfk));
        assert_eq!(BookFormat::from_tables(&names(&["bookVersion", "pfBook"])), Some(BookFormat::PengFei));
        assert_eq!(BookFormat::from_tables(&names(&["users"])), None);
    }

    #[test]
    fn test_decode_vmove() {
        // h2 = 0xaa, e2 = 0xa7
        let yfk = u16::from_le_bytes([0xaa, 0xa7]);
        assert_eq!(decode_vmove(yfk, false).unwrap().as_str(), "h2e2");
        let pf = u16::from_le_bytes([0xa7, 0xaa]);
        assert_eq!(decode_vmove(pf, true).unwrap().as_str(), "h2e2");
        assert_eq!(decode_vmove(u16::from_le_bytes([0x33, 0xcb]), false).unwrap().as_str(), "a9i0");
        assert!(decode_vmove(0, false).is_none());
    }

    #[test]
    fn test_lookup_direct_and_mirrored() {
        let rules = XiangqiRules::new();
        let table = BookTable::parse(BOOK, &rules);
        assert_eq!(table.len(), 3);

        let set = table.lookup(&rules, &Position::startpos(), SourceTag::MasterBook);
        assert!(!set.mirrored);
        assert_eq!(set.candidates.len(), 2);
        assert_eq!(set.candidates[0].mark.as_deref(), Some("!"));
        assert_eq!(set.candidates[0].score, Some(RedScore::new(10)));
        assert_eq!(set.candidates[1].score, None);
        assert_eq!(set.outcome, Outcome::Moves);

        // 炮八平五之后黑方的局面，只存了炮二平五的版本
        let left = rules
            .apply_move(&Position::startpos(), MoveId::parse("b2e2").unwrap())
            .unwrap();
        let set = table.lookup(&rules, &left, SourceTag::MasterBook);
        assert!(set.mirrored);
        assert_eq!(set.candidates.len(), 1);
        assert_eq!(set.candidates[0].move_id.as_str(), "b9c7");
        // 黑方走，分数取反
        assert_eq!(set.candidates[0].score, Some(RedScore::new(3)));
        let direct = rules.apply_move(&left, MoveId::parse("b9c7").unwrap()).unwrap();
        assert_eq!(set.candidates[0].produced, direct);
    }

    #[test]
    fn test_insert_rejects_mirrored_duplicate() {
        let rules = XiangqiRules::new();
        let mut table = BookTable::new();
        let start = Position::startpos();
        assert!(table.insert(&rules, &start, MoveId::parse("h2e2").unwrap(), None, None));
        assert!(!table.insert(&rules, &start, MoveId::parse("h2e2").unwrap(), Some(5), None));
        // 开局局面左右对称，b2e2 是 h2e2 的镜像
        assert!(!table.insert(&rules, &start, MoveId::parse("b2e2").unwrap(), None, None));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_write_text_roundtrip() {
        let rules = XiangqiRules::new();
        let table = BookTable::parse(BOOK, &rules);
        let mut out = Vec::new();
        table.write_text(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("h2e2 10 rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w #!"));
        assert!(text.contains("b0c2 - "));
        let again = BookTable::parse(&text, &rules);
        assert_eq!(again.len(), table.len());
    }

    /// 按勇芳库的表结构建一个 SQLite 文件，行是 (vkey, vmove, vscore, vvalid)
    pub(crate) fn write_database(path: &Path, table: &str, rows: &[(u64, u16, Option<i64>, i64)]) {
        let _ = fs::remove_file(path);
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
            let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
            sqlx::query(&format!(
                "CREATE TABLE {} (vindex INTEGER PRIMARY KEY, vkey INTEGER, vdraw INTEGER, vlost INTEGER, \
                 vmove INTEGER, vscore INTEGER, vvalid INTEGER, vwin INTEGER)",
                table
            ))
            .execute(&pool)
            .await
            .unwrap();
            for (key, vmove, score, valid) in rows {
                sqlx::query(&format!(
                    "INSERT INTO {} (vkey, vmove, vscore, vvalid) VALUES (?1, ?2, ?3, ?4)",
                    table
                ))
                .bind(*key as i64)
                .bind(*vmove as i64)
                .bind(*score)
                .bind(*valid)
                .execute(&pool)
                .await
                .unwrap();
            }
            pool.close().await;
        });
    }

    fn temp_book(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("xq-advisor-{}-{}.book", name, std::process::id()))
    }

    #[test]
    fn test_yfk_database_lookup() {
        let rules = XiangqiRules::new();
        let start = Position::startpos();
        let after_h2e2 = rules.apply_move(&start, MoveId::parse("h2e2").unwrap()).unwrap();
        let path = temp_book("yfk");
        write_database(
            &path,
            "bhobk",
            &[
                // h2e2：低字节起点 0xaa，高字节终点 0xa7
                (rules.position_hash(&start), u16::from_le_bytes([0xaa, 0xa7]), Some(8), 1),
                // 作废的条目不取
                (rules.position_hash(&start), u16::from_le_bytes([0x95, 0x85]), Some(30), 0),
                // h9g7
                (rules.position_hash(&after_h2e2), u16::from_le_bytes([0x3a, 0x59]), Some(-3), 1),
            ],
        );

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let book = DatabaseBook::open(&path, runtime.handle().clone()).unwrap();
        assert_eq!(book.format(), BookFormat::Yfk);

        let set = book.lookup(&rules, &start, SourceTag::MasterBook).unwrap();
        assert!(!set.mirrored);
        let moves: Vec<_> = set.candidates.iter().map(|c| (c.move_id.as_str(), c.score)).collect();
        assert_eq!(moves, vec![("h2e2", Some(RedScore::new(8)))]);

        // 炮八平五之后只能通过镜像查到，着法镜像回来，黑方分数取反
        let left = rules.apply_move(&start, MoveId::parse("b2e2").unwrap()).unwrap();
        let set = book.lookup(&rules, &left, SourceTag::MasterBook).unwrap();
        assert!(set.mirrored);
        assert_eq!(set.candidates[0].move_id.as_str(), "b9c7");
        assert_eq!(set.candidates[0].score, Some(RedScore::new(3)));

        let unknown = rules.apply_move(&start, MoveId::parse("c3c4").unwrap()).unwrap();
        assert!(book.lookup(&rules, &unknown, SourceTag::MasterBook).unwrap().is_empty());
        book.close();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_pengfei_database_uses_high_byte_origin() {
        let rules = XiangqiRules::new();
        let path = temp_book("pf");
        let start = Position::startpos();
        write_database(
            &path,
            "pfBook",
            &[(rules.position_hash(&start), u16::from_le_bytes([0xa7, 0xaa]), None, 1)],
        );
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let book = DatabaseBook::open(&path, runtime.handle().clone()).unwrap();
        assert_eq!(book.format(), BookFormat::PengFei);
        let set = book.lookup(&rules, &start, SourceTag::MasterBook).unwrap();
        assert_eq!(set.candidates[0].move_id.as_str(), "h2e2");
        assert_eq!(set.candidates[0].score, None);
        book.close();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_unrecognized_files_are_refused() {
        let rules = XiangqiRules::new();
        let runtime = tokio::runtime::Runtime::new().unwrap();

        // SQLite 文件但没有开局库的表
        let path = temp_book("other-db");
        write_database(&path, "users", &[]);
        assert!(is_sqlite(&path).unwrap());
        assert!(matches!(
            DatabaseBook::open(&path, runtime.handle().clone()),
            Err(SourceError::UnknownFormat(_))
        ));
        // 文本库读取器也不接受数据库文件
        assert!(matches!(BookTable::load(&path, &rules), Err(SourceError::UnknownFormat(_))));
        let _ = fs::remove_file(&path);

        let path = temp_book("text");
        fs::write(&path, BOOK).unwrap();
        assert!(!is_sqlite(&path).unwrap());
        assert!(matches!(
            DatabaseBook::open(&path, runtime.handle().clone()),
            Err(SourceError::UnknownFormat(_))
        ));
        assert_eq!(BookTable::load(&path, &rules).unwrap().len(), 3);
        let _ = fs::remove_file(&path);
    }
}
