use std::fmt;

use crate::{merge, Color, MoveId, Position, RedScore, CHECKMATE_SCORE};

/// 候选着法的来源
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum SourceTag {
    Local,      // 本地库
    MasterBook, // 开局库
    Cloud,      // 云库
    ScoreDb,    // 评分服务
    Engine,     // 引擎
}

/// 分数的精度等级，缓存只接受不低于已有等级的分数
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Precision {
    Book,
    Search,
    Database,
}

impl SourceTag {
    /// 合并时的可信度，数值大的不会被数值小的覆盖
    pub fn trust(&self) -> u8 {
        match self {
            SourceTag::Local => 0,
            SourceTag::MasterBook => 1,
            SourceTag::Engine | SourceTag::ScoreDb => 2,
            SourceTag::Cloud => 3,
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            SourceTag::Local | SourceTag::MasterBook => Precision::Book,
            SourceTag::Engine => Precision::Search,
            SourceTag::Cloud | SourceTag::ScoreDb => Precision::Database,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceTag::Local => "local",
            SourceTag::MasterBook => "master",
            SourceTag::Cloud => "cloud",
            SourceTag::ScoreDb => "scoredb",
            SourceTag::Engine => "engine",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct CandidateMove {
    pub move_id: MoveId,
    /// 走完这一步之后的局面
    pub produced: Position,
    pub score: Option<RedScore>,
    /// 引擎报告的杀棋步数，红方视角
    pub mate: Option<i32>,
    pub source: SourceTag,
    /// 书库标记，例如本地库的 `*`
    pub mark: Option<String>,
    pub memo: Option<String>,
}

impl CandidateMove {
    pub fn new(move_id: MoveId, produced: Position, source: SourceTag) -> Self {
        CandidateMove {
            move_id,
            produced,
            score: None,
            mate: None,
            source,
            mark: None,
            memo: None,
        }
    }

    pub fn with_score(mut self, score: RedScore) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_mate(mut self, mate: i32) -> Self {
        self.mate = Some(mate);
        self
    }

    pub fn with_mark(mut self, mark: impl Into<String>) -> Self {
        self.mark = Some(mark.into());
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    Moves,
    /// 走棋方已被将死，没有候选着法
    Checkmate,
    Stalemate,
    /// 来源不认识这个局面
    Unknown,
}

/// 某个来源针对一个局面给出的结果
#[derive(Clone, PartialEq, Debug)]
pub struct MoveSet {
    pub position: Position,
    pub source: SourceTag,
    pub candidates: Vec<CandidateMove>,
    /// 通过镜像局面查到，着法已经镜像回来
    pub mirrored: bool,
    pub outcome: Outcome,
}

impl MoveSet {
    pub fn empty(position: Position, source: SourceTag) -> Self {
        MoveSet {
            position,
            source,
            candidates: vec![],
            mirrored: false,
            outcome: Outcome::Unknown,
        }
    }

    pub fn with_moves(position: Position, source: SourceTag, candidates: Vec<CandidateMove>) -> Self {
        let outcome = if candidates.is_empty() {
            Outcome::Unknown
        } else {
            Outcome::Moves
        };
        MoveSet {
            position,
            source,
            candidates,
            mirrored: false,
            outcome,
        }
    }

    /// 将死或困毙：没有候选着法
    pub fn terminal(position: Position, source: SourceTag, outcome: Outcome) -> Self {
        MoveSet {
            outcome,
            ..MoveSet::empty(position, source)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// 走棋方无棋可走时的分数，象棋里困毙也算输。
    ///
    /// 分数是红方视角：从走棋方看是 `-CHECKMATE_SCORE`，所以红方被将死得 `-30000`，
    /// 黑方被将死得 `30000`。云库只回一个 `checkmate`，不带符号，符号由走棋方决定。
    pub fn terminal_score(&self) -> Option<RedScore> {
        match self.outcome {
            Outcome::Checkmate | Outcome::Stalemate => {
                Some(RedScore::from_mover(-CHECKMATE_SCORE, self.mover()))
            }
            Outcome::Moves | Outcome::Unknown => None,
        }
    }

    pub fn mover(&self) -> Color {
        self.position.side_to_move()
    }

    /// 对走棋方最有利的分数
    pub fn best_score(&self) -> Option<RedScore> {
        merge::best_for_mover(self.candidates.iter().filter_map(|c| c.score), self.mover())
    }
}
