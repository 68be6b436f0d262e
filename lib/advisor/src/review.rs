/* 复盘：按顺序逐个评估对局路线上的局面，当前局面有了结果才走下一步 */
use common::{Position, SourceTag};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewMode {
    Cloud,
    Engine,
}

impl ReviewMode {
    pub fn sources(&self) -> &'static [SourceTag] {
        match self {
            ReviewMode::Cloud => &[SourceTag::Cloud],
            ReviewMode::Engine => &[SourceTag::Engine],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewSession {
    mode: ReviewMode,
    line: Vec<Position>,
    step: usize,
    cancelled: bool,
}

impl ReviewSession {
    pub fn new(mode: ReviewMode, line: Vec<Position>) -> Self {
        info!(?mode, steps = line.len(), "review started");
        ReviewSession {
            mode,
            line,
            step: 0,
            cancelled: false,
        }
    }

    pub fn mode(&self) -> ReviewMode {
        self.mode
    }

    pub fn sources(&self) -> &'static [SourceTag] {
        self.mode.sources()
    }

    /// 正在评估的局面，复盘结束或取消后为 None
    pub fn current(&self) -> Option<&Position> {
        if self.cancelled {
            return None;
        }
        self.line.get(self.step)
    }

    /// 收到某个来源的结果（包括不可用）。属于当前步时前进，返回下一个要评估的局面
    pub fn on_recorded(&mut self, source: SourceTag, position: &Position) -> Option<Position> {
        if !self.sources().contains(&source) || self.current() != Some(position) {
            return None;
        }
        self.step += 1;
        let next = self.current().cloned();
        if next.is_none() {
            info!(mode = ?self.mode, "review finished");
        }
        next
    }

    /// (已完成, 总数)
    pub fn progress(&self) -> (usize, usize) {
        (self.step.min(self.line.len()), self.line.len())
    }

    pub fn is_finished(&self) -> bool {
        self.cancelled || self.step >= self.line.len()
    }

    pub fn cancel(&mut self) {
        if !self.is_finished() {
            info!(mode = ?self.mode, step = self.step, "review cancelled");
        }
        self.cancelled = true;
    }
}
