/*
 * 引擎协议：UCCI（中国象棋通用引擎协议）与 UCI
 *
 * 说明
 * - 这里只做命令拼装与输出行解析，不持有任何状态
 * - UCCI: ucci/ucciok, setoption <name> <value>, go depth N / go time T, nobestmove
 * - UCI:  uci/uciok, setoption name <name> value <value>, score cp/mate, bestmove (none)
 */
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;


static ID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^id\s+name\s+(?P<name>.+?)\s*$").expect("id regex is valid"));
static OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^option\s+(?:name\s+)?(?P<name>.+?)\s+type\b").expect("option regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ucci,
    Uci,
}

impl Protocol {
    pub fn handshake(&self) -> &'static str {
        match self {
            Protocol::Ucci => "ucci",
            Protocol::Uci => "uci",
        }
    }

    pub fn set_option(&self, name: &str, value: &str) -> String {
        match self {
            Protocol::Ucci => format!("setoption {} {}", name, value),
            Protocol::Uci => format!("setoption name {} value {}", name, value),
        }
    }

    pub fn go(&self, params: &SearchParams) -> String {
        let mut cmd = String::from("go");
        if params.depth > 0 {
            cmd.push_str(&format!(" depth {}", params.depth));
        }
        if params.movetime > 0 {
            match self {
                Protocol::Ucci => cmd.push_str(&format!(" time {}", params.movetime)),
                Protocol::Uci => cmd.push_str(&format!(" movetime {}", params.movetime)),
            }
        }
        if params.is_unbounded() {
            match self {
                Protocol::Ucci => cmd.push_str(" depth infinite"),
                Protocol::Uci => cmd.push_str(" infinite"),
            }
        }
        cmd
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.handshake())
    }
}

/// 搜索限制，0 表示该维度不限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchParams {
    pub depth: u32,
    pub movetime: u64,
}

impl SearchParams {
    pub fn depth(depth: u32) -> Self {
        SearchParams { depth, movetime: 0 }
    }

    pub fn is_unbounded(&self) -> bool {
        self.depth == 0 && self.movetime == 0
    }
}

/// 一行 info 输出，分数是走棋方视角
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoLine {
    pub depth: Option<u32>,
    pub score: Option<i32>,
    pub mate: Option<i32>,
    pub multipv: u32,
    pub pv: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Normal,
    Resign,
    Draw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLine {
    IdName(String),
    OptionName(String),
    HandshakeOk,
    ReadyOk,
    Info(InfoLine),
    BestMove {
        mv: String,
        ponder: Option<String>,
        verdict: Verdict,
    },
    /// 没有着法可走，被将死或困毙
    NoBestMove,
    Other,
}

pub fn parse_line(line: &str) -> EngineLine {
    let line = line.trim();
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("id") => ID_NAME
            .captures(line)
            .map(|c| EngineLine::IdName(c["name"].to_owned()))
            .unwrap_or(EngineLine::Other),
        Some("option") => OPTION
            .captures(line)
            .map(|c| EngineLine::OptionName(c["name"].to_owned()))
            .unwrap_or(EngineLine::Other),
        Some("ucciok") | Some("uciok") => EngineLine::HandshakeOk,
        Some("readyok") => EngineLine::ReadyOk,
        Some("nobestmove") => EngineLine::NoBestMove,
        Some("bestmove") => parse_bestmove(tokens),
        Some("info") => parse_info(tokens).map(EngineLine::Info).unwrap_or(EngineLine::Other),
        _ => EngineLine::Other,
    }
}

fn parse_bestmove<'a>(mut tokens: impl Iterator<Item = &'a str>) -> EngineLine {
    let Some(mv) = tokens.next() else {
        return EngineLine::NoBestMove;
    };
    if mv == "(none)" || mv == "0000" {
        return EngineLine::NoBestMove;
    }
    let mut ponder = None;
    let mut verdict = Verdict::Normal;
    while let Some(token) = tokens.next() {
        match token {
            "ponder" => ponder = tokens.next().map(str::to_owned),
            "resign" => verdict = Verdict::Resign,
            "draw" => verdict = Verdict::Draw,
            _ => {}
        }
    }
    EngineLine::BestMove {
        mv: mv.to_owned(),
        ponder,
        verdict,
    }
}

fn parse_info<'a>(tokens: impl Iterator<Item = &'a str>) -> Option<InfoLine> {
    let tokens: Vec<&str> = tokens.collect();
    let mut info = InfoLine {
        multipv: 1,
        ..InfoLine::default()
    };
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "depth" => {
                info.depth = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "score" => match tokens.get(i + 1) {
                Some(&"cp") => {
                    info.score = tokens.get(i + 2).and_then(|t| t.parse().ok());
                    i += 3;
                }
                Some(&"mate") => {
                    info.mate = tokens.get(i + 2).and_then(|t| t.parse().ok());
                    i += 3;
                }
                _ => {
                    info.score = tokens.get(i + 1).and_then(|t| t.parse().ok());
                    i += 2;
                }
            },
            "mate" => {
                info.mate = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "multipv" => {
                info.multipv = tokens.get(i + 1).and_then(|t| t.parse().ok()).unwrap_or(1);
                i += 2;
            }
            "pv" => {
                info.pv = tokens[i + 1..].iter().map(|t| t.to_string()).collect();
                break;
            }
            // 其余字段（nodes、time、nps、seldepth ...）不需要
            _ => i += 1,
        }
    }
    if info.score.is_none() && info.mate.is_none() && info.pv.is_empty() {
        return None;
    }
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_lines() {
        assert_eq!(parse_line("id name Pikafish 2024"), EngineLine::IdName("Pikafish 2024".into()));
        assert_eq!(
            parse_line("option usemillisec type check"),
            EngineLine::OptionName("usemillisec".into())
        );
        assert_eq!(
            parse_line("option name Hash type spin default 16 min 1 max 33554432"),
            EngineLine::OptionName("Hash".into())
        );
        assert_eq!(parse_line("ucciok"), EngineLine::HandshakeOk);
        assert_eq!(parse_line("readyok"), EngineLine::ReadyOk);
        assert_eq!(parse_line("copyprotection ok"), EngineLine::Other);
    }

    #[test]
    fn test_info_ucci() {
        let EngineLine::Info(info) = parse_line("info depth 12 score 35 pv h2e2 h9g7 h0g2") else {
            panic!("not an info line");
        };
        assert_eq!(info.depth, Some(12));
        assert_eq!(info.score, Some(35));
        assert_eq!(info.mate, None);
        assert_eq!(info.multipv, 1);
        assert_eq!(info.pv, vec!["h2e2", "h9g7", "h0g2"]);
    }

    #[test]
    fn test_info_uci() {
        let line = "info depth 20 seldepth 28 multipv 2 score cp -14 nodes 123456 nps 900000 time 137 pv b2e2 b9c7";
        let EngineLine::Info(info) = parse_line(line) else {
            panic!("not an info line");
        };
        assert_eq!(info.depth, Some(20));
        assert_eq!(info.score, Some(-14));
        assert_eq!(info.multipv, 2);
        assert_eq!(info.pv[0], "b2e2");

        let EngineLine::Info(info) = parse_line("info depth 30 score mate -3 pv e9e8") else {
            panic!("not an info line");
        };
        assert_eq!(info.mate, Some(-3));
        assert_eq!(parse_line("info string NNUE loaded"), EngineLine::Other);
    }

    #[test]
    fn test_bestmove() {
        assert_eq!(
            parse_line("bestmove h2e2 ponder h9g7"),
            EngineLine::BestMove {
                mv: "h2e2".into(),
                ponder: Some("h9g7".into()),
                verdict: Verdict::Normal
            }
        );
        assert!(matches!(
            parse_line("bestmove a0a1 resign"),
            EngineLine::BestMove { verdict: Verdict::Resign, .. }
        ));
        assert!(matches!(
            parse_line("bestmove a0a1 draw"),
            EngineLine::BestMove { verdict: Verdict::Draw, .. }
        ));
        assert_eq!(parse_line("nobestmove"), EngineLine::NoBestMove);
        assert_eq!(parse_line("bestmove (none)"), EngineLine::NoBestMove);
    }

    #[test]
    fn test_commands() {
        assert_eq!(Protocol::Ucci.set_option("Hash", "64"), "setoption Hash 64");
        assert_eq!(Protocol::Uci.set_option("Hash", "64"), "setoption name Hash value 64");
        assert_eq!(Protocol::Ucci.go(&SearchParams::depth(12)), "go depth 12");
        assert_eq!(Protocol::Ucci.go(&SearchParams::default()), "go depth infinite");
        assert_eq!(Protocol::Uci.go(&SearchParams::default()), "go infinite");
        assert_eq!(
            Protocol::Uci.go(&SearchParams { depth: 0, movetime: 3000 }),
            "go movetime 3000"
        );
    }
}
