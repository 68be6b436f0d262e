use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid ICCS move `{0}`")]
pub struct ParseMoveError(pub String);

/// ICCS 着法，例如 `b0c2`：起点列、起点行、终点列、终点行。
///
/// 列用 `a`..`i` 表示，行用 `0`..`9` 表示，红方底线为 0。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MoveId([u8; 4]);

impl MoveId {
    pub fn parse(text: &str) -> Result<Self, ParseMoveError> {
        let bytes = text.trim().as_bytes();
        if bytes.len() != 4 {
            return Err(ParseMoveError(text.to_owned()));
        }
        let mut iccs = [0u8; 4];
        for (i, b) in bytes.iter().enumerate() {
            let b = b.to_ascii_lowercase();
            let ok = if i % 2 == 0 {
                (b'a'..=b'i').contains(&b)
            } else {
                b.is_ascii_digit()
            };
            if !ok {
                return Err(ParseMoveError(text.to_owned()));
            }
            iccs[i] = b;
        }
        Ok(MoveId(iccs))
    }

    /// 由 (列, 行) 坐标构造，列 0..9，行 0..10
    pub fn from_squares(from: (u8, u8), to: (u8, u8)) -> Option<Self> {
        if from.0 > 8 || to.0 > 8 || from.1 > 9 || to.1 > 9 {
            return None;
        }
        Some(MoveId([
            b'a' + from.0,
            b'0' + from.1,
            b'a' + to.0,
            b'0' + to.1,
        ]))
    }

    pub fn from_square(&self) -> (u8, u8) {
        (self.0[0] - b'a', self.0[1] - b'0')
    }

    pub fn to_square(&self) -> (u8, u8) {
        (self.0[2] - b'a', self.0[3] - b'0')
    }

    /// 左右镜像：a <-> i, b <-> h ...，行不变
    pub fn mirror(&self) -> Self {
        let [f1, r1, f2, r2] = self.0;
        MoveId([b'a' + b'i' - f1, r1, b'a' + b'i' - f2, r2])
    }

    pub fn as_str(&self) -> &str {
        // 构造时已经保证全部是 ASCII
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for MoveId {
    type Err = ParseMoveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoveId::parse(s)
    }
}

impl fmt::Display for MoveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for MoveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MoveId({})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let m = MoveId::parse("H2E2").unwrap();
        assert_eq!(m.to_string(), "h2e2");
        assert_eq!(m.from_square(), (7, 2));
        assert_eq!(m.to_square(), (4, 2));
    }

    #[test]
    fn test_reject_bad_moves() {
        assert!(MoveId::parse("j0a1").is_err());
        assert!(MoveId::parse("a0a").is_err());
        assert!(MoveId::parse("a0aa").is_err());
        assert!(MoveId::from_squares((9, 0), (0, 0)).is_none());
    }

    #[test]
    fn test_mirror() {
        let m: MoveId = "b0c2".parse().unwrap();
        assert_eq!(m.mirror().to_string(), "h0g2");
        assert_eq!(m.mirror().mirror(), m);
        // 中路着法镜像后不变
        let center: MoveId = "e3e4".parse().unwrap();
        assert_eq!(center.mirror(), center);
    }
}
