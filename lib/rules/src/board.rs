/*
 * 详细中文注释 - 象棋棋盘模块（Board 与棋子表示）
 *
 * 设计要点
 * - 棋盘尺寸为 9 列 x 10 行，红方在下，黑方在上
 * - 棋子用 Chess 枚举表示，分黑方/红方与具体棋种；Chess::None 表示空格
 * - Square 表示棋盘坐标，行号 0 是黑方底线；ICCS 行号 = 9 - row
 * - Board 只保存棋子排布与走棋方，用于判断着法合法性并生成下一局面
 *
 * 主要功能
 * - 从裁剪后的 FEN（common::Position）加载局面，以及反向生成
 * - 按棋种判定走法，走子后不能被将军，不能白脸将
 * - Zobrist 哈希：包含棋子布局与当前回合方
 *
 * 注意
 * - 不做搜索和评估，这些交给外部引擎
 */

use common::{Color, MoveId, ParsePositionError, Position};

use crate::constant::{FEN_MAP, ZOBRIST_TABLE};

pub const BOARD_WIDTH: i32 = 9;
pub const BOARD_HEIGHT: i32 = 10;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Chess {
    Black(ChessType),
    Red(ChessType),
    None,
}

impl Chess {
    pub fn belong_to(&self, color: Color) -> bool {
        Some(color) == self.color()
    }
    pub fn chess_type(&self) -> Option<ChessType> {
        match self {
            Chess::Black(ct) => Some(ct.to_owned()),
            Chess::Red(ct) => Some(ct.to_owned()),
            Chess::None => None,
        }
    }
    pub fn color(&self) -> Option<Color> {
        match self {
            Chess::Black(_) => Some(Color::Black),
            Chess::Red(_) => Some(Color::Red),
            Chess::None => None,
        }
    }
    pub fn fen_char(&self) -> Option<char> {
        let c = match self.chess_type()? {
            ChessType::King => 'k',
            ChessType::Advisor => 'a',
            ChessType::Bishop => 'b',
            ChessType::Knight => 'n',
            ChessType::Rook => 'r',
            ChessType::Cannon => 'c',
            ChessType::Pawn => 'p',
        };
        match self {
            Chess::Red(_) => Some(c.to_ascii_uppercase()),
            _ => Some(c),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ChessType {
    King,    // 帅
    Advisor, // 士
    Bishop,  // 相
    Knight,  // 马
    Rook,    // 车
    Cannon,  // 炮
    Pawn,    // 兵
}

impl ChessType {
    pub fn value(&self) -> i32 {
        match self {
            ChessType::King => 0,
            ChessType::Advisor => 1,
            ChessType::Bishop => 2,
            ChessType::Knight => 3,
            ChessType::Rook => 4,
            ChessType::Cannon => 5,
            ChessType::Pawn => 6,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Square {
    pub row: i32,
    pub col: i32,
}

impl Square {
    pub fn new(row: i32, col: i32) -> Self {
        Square { row, col }
    }
    /// ICCS 坐标 (列, 行) 转棋盘坐标
    pub fn from_iccs((file, rank): (u8, u8)) -> Self {
        Square::new(BOARD_HEIGHT - 1 - rank as i32, file as i32)
    }
    pub fn to_iccs(&self) -> (u8, u8) {
        (self.col as u8, (BOARD_HEIGHT - 1 - self.row) as u8)
    }
}

// 棋子是否在棋盘内
pub fn in_board(pos: Square) -> bool {
    pos.row >= 0 && pos.row < BOARD_HEIGHT && pos.col >= 0 && pos.col < BOARD_WIDTH
}

// 棋子是否在己方的楚河汉界以内
pub fn in_country(row: i32, color: Color) -> bool {
    let base_row = if color == Color::Red { BOARD_HEIGHT - 1 } else { 0 };
    (row - base_row).abs() < BOARD_HEIGHT / 2
}

// 棋子是否在九宫格内
pub fn in_palace(pos: Square, color: Color) -> bool {
    if color == Color::Black {
        pos.row >= 0 && pos.row < 3 && pos.col >= 3 && pos.col < 6
    } else {
        pos.row >= 7 && pos.row < BOARD_HEIGHT && pos.col >= 3 && pos.col < 6
    }
}

#[derive(Clone, Debug)]
pub struct Board {
    // 9×10的棋盘，红方在下，黑方在上
    pub chesses: [[Chess; BOARD_WIDTH as usize]; BOARD_HEIGHT as usize],
    pub turn: Color,
}

impl Board {
    pub fn empty() -> Self {
        Board {
            chesses: [[Chess::None; BOARD_WIDTH as usize]; BOARD_HEIGHT as usize],
            turn: Color::Red,
        }
    }

    /// Position 构造时已经校验过格式，这里只管摆子
    pub fn from_position(position: &Position) -> Self {
        let mut board = Board::empty();
        for (i, row) in position.board().split('/').enumerate() {
            let mut j = 0;
            for col in row.chars() {
                if let Some(n) = col.to_digit(10) {
                    j += n as i32;
                } else {
                    if let Some(chess) = FEN_MAP.get(&col) {
                        let pos = Square::new(i as i32, j);
                        if in_board(pos) {
                            board.set_chess(pos, chess.to_owned());
                        }
                    }
                    j += 1;
                }
            }
        }
        board.turn = position.side_to_move();
        board
    }

    pub fn fen_board(&self) -> String {
        let mut ranks = Vec::with_capacity(BOARD_HEIGHT as usize);
        for row in self.chesses.iter() {
            let mut rank = String::new();
            let mut blank = 0;
            for chess in row.iter() {
                match chess.fen_char() {
                    Some(c) => {
                        if blank > 0 {
                            rank.push_str(&blank.to_string());
                            blank = 0;
                        }
                        rank.push(c);
                    }
                    None => blank += 1,
                }
            }
            if blank > 0 {
                rank.push_str(&blank.to_string());
            }
            ranks.push(rank);
        }
        ranks.join("/")
    }

    pub fn to_position(&self) -> Result<Position, ParsePositionError> {
        Position::from_parts(&self.fen_board(), self.turn)
    }

    pub fn zobrist(&self) -> u64 {
        ZOBRIST_TABLE.calc_chesses(&self.chesses, self.turn)
    }

    pub fn chess_at(&self, pos: Square) -> Chess {
        if in_board(pos) {
            self.chesses[pos.row as usize][pos.col as usize]
        } else {
            Chess::None
        }
    }
    pub fn set_chess(&mut self, pos: Square, chess: Chess) {
        self.chesses[pos.row as usize][pos.col as usize] = chess;
    }

    pub fn count_chess_between(&self, posa: Square, posb: Square) -> i32 {
        let mut count = 0;
        if posa.row == posb.row {
            for j in posa.col.min(posb.col) + 1..posb.col.max(posa.col) {
                if self.chess_at(Square::new(posa.row, j)) != Chess::None {
                    count += 1;
                }
            }
        } else if posa.col == posb.col {
            for i in posa.row.min(posb.row) + 1..posb.row.max(posa.row) {
                if self.chess_at(Square::new(i, posa.col)) != Chess::None {
                    count += 1;
                }
            }
        }
        count
    }
    pub fn has_chess_between(&self, posa: Square, posb: Square) -> bool {
        self.count_chess_between(posa, posb) > 0
    }

    pub fn king_position(&self, color: Color) -> Option<Square> {
        let rows = if color == Color::Black { 0..3 } else { 7..10 };
        for i in rows {
            for j in 3..6 {
                let chess = self.chess_at(Square::new(i, j));
                if chess.belong_to(color) && chess.chess_type() == Some(ChessType::King) {
                    return Some(Square::new(i, j));
                }
            }
        }
        None
    }
    pub fn king_eye_to_eye(&self) -> bool {
        let (Some(posa), Some(posb)) = (self.king_position(Color::Red), self.king_position(Color::Black)) else {
            return false;
        };
        posa.col == posb.col && !self.has_chess_between(posa, posb)
    }

    // 检查走子是否合法（包括规则和将军检查）
    pub fn is_move_legal(&self, from: Square, to: Square) -> Result<(), &'static str> {
        if !in_board(from) || !in_board(to) || from == to {
            return Err("square out of board");
        }
        let chess = self.chess_at(from);

        // 1. 检查当前走棋方是否拥有该棋
        let Some(ct) = chess.chess_type() else {
            return Err("no piece on source square");
        };
        if !chess.belong_to(self.turn) {
            return Err("piece belongs to the opponent");
        }

        // 2. 目标格子若有同色棋子则不可走
        if self.chess_at(to).belong_to(self.turn) {
            return Err("target occupied by own piece");
        }

        // 3. 根据棋种判定走法是否合法
        if !self.is_move_valid_for_chess_type(ct, self.turn, from, to) {
            return Err("piece cannot move that way");
        }

        // 4. 走子后是否被将军，若被将军则不合法
        let mut temp_board = self.clone();
        temp_board.apply(from, to);
        if temp_board.is_checked(self.turn) {
            return Err("leaves own king in check");
        }
        Ok(())
    }

    fn is_move_valid_for_chess_type(&self, ct: ChessType, color: Color, from: Square, to: Square) -> bool {
        if !in_board(to) {
            return false;
        }
        let row_diff = (from.row - to.row).abs();
        let col_diff = (from.col - to.col).abs();
        match ct {
            ChessType::King => row_diff + col_diff == 1 && in_palace(to, color),
            ChessType::Advisor => row_diff == 1 && col_diff == 1 && in_palace(to, color),
            ChessType::Bishop => {
                row_diff == 2
                    && col_diff == 2
                    && in_country(to.row, color)
                    && self.chess_at(Square::new((from.row + to.row) / 2, (from.col + to.col) / 2)) == Chess::None
            }
            ChessType::Knight => {
                if row_diff == 2 && col_diff == 1 {
                    // 蹩马腿：纵向
                    self.chess_at(Square::new((from.row + to.row) / 2, from.col)) == Chess::None
                } else if row_diff == 1 && col_diff == 2 {
                    // 蹩马腿：横向
                    self.chess_at(Square::new(from.row, (from.col + to.col) / 2)) == Chess::None
                } else {
                    false
                }
            }
            ChessType::Rook => (row_diff == 0 || col_diff == 0) && !self.has_chess_between(from, to),
            ChessType::Cannon => {
                if row_diff != 0 && col_diff != 0 {
                    return false;
                }
                if self.chess_at(to) == Chess::None {
                    !self.has_chess_between(from, to)
                } else {
                    self.count_chess_between(from, to) == 1
                }
            }
            ChessType::Pawn => {
                // 兵/卒的推进规则
                let forward = if color == Color::Red { -1 } else { 1 };
                let forward_ok = to.row == from.row + forward && col_diff == 0;
                if in_country(from.row, color) {
                    forward_ok
                } else {
                    forward_ok || (row_diff == 0 && col_diff == 1)
                }
            }
        }
    }

    /// 对方任意一子能走到将帅位置即为将军，白脸将也算
    pub fn is_checked(&self, color: Color) -> bool {
        let Some(king) = self.king_position(color) else {
            return true;
        };
        let enemy = color.opponent();
        for i in 0..BOARD_HEIGHT {
            for j in 0..BOARD_WIDTH {
                let pos = Square::new(i, j);
                let chess = self.chess_at(pos);
                if !chess.belong_to(enemy) {
                    continue;
                }
                if let Some(ct) = chess.chess_type() {
                    if ct != ChessType::King && self.is_move_valid_for_chess_type(ct, enemy, pos, king) {
                        return true;
                    }
                }
            }
        }
        self.king_eye_to_eye()
    }

    // 不做合法性检查，直接落子并交换走棋方
    pub fn apply(&mut self, from: Square, to: Square) {
        let chess = self.chess_at(from);
        self.set_chess(from, Chess::None);
        self.set_chess(to, chess);
        self.turn = self.turn.opponent();
    }

    pub fn legal_moves(&self) -> Vec<MoveId> {
        let mut moves = vec![];
        for i in 0..BOARD_HEIGHT {
            for j in 0..BOARD_WIDTH {
                let from = Square::new(i, j);
                if !self.chess_at(from).belong_to(self.turn) {
                    continue;
                }
                for r in 0..BOARD_HEIGHT {
                    for c in 0..BOARD_WIDTH {
                        let to = Square::new(r, c);
                        if self.is_move_legal(from, to).is_ok() {
                            if let Some(m) = MoveId::from_squares(from.to_iccs(), to.to_iccs()) {
                                moves.push(m);
                            }
                        }
                    }
                }
            }
        }
        moves
    }
}
