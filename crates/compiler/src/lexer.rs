//! Scanner for Orus source text.
//!
//! Produces a flat token stream with 1-based line/column positions on every
//! token. Newlines are statement separators, so they are real tokens, but
//! only at bracket depth zero: inside `(...)` and `[...]` the scanner
//! swallows them, which lets argument lists and array literals span lines.

use std::fmt;

/// Integer literal suffix. Unsuffixed literals default to `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSuffix {
    None,
    I64,
    U32,
    U64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Grouping and punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    DotDot,
    Colon,
    Semicolon,
    Newline,
    Arrow,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    Equal,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // Literals
    Identifier,
    Int(u64, IntSuffix),
    Float(f64),
    Str(String),

    // Keywords
    Fn,
    Let,
    Mut,
    Static,
    Const,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Return,
    True,
    False,
    Nil,
    And,
    Or,
    Not,
    Struct,
    Enum,
    Impl,
    Try,
    Catch,
    Use,
    As,
    Pub,
    Print,
    PrintNoNewline,

    Eof,
    /// Scan error; the message describes the problem.
    Error(String),
}

impl TokenKind {
    /// Keywords that start a statement, used as panic-mode sync points.
    pub fn starts_statement(&self) -> bool {
        matches!(
            self,
            TokenKind::Fn
                | TokenKind::Let
                | TokenKind::Static
                | TokenKind::Const
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Return
                | TokenKind::Struct
                | TokenKind::Enum
                | TokenKind::Impl
                | TokenKind::Try
                | TokenKind::Use
                | TokenKind::Pub
                | TokenKind::Print
                | TokenKind::PrintNoNewline
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    /// 1-based source line.
    pub line: u32,
    /// 1-based source column of the token's first character.
    pub column: u32,
}

impl Token {
    pub fn length(&self) -> u32 {
        self.lexeme.chars().count().max(1) as u32
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lexeme.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "'{}'", self.lexeme)
        }
    }
}

fn keyword(ident: &str) -> Option<TokenKind> {
    Some(match ident {
        "fn" => TokenKind::Fn,
        "let" => TokenKind::Let,
        "mut" => TokenKind::Mut,
        "static" => TokenKind::Static,
        "const" => TokenKind::Const,
        "if" => TokenKind::If,
        "elif" => TokenKind::Elif,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "return" => TokenKind::Return,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "nil" => TokenKind::Nil,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "struct" => TokenKind::Struct,
        "enum" => TokenKind::Enum,
        "impl" => TokenKind::Impl,
        "try" => TokenKind::Try,
        "catch" => TokenKind::Catch,
        "use" => TokenKind::Use,
        "as" => TokenKind::As,
        "pub" => TokenKind::Pub,
        "print" => TokenKind::Print,
        "print_no_newline" => TokenKind::PrintNoNewline,
        _ => return None,
    })
}

/// Scan a full source string into tokens. The stream always ends with a
/// single `Eof` token; scan errors appear inline as `Error` tokens so the
/// parser can report them with positions.
pub fn scan(source: &str) -> Vec<Token> {
    Scanner::new(source).run()
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
    /// Depth inside `(`/`[` pairs; newlines are suppressed when positive.
    bracket_depth: u32,
    tokens: Vec<Token>,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Scanner {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            bracket_depth: 0,
            tokens: Vec::new(),
        }
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn push(&mut self, kind: TokenKind, lexeme: impl Into<String>, line: u32, column: u32) {
        self.tokens.push(Token {
            kind,
            lexeme: lexeme.into(),
            line,
            column,
        });
    }

    fn run(mut self) -> Vec<Token> {
        while let Some(c) = self.peek() {
            let (line, column) = (self.line, self.column);
            match c {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    if self.bracket_depth == 0
                        && !matches!(
                            self.tokens.last().map(|t| &t.kind),
                            Some(TokenKind::Newline) | None
                        )
                    {
                        self.push(TokenKind::Newline, "", line, column);
                    }
                }
                '/' if self.lookahead_is_comment() => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                '"' => self.string(line, column),
                c if c.is_ascii_digit() => self.number(line, column),
                c if c.is_alphabetic() || c == '_' => self.identifier(line, column),
                _ => self.operator(line, column),
            }
        }
        // A trailing newline terminates the last statement even when the
        // file does not end with one.
        if !matches!(
            self.tokens.last().map(|t| &t.kind),
            Some(TokenKind::Newline) | None
        ) {
            self.push(TokenKind::Newline, "", self.line, self.column);
        }
        self.push(TokenKind::Eof, "", self.line, self.column);
        self.tokens
    }

    fn lookahead_is_comment(&self) -> bool {
        let mut clone = self.chars.clone();
        clone.next() == Some('/') && clone.next() == Some('/')
    }

    fn operator(&mut self, line: u32, column: u32) {
        let c = match self.advance() {
            Some(c) => c,
            None => return,
        };
        let kind = match c {
            '(' => {
                self.bracket_depth += 1;
                TokenKind::LeftParen
            }
            ')' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RightParen
            }
            '[' => {
                self.bracket_depth += 1;
                TokenKind::LeftBracket
            }
            ']' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RightBracket
            }
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '~' => TokenKind::Tilde,
            '^' => TokenKind::Caret,
            '&' => TokenKind::Amp,
            '|' => TokenKind::Pipe,
            '+' => TokenKind::Plus,
            '%' => TokenKind::Percent,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '.' => {
                if self.matches('.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }
            '-' => {
                if self.matches('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '=' => {
                if self.matches('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                }
            }
            '!' => {
                if self.matches('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Error("unexpected character '!'".to_string())
                }
            }
            '<' => {
                if self.matches('=') {
                    TokenKind::LessEqual
                } else if self.matches('<') {
                    TokenKind::Shl
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if self.matches('=') {
                    TokenKind::GreaterEqual
                } else if self.matches('>') {
                    TokenKind::Shr
                } else {
                    TokenKind::Greater
                }
            }
            other => TokenKind::Error(format!("unexpected character '{}'", other)),
        };
        let lexeme = lexeme_for(&kind, c);
        self.push(kind, lexeme, line, column);
    }

    fn string(&mut self, line: u32, column: u32) {
        self.advance(); // opening quote
        let mut value = String::new();
        let mut raw = String::from("\"");
        loop {
            match self.advance() {
                None | Some('\n') => {
                    self.push(
                        TokenKind::Error("unterminated string literal".to_string()),
                        raw,
                        line,
                        column,
                    );
                    return;
                }
                Some('"') => break,
                Some('\\') => {
                    raw.push('\\');
                    match self.advance() {
                        Some('n') => {
                            value.push('\n');
                            raw.push('n');
                        }
                        Some('t') => {
                            value.push('\t');
                            raw.push('t');
                        }
                        Some('\\') => {
                            value.push('\\');
                            raw.push('\\');
                        }
                        Some('"') => {
                            value.push('"');
                            raw.push('"');
                        }
                        Some('0') => {
                            value.push('\0');
                            raw.push('0');
                        }
                        other => {
                            self.push(
                                TokenKind::Error(format!(
                                    "unknown escape sequence '\\{}'",
                                    other.map(String::from).unwrap_or_default()
                                )),
                                raw,
                                line,
                                column,
                            );
                            return;
                        }
                    }
                }
                Some(c) => {
                    value.push(c);
                    raw.push(c);
                }
            }
        }
        raw.push('"');
        self.push(TokenKind::Str(value), raw, line, column);
    }

    fn number(&mut self, line: u32, column: u32) {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        // Fractional part: a digit must follow the dot, otherwise the dot is
        // a range or field-access token.
        let mut is_float = false;
        if self.peek() == Some('.') {
            let mut clone = self.chars.clone();
            clone.next();
            if clone.peek_digit() {
                is_float = true;
                text.push('.');
                self.advance();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() || c == '_' {
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }
        let digits: String = text.chars().filter(|c| *c != '_').collect();
        if is_float {
            match digits.parse::<f64>() {
                Ok(value) => self.push(TokenKind::Float(value), text, line, column),
                Err(_) => self.push(
                    TokenKind::Error(format!("invalid float literal '{}'", text)),
                    text,
                    line,
                    column,
                ),
            }
            return;
        }
        // Optional integer suffix.
        let mut suffix = IntSuffix::None;
        for (name, kind) in [
            ("i64", IntSuffix::I64),
            ("u32", IntSuffix::U32),
            ("u64", IntSuffix::U64),
        ] {
            if self.lookahead_word(name) {
                for _ in 0..name.len() {
                    self.advance();
                }
                text.push_str(name);
                suffix = kind;
                break;
            }
        }
        match digits.parse::<u64>() {
            Ok(value) => self.push(TokenKind::Int(value, suffix), text, line, column),
            Err(_) => self.push(
                TokenKind::Error(format!("integer literal '{}' is out of range", text)),
                text,
                line,
                column,
            ),
        }
    }

    fn lookahead_word(&mut self, word: &str) -> bool {
        let mut clone = self.chars.clone();
        for expected in word.chars() {
            if clone.next() != Some(expected) {
                return false;
            }
        }
        // The suffix must not continue into a longer identifier.
        !clone
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || *c == '_')
    }

    fn identifier(&mut self, line: u32, column: u32) {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = keyword(&text).unwrap_or(TokenKind::Identifier);
        self.push(kind, text, line, column);
    }
}

trait PeekDigit {
    fn peek_digit(&mut self) -> bool;
}

impl PeekDigit for std::iter::Peekable<std::str::Chars<'_>> {
    fn peek_digit(&mut self) -> bool {
        self.peek().is_some_and(|c| c.is_ascii_digit())
    }
}

fn lexeme_for(kind: &TokenKind, first: char) -> String {
    match kind {
        TokenKind::DotDot => "..".to_string(),
        TokenKind::Arrow => "->".to_string(),
        TokenKind::EqualEqual => "==".to_string(),
        TokenKind::BangEqual => "!=".to_string(),
        TokenKind::LessEqual => "<=".to_string(),
        TokenKind::GreaterEqual => ">=".to_string(),
        TokenKind::Shl => "<<".to_string(),
        TokenKind::Shr => ">>".to_string(),
        _ => first.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        scan(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_scan_simple_statement() {
        let tokens = scan("let x: i32 = 14");
        let expected = [
            TokenKind::Let,
            TokenKind::Identifier,
            TokenKind::Colon,
            TokenKind::Identifier,
            TokenKind::Equal,
            TokenKind::Int(14, IntSuffix::None),
            TokenKind::Newline,
            TokenKind::Eof,
        ];
        assert_eq!(
            tokens.iter().map(|t| t.kind.clone()).collect::<Vec<_>>(),
            expected
        );
        assert_eq!(tokens[1].lexeme, "x");
        assert_eq!(tokens[1].line, 1);
        assert_eq!(tokens[1].column, 5);
    }

    #[test]
    fn test_int_suffixes() {
        assert_eq!(kinds("5i64")[0], TokenKind::Int(5, IntSuffix::I64));
        assert_eq!(kinds("5u32")[0], TokenKind::Int(5, IntSuffix::U32));
        assert_eq!(kinds("5u64")[0], TokenKind::Int(5, IntSuffix::U64));
        // `5u32x` is not a suffix, it is `5` then identifier `u32x`.
        let t = kinds("5u32x");
        assert_eq!(t[0], TokenKind::Int(5, IntSuffix::None));
        assert_eq!(t[1], TokenKind::Identifier);
    }

    #[test]
    fn test_float_vs_range() {
        assert_eq!(kinds("1.5")[0], TokenKind::Float(1.5));
        let t = kinds("0..3");
        assert_eq!(t[0], TokenKind::Int(0, IntSuffix::None));
        assert_eq!(t[1], TokenKind::DotDot);
        assert_eq!(t[2], TokenKind::Int(3, IntSuffix::None));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds("\"a\\n\\\"b\\\"\"")[0],
            TokenKind::Str("a\n\"b\"".to_string())
        );
        assert!(matches!(kinds("\"open")[0], TokenKind::Error(_)));
    }

    #[test]
    fn test_newlines_suppressed_in_brackets() {
        let t = kinds("f(1,\n2)\n[1,\n2]");
        assert!(!t[..t.len() - 2]
            .iter()
            .take_while(|k| **k != TokenKind::Newline)
            .any(|k| *k == TokenKind::Newline));
        // Exactly two newline tokens: after the call and after the array.
        let newline_count = t.iter().filter(|k| **k == TokenKind::Newline).count();
        assert_eq!(newline_count, 2);
    }

    #[test]
    fn test_comments_ignored() {
        let t = kinds("1 // comment\n2");
        assert_eq!(t[0], TokenKind::Int(1, IntSuffix::None));
        assert_eq!(t[1], TokenKind::Newline);
        assert_eq!(t[2], TokenKind::Int(2, IntSuffix::None));
    }

    #[test]
    fn test_operators() {
        let t = kinds("-> .. == != <= >= << >> & | ^ ~");
        assert_eq!(t[0], TokenKind::Arrow);
        assert_eq!(t[1], TokenKind::DotDot);
        assert_eq!(t[2], TokenKind::EqualEqual);
        assert_eq!(t[3], TokenKind::BangEqual);
        assert_eq!(t[4], TokenKind::LessEqual);
        assert_eq!(t[5], TokenKind::GreaterEqual);
        assert_eq!(t[6], TokenKind::Shl);
        assert_eq!(t[7], TokenKind::Shr);
    }

    #[test]
    fn test_keywords() {
        let t = kinds("fn let mut const if elif else not print try catch use as pub");
        assert_eq!(t[0], TokenKind::Fn);
        assert_eq!(t[3], TokenKind::Const);
        assert_eq!(t[7], TokenKind::Not);
        assert_eq!(t[8], TokenKind::Print);
        assert_eq!(t[13], TokenKind::Pub);
    }
}
