use logos::Logos;

use crate::{
    error::ParseError,
    token::{Position, Token, TokenKind},
};

// The raw lexer. Kept separate from `TokenKind` because the stream also
// carries a synthetic `Eof` token that no pattern produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Logos)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
enum RawToken {
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    #[regex(r"0[bB][01]+")]
    IntBin,
    #[regex(r"0[tT][0-2]+")]
    IntTer,
    #[regex(r"0[oO][0-7]+")]
    IntOct,
    #[regex(r"0[xX][0-9a-fA-F]+")]
    IntHex,
    #[regex(r"[0-9]+")]
    IntDec,
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?")]
    Float,

    #[regex(r#""(\\.|[^"\\])*""#)]
    Str,

    #[token("let")]
    Let,
    #[token("return")]
    Return,
    #[token("fn")]
    Fn,
    #[token("macro")]
    Macro,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,

    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("!")]
    Bang,
    #[token("*")]
    Asterisk,
    #[token("/")]
    Slash,
    #[token("==")]
    Eq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("|")]
    Pipe,
    #[token(".")]
    Dot,

    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
}

impl From<RawToken> for TokenKind {
    fn from(raw: RawToken) -> Self {
        match raw {
            RawToken::Ident => TokenKind::Ident,
            RawToken::IntBin => TokenKind::IntBin,
            RawToken::IntTer => TokenKind::IntTer,
            RawToken::IntOct => TokenKind::IntOct,
            RawToken::IntHex => TokenKind::IntHex,
            RawToken::IntDec => TokenKind::IntDec,
            RawToken::Float => TokenKind::Float,
            RawToken::Str => TokenKind::Str,
            RawToken::Let => TokenKind::Let,
            RawToken::Return => TokenKind::Return,
            RawToken::Fn => TokenKind::Fn,
            RawToken::Macro => TokenKind::Macro,
            RawToken::True => TokenKind::True,
            RawToken::False => TokenKind::False,
            RawToken::Null => TokenKind::Null,
            RawToken::If => TokenKind::If,
            RawToken::Elif => TokenKind::Elif,
            RawToken::Else => TokenKind::Else,
            RawToken::Assign => TokenKind::Assign,
            RawToken::Plus => TokenKind::Plus,
            RawToken::Minus => TokenKind::Minus,
            RawToken::Bang => TokenKind::Bang,
            RawToken::Asterisk => TokenKind::Asterisk,
            RawToken::Slash => TokenKind::Slash,
            RawToken::Eq => TokenKind::Eq,
            RawToken::NotEq => TokenKind::NotEq,
            RawToken::Lt => TokenKind::Lt,
            RawToken::Gt => TokenKind::Gt,
            RawToken::Pipe => TokenKind::Pipe,
            RawToken::Dot => TokenKind::Dot,
            RawToken::Comma => TokenKind::Comma,
            RawToken::Semicolon => TokenKind::Semicolon,
            RawToken::Colon => TokenKind::Colon,
            RawToken::LParen => TokenKind::LParen,
            RawToken::RParen => TokenKind::RParen,
            RawToken::LBrace => TokenKind::LBrace,
            RawToken::RBrace => TokenKind::RBrace,
            RawToken::LBracket => TokenKind::LBracket,
            RawToken::RBracket => TokenKind::RBracket,
        }
    }
}

// Maps byte offsets to line/column pairs. Built once per input so every
// token gets a position without rescanning the source.
struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    fn new(input: &str) -> Self {
        let mut line_starts = vec![0];
        for (offset, byte) in input.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(offset + 1);
            }
        }
        Self { line_starts }
    }

    fn position(&self, offset: usize) -> Position {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(line) => line - 1,
        };
        Position::new(line + 1, offset - self.line_starts[line] + 1)
    }
}

fn unescape(raw: &str, pos: Position) -> Result<String, ParseError> {
    // The raw slice still carries the surrounding quotes.
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            other => {
                let mut bad = String::from("\\");
                bad.extend(other);
                return Err(ParseError::BadLiteral(pos, bad));
            }
        }
    }

    Ok(out)
}

/// Turns source text into a token stream terminated by an `Eof` token.
pub fn lex(input: &str) -> Result<Vec<Token>, ParseError> {
    let index = LineIndex::new(input);
    let mut tokens = Vec::new();
    let mut lexer = RawToken::lexer(input);

    while let Some(result) = lexer.next() {
        let pos = index.position(lexer.span().start);
        match result {
            Ok(RawToken::Str) => {
                let literal = unescape(lexer.slice(), pos)?;
                tokens.push(Token::new(TokenKind::Str, literal, pos));
            }
            Ok(raw) => tokens.push(Token::new(raw.into(), lexer.slice(), pos)),
            Err(_) => {
                return Err(ParseError::UnexpectedChar(pos, lexer.slice().to_string()));
            }
        }
    }

    let end = index.position(input.len());
    tokens.push(Token::new(TokenKind::Eof, "", end));
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        lex(input)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect_vec()
    }

    #[test]
    fn lex_statement() {
        assert_eq!(
            kinds("let x = 1 + 2;"),
            vec![
                TokenKind::Let,
                TokenKind::Ident,
                TokenKind::Assign,
                TokenKind::IntDec,
                TokenKind::Plus,
                TokenKind::IntDec,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_radix_literals() {
        assert_eq!(
            kinds("0b101 0t21 0o17 0x1f 42 1.5"),
            vec![
                TokenKind::IntBin,
                TokenKind::IntTer,
                TokenKind::IntOct,
                TokenKind::IntHex,
                TokenKind::IntDec,
                TokenKind::Float,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_skips_comments() {
        let tokens = lex("1 // line\n/* block\n * more */ 2").unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].literal, "1");
        assert_eq!(tokens[1].literal, "2");
        assert_eq!(tokens[1].pos, Position::new(3, 12));
    }

    #[test]
    fn lex_string_escapes() {
        let tokens = lex(r#""a\n\"b\"""#).unwrap();
        assert_eq!(tokens[0].literal, "a\n\"b\"");
    }

    #[test]
    fn lex_rejects_bad_escape() {
        assert!(matches!(
            lex(r#""\q""#),
            Err(ParseError::BadLiteral(_, _))
        ));
    }

    #[test]
    fn lex_tracks_positions() {
        let tokens = lex("let x = 5\nx").unwrap();
        assert_eq!(tokens[0].pos, Position::new(1, 1));
        assert_eq!(tokens[3].pos, Position::new(1, 9));
        assert_eq!(tokens[4].pos, Position::new(2, 1));
    }

    #[test]
    fn lex_rejects_unknown_character() {
        assert!(matches!(lex("let $x = 1"), Err(ParseError::UnexpectedChar(pos, _)) if pos == Position::new(1, 5)));
    }

    #[test]
    fn lex_operators() {
        assert_eq!(
            kinds("== != < > | . !"),
            vec![
                TokenKind::Eq,
                TokenKind::NotEq,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Pipe,
                TokenKind::Dot,
                TokenKind::Bang,
                TokenKind::Eof,
            ]
        );
    }
}
