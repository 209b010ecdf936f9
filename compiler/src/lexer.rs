// Lexer for kernel description sources.
//
// Tokenizes the line-oriented kernel format: directives (`kernel`, `set`,
// `domain`, `arg`, `temp`, `tag`, `insn`), affine constraint chains and
// instruction expressions. Uses the `logos` crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

use crate::kernel::IndexTag;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Kernel source token types.
///
/// Keywords and symbols are matched as fixed strings. Literals carry parsed
/// values. Identifiers carry no value; use the span to retrieve the text.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+|#[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("kernel")]
    Kernel,
    #[token("set")]
    Set,
    #[token("domain")]
    Domain,
    #[token("arg")]
    Arg,
    #[token("temp")]
    Temp,
    #[token("tag")]
    Tag,
    #[token("insn")]
    Insn,
    #[token("and")]
    And,
    #[token("global")]
    Global,
    #[token("image")]
    Image,
    #[token("scalar")]
    Scalar,
    #[token("deps")]
    Deps,
    #[token("inames")]
    Inames,

    // ── Symbols ──
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Equals,
    #[token("==")]
    EqEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    StarStar,
    #[token("/")]
    Slash,
    #[token("//")]
    SlashSlash,
    #[token("%")]
    Percent,
    #[token("$")]
    Dollar,
    #[token("@")]
    At,
    #[token("~")]
    Tilde,

    // ── Literals ──
    //
    // Size must win over a bare integer followed by an identifier.
    /// Size literal (e.g. `48KB`). Value stored in bytes (binary: 1 KB = 1024).
    #[regex(r"[0-9]+(KB|MB|GB)", parse_size)]
    Size(u64),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?|[0-9]+[eE][+-]?[0-9]+", parse_float)]
    Float(f64),

    #[regex(r"[0-9]+", parse_int)]
    Int(i64),

    /// Parallel axis tag: `l.N`, `g.N` or `l.auto`.
    #[regex(r"(l|g)\.([0-9]+|auto)", parse_axis_tag)]
    AxisTag(IndexTag),

    // ── Identifier ──
    //
    // Placed after keywords: logos prioritises fixed `#[token]` matches
    // over regex for the same length, so `set` matches Set, not Ident.
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // ── Structure ──
    /// One or more newlines (statement terminator).
    #[regex(r"\n+")]
    Newline,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Kernel => write!(f, "kernel"),
            Token::Set => write!(f, "set"),
            Token::Domain => write!(f, "domain"),
            Token::Arg => write!(f, "arg"),
            Token::Temp => write!(f, "temp"),
            Token::Tag => write!(f, "tag"),
            Token::Insn => write!(f, "insn"),
            Token::And => write!(f, "and"),
            Token::Global => write!(f, "global"),
            Token::Image => write!(f, "image"),
            Token::Scalar => write!(f, "scalar"),
            Token::Deps => write!(f, "deps"),
            Token::Inames => write!(f, "inames"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Equals => write!(f, "="),
            Token::EqEq => write!(f, "=="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::StarStar => write!(f, "**"),
            Token::Slash => write!(f, "/"),
            Token::SlashSlash => write!(f, "//"),
            Token::Percent => write!(f, "%"),
            Token::Dollar => write!(f, "$"),
            Token::At => write!(f, "@"),
            Token::Tilde => write!(f, "~"),
            Token::Size(v) => write!(f, "{v}B"),
            Token::Float(v) => write!(f, "{v}"),
            Token::Int(v) => write!(f, "{v}"),
            Token::AxisTag(t) => write!(f, "{t}"),
            Token::Ident => write!(f, "<ident>"),
            Token::Newline => write!(f, "<newline>"),
        }
    }
}

// ── Callbacks ──

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_size(lex: &mut logos::Lexer<'_, Token>) -> Option<u64> {
    let slice = lex.slice();
    let unit_start = slice.find(|c: char| c.is_alphabetic())?;
    let (num_str, unit) = slice.split_at(unit_start);
    let num: u64 = num_str.parse().ok()?;
    let multiplier: u64 = match unit {
        "KB" => 1_024,
        "MB" => 1_024 * 1_024,
        "GB" => 1_024 * 1_024 * 1_024,
        _ => return None,
    };
    num.checked_mul(multiplier)
}

fn parse_axis_tag(lex: &mut logos::Lexer<'_, Token>) -> Option<IndexTag> {
    IndexTag::parse(lex.slice())
}

// ── Public API ──

/// Lex a kernel source string into tokens.
///
/// Returns all successfully parsed tokens together with any errors for
/// unrecognised characters. Lexing is non-fatal: errors are collected and
/// the lexer continues past bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: lex and assert no errors, return token list.
    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn keywords() {
        let tokens = lex_ok("kernel set domain arg temp tag insn and global image scalar deps inames");
        assert_eq!(
            tokens,
            vec![
                Token::Kernel,
                Token::Set,
                Token::Domain,
                Token::Arg,
                Token::Temp,
                Token::Tag,
                Token::Insn,
                Token::And,
                Token::Global,
                Token::Image,
                Token::Scalar,
                Token::Deps,
                Token::Inames,
            ]
        );
    }

    #[test]
    fn keyword_vs_ident() {
        // `settings` and `tags` are identifiers
        let tokens = lex_ok("set settings tags");
        assert_eq!(tokens, vec![Token::Set, Token::Ident, Token::Ident]);
    }

    #[test]
    fn operators_take_longest_match() {
        let tokens = lex_ok("a ** b // c <= d >= e == f");
        assert_eq!(
            tokens,
            vec![
                Token::Ident,
                Token::StarStar,
                Token::Ident,
                Token::SlashSlash,
                Token::Ident,
                Token::Le,
                Token::Ident,
                Token::Ge,
                Token::Ident,
                Token::EqEq,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(lex_ok("42"), vec![Token::Int(42)]);
        assert_eq!(lex_ok("2.5"), vec![Token::Float(2.5)]);
        assert_eq!(lex_ok("1e3"), vec![Token::Float(1000.0)]);
        // Unary minus is a separate token.
        assert_eq!(lex_ok("-3"), vec![Token::Minus, Token::Int(3)]);
    }

    #[test]
    fn sizes() {
        assert_eq!(lex_ok("48KB"), vec![Token::Size(48 * 1024)]);
        assert_eq!(lex_ok("1MB"), vec![Token::Size(1024 * 1024)]);
    }

    #[test]
    fn axis_tags() {
        assert_eq!(
            lex_ok("l.0 g.1 l.auto"),
            vec![
                Token::AxisTag(IndexTag::LocalAxis(0)),
                Token::AxisTag(IndexTag::GroupAxis(1)),
                Token::AxisTag(IndexTag::AutoLocalAxis),
            ]
        );
    }

    #[test]
    fn comments_and_newlines() {
        let tokens = lex_ok("kernel k # name\n\n\ninsn");
        assert_eq!(
            tokens,
            vec![Token::Kernel, Token::Ident, Token::Newline, Token::Insn]
        );
    }

    #[test]
    fn spans_are_byte_offsets() {
        let result = lex("tag i = l.0");
        assert_eq!(result.tokens[3].1, Span { start: 8, end: 11 });
    }

    #[test]
    fn unknown_character_is_reported() {
        let result = lex("insn a: x = 1 ? 2");
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains('?'));
        // Lexing continues past the bad character.
        assert_eq!(result.tokens.last().map(|(t, _)| t.clone()), Some(Token::Int(2)));
    }
}
