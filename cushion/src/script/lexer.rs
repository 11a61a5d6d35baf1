//! Lexer for the map-function dialect.
//!
//! Turns source text into `(Token, Span)` pairs for the parser. Spans are
//! char offsets into the source.

use chumsky::error::SimpleReason;
use chumsky::prelude::*;
use std::fmt;
use std::ops::Range;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    // Keywords
    Function,
    Var,
    Let,
    Const,
    If,
    Else,
    For,
    While,
    Return,
    Break,
    Continue,
    Throw,
    In,
    Typeof,
    True,
    False,
    Null,

    Ident(String),
    /// Literal text as written; see [`number_value`]
    Number(String),
    Str(String),

    // Punctuation
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Colon,
    Dot,
    Question,

    // Operators
    Assign,
    PlusAssign,
    MinusAssign,
    PlusPlus,
    MinusMinus,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    EqEqEq,
    NotEqEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

impl Token {
    /// Keyword spelling, used where keywords are valid property names (`doc.in`).
    pub fn keyword(&self) -> Option<&'static str> {
        Some(match self {
            Token::Function => "function",
            Token::Var => "var",
            Token::Let => "let",
            Token::Const => "const",
            Token::If => "if",
            Token::Else => "else",
            Token::For => "for",
            Token::While => "while",
            Token::Return => "return",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Throw => "throw",
            Token::In => "in",
            Token::Typeof => "typeof",
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            _ => return None,
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kw) = self.keyword() {
            return write!(f, "{kw}");
        }
        match self {
            Token::Ident(s) | Token::Number(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Semicolon => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::Dot => write!(f, "."),
            Token::Question => write!(f, "?"),
            Token::Assign => write!(f, "="),
            Token::PlusAssign => write!(f, "+="),
            Token::MinusAssign => write!(f, "-="),
            Token::PlusPlus => write!(f, "++"),
            Token::MinusMinus => write!(f, "--"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Bang => write!(f, "!"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::EqEqEq => write!(f, "==="),
            Token::NotEqEq => write!(f, "!=="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            _ => Ok(()),
        }
    }
}

pub type Span = Range<usize>;

/// Line/column of a token, 1-based
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pos {
    pub line: usize,
    pub col: usize,
}

impl Pos {
    /// Position of the char at `offset` in `source`
    pub fn at(source: &str, offset: usize) -> Self {
        let mut pos = Pos { line: 1, col: 1 };
        for c in source.chars().take(offset) {
            if c == '\n' {
                pos.line += 1;
                pos.col = 1;
            } else {
                pos.col += 1;
            }
        }
        pos
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A lexing or parsing failure
#[derive(Clone, Debug, PartialEq)]
pub struct SyntaxError {
    pub message: String,
    pub pos: Pos,
}

impl SyntaxError {
    pub fn new(source: &str, offset: usize, message: impl Into<String>) -> Self {
        SyntaxError {
            message: message.into(),
            pos: Pos::at(source, offset),
        }
    }

    /// Convert a chumsky error, rendering tokens with `Display`
    pub(crate) fn from_simple<T: fmt::Display + std::hash::Hash + Eq>(
        source: &str,
        err: &Simple<T>,
    ) -> Self {
        let found = match err.found() {
            Some(tok) => format!("'{tok}'"),
            None => "end of source".to_string(),
        };
        let message = match err.reason() {
            SimpleReason::Custom(message) => message.clone(),
            SimpleReason::Unclosed { delimiter, .. } => {
                format!("unclosed '{delimiter}', found {found}")
            }
            SimpleReason::Unexpected => {
                let mut expected: Vec<String> = err
                    .expected()
                    .map(|tok| match tok {
                        Some(tok) => format!("'{tok}'"),
                        None => "end of source".to_string(),
                    })
                    .collect();
                expected.sort();
                expected.dedup();
                match (err.label(), expected.is_empty()) {
                    (Some(label), _) => format!("expected {label}, found {found}"),
                    (None, true) => format!("unexpected {found}"),
                    (None, false) => format!("expected {}, found {found}", expected.join(" or ")),
                }
            }
        };
        Self::new(source, err.span().start, message)
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message, self.pos)
    }
}

impl std::error::Error for SyntaxError {}

/// Numeric value of a `Token::Number` literal
pub fn number_value(text: &str) -> Option<f64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok().map(|n| n as f64),
        None => text.parse().ok(),
    }
}

fn is_ident_start(c: &char) -> bool {
    c.is_alphabetic() || *c == '_' || *c == '$'
}

fn is_ident_continue(c: &char) -> bool {
    c.is_alphanumeric() || *c == '_' || *c == '$'
}

fn number() -> impl Parser<char, Token, Error = Simple<char>> + Clone {
    let hex = just("0x")
        .or(just("0X"))
        .ignore_then(filter(char::is_ascii_hexdigit).repeated().at_least(1))
        .collect::<String>()
        .map(|digits| format!("0x{digits}"));

    let fraction = just('.')
        .ignore_then(text::digits(10).or_not())
        .map(|digits: Option<String>| format!(".{}", digits.unwrap_or_default()));
    let leading = text::digits(10)
        .then(fraction.or_not())
        .map(|(int, frac): (String, Option<String>)| int + &frac.unwrap_or_default());
    // `.5`
    let bare_fraction = just('.')
        .ignore_then(text::digits(10))
        .map(|digits: String| format!(".{digits}"));

    let exponent = one_of("eE")
        .ignore_then(one_of("+-").or_not())
        .then(text::digits(10))
        .map(|(sign, digits): (Option<char>, String)| match sign {
            Some(sign) => format!("e{sign}{digits}"),
            None => format!("e{digits}"),
        });

    let decimal = leading
        .or(bare_fraction)
        .then(exponent.or_not())
        .map(|(mantissa, exp)| mantissa + &exp.unwrap_or_default());

    hex.or(decimal).try_map(|text, span| match number_value(&text) {
        Some(_) => Ok(Token::Number(text)),
        None => Err(Simple::custom(span, format!("invalid number '{text}'"))),
    })
}

fn string() -> impl Parser<char, Token, Error = Simple<char>> + Clone {
    let unicode = just('u').ignore_then(
        filter(char::is_ascii_hexdigit)
            .repeated()
            .exactly(4)
            .collect::<String>()
            .map(|hex| {
                u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or('\u{fffd}')
            }),
    );

    let escape = just('\\').ignore_then(choice((
        just('n').to('\n'),
        just('t').to('\t'),
        just('r').to('\r'),
        just('b').to('\u{8}'),
        just('f').to('\u{c}'),
        just('0').to('\0'),
        unicode,
        filter(|c: &char| *c != '\n'),
    )));

    let quoted = |quote: char| {
        just(quote)
            .ignore_then(
                filter(move |c: &char| *c != quote && *c != '\\' && *c != '\n')
                    .or(escape.clone())
                    .repeated(),
            )
            .then_ignore(just(quote))
            .collect::<String>()
    };

    quoted('"').or(quoted('\'')).map(Token::Str)
}

fn word() -> impl Parser<char, Token, Error = Simple<char>> + Clone {
    filter(is_ident_start)
        .then(filter(is_ident_continue).repeated())
        .map(|(first, rest)| {
            let text: String = std::iter::once(first).chain(rest).collect();
            match text.as_str() {
                "function" => Token::Function,
                "var" => Token::Var,
                "let" => Token::Let,
                "const" => Token::Const,
                "if" => Token::If,
                "else" => Token::Else,
                "for" => Token::For,
                "while" => Token::While,
                "return" => Token::Return,
                "break" => Token::Break,
                "continue" => Token::Continue,
                "throw" => Token::Throw,
                "in" => Token::In,
                "typeof" => Token::Typeof,
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                _ => Token::Ident(text),
            }
        })
}

fn punctuation() -> impl Parser<char, Token, Error = Simple<char>> + Clone {
    // Longest match first
    let operator = choice((
        just("===").to(Token::EqEqEq),
        just("!==").to(Token::NotEqEq),
        just("==").to(Token::EqEq),
        just("!=").to(Token::NotEq),
        just("<=").to(Token::Le),
        just(">=").to(Token::Ge),
        just("&&").to(Token::AndAnd),
        just("||").to(Token::OrOr),
        just("++").to(Token::PlusPlus),
        just("--").to(Token::MinusMinus),
        just("+=").to(Token::PlusAssign),
        just("-=").to(Token::MinusAssign),
    ));

    let single = select! {
        '{' => Token::LBrace,
        '}' => Token::RBrace,
        '(' => Token::LParen,
        ')' => Token::RParen,
        '[' => Token::LBracket,
        ']' => Token::RBracket,
        ',' => Token::Comma,
        ';' => Token::Semicolon,
        ':' => Token::Colon,
        '.' => Token::Dot,
        '?' => Token::Question,
        '=' => Token::Assign,
        '+' => Token::Plus,
        '-' => Token::Minus,
        '*' => Token::Star,
        '/' => Token::Slash,
        '%' => Token::Percent,
        '!' => Token::Bang,
        '<' => Token::Lt,
        '>' => Token::Gt,
    };

    operator.or(single)
}

/// Create a lexer for map-function source
pub fn lexer() -> impl Parser<char, Vec<(Token, Span)>, Error = Simple<char>> {
    // Must come before punctuation so `//` is not read as two slashes
    let line_comment = just("//").then(none_of('\n').repeated()).ignored();
    let block_comment = just("/*").then(take_until(just("*/"))).ignored();
    let comment = line_comment.or(block_comment);

    let token = choice((number(), string(), word(), punctuation()));

    comment
        .to(None)
        .or(token.map_with_span(|tok, span| Some((tok, span))))
        .padded()
        .repeated()
        .then_ignore(end())
        .try_map(|items, _| {
            let tokens: Vec<(Token, Span)> = items.into_iter().flatten().collect();
            // A closed `/*` is always taken as a comment first
            for pair in tokens.windows(2) {
                if let [(Token::Slash, a), (Token::Star, b)] = pair {
                    if a.end == b.start {
                        return Err(Simple::custom(a.start..b.end, "unclosed block comment"));
                    }
                }
            }
            Ok(tokens)
        })
}

pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>, SyntaxError> {
    lexer().parse(source).map_err(|errs| match errs.first() {
        Some(err) => SyntaxError::from_simple(source, err),
        None => SyntaxError::new(source, 0, "invalid source"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    fn num(text: &str) -> Token {
        Token::Number(text.to_string())
    }

    #[test]
    fn test_function_header() {
        assert_eq!(
            kinds("function(doc, meta) {}"),
            vec![
                Token::Function,
                Token::LParen,
                Token::Ident("doc".into()),
                Token::Comma,
                Token::Ident("meta".into()),
                Token::RParen,
                Token::LBrace,
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn test_operators_longest_match() {
        assert_eq!(
            kinds("a === b !== c == d != e <= f"),
            vec![
                Token::Ident("a".into()),
                Token::EqEqEq,
                Token::Ident("b".into()),
                Token::NotEqEq,
                Token::Ident("c".into()),
                Token::EqEq,
                Token::Ident("d".into()),
                Token::NotEq,
                Token::Ident("e".into()),
                Token::Le,
                Token::Ident("f".into()),
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"37 2.5 .5 1e3 0x1F "a\"b" 'c\n' 'A'"#),
            vec![
                num("37"),
                num("2.5"),
                num(".5"),
                num("1e3"),
                num("0x1F"),
                Token::Str("a\"b".into()),
                Token::Str("c\n".into()),
                Token::Str("A".into()),
            ]
        );
    }

    #[test]
    fn test_number_values() {
        assert_eq!(number_value("37"), Some(37.0));
        assert_eq!(number_value(".5"), Some(0.5));
        assert_eq!(number_value("1e-3"), Some(0.001));
        assert_eq!(number_value("0x1F"), Some(31.0));
        assert_eq!(number_value("0x"), None);
    }

    #[test]
    fn test_member_access_is_not_a_number() {
        assert_eq!(
            kinds("doc.tags[0].length"),
            vec![
                Token::Ident("doc".into()),
                Token::Dot,
                Token::Ident("tags".into()),
                Token::LBracket,
                num("0"),
                Token::RBracket,
                Token::Dot,
                Token::Ident("length".into()),
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("a // line\n/* block\n comment */ b"),
            vec![Token::Ident("a".into()), Token::Ident("b".into())]
        );
    }

    #[test]
    fn test_positions() {
        let src = "a\n  b";
        let tokens = tokenize(src).unwrap();
        assert_eq!(tokens[1].1, 4..5);
        assert_eq!(Pos::at(src, tokens[1].1.start), Pos { line: 2, col: 3 });
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("'open").is_err());
        assert!(tokenize("/* open").is_err());
        let err = tokenize("a # b").unwrap_err();
        assert_eq!(err.pos, Pos { line: 1, col: 3 });
    }
}
