//! Comment-free lexeme stream for classification.
//!
//! Uses the sqlparser tokenizer so comment markers and keywords inside
//! string literals are never mistaken for structure. Text the tokenizer
//! rejects (an unterminated literal, say) goes through a small fallback
//! scanner that only knows about comments, quotes, and parentheses.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use tracing::debug;

/// A significant piece of SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lexeme {
    /// Bare or quoted word. `upper` is empty for quoted identifiers so they
    /// never match a keyword.
    Word { raw: String, upper: String },
    /// Single-quoted string contents.
    Literal(String),
    Open,
    Close,
    Separator,
    Other(String),
}

impl Lexeme {
    /// The upper-cased keyword, if this is a bare word.
    pub(crate) fn keyword(&self) -> Option<&str> {
        match self {
            Self::Word { upper, .. } if !upper.is_empty() => Some(upper.as_str()),
            _ => None,
        }
    }

    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        self.keyword() == Some(keyword)
    }

    /// The identifier or literal text, as written.
    pub(crate) fn name(&self) -> Option<&str> {
        match self {
            Self::Word { raw, .. } | Self::Literal(raw) => Some(raw.as_str()),
            _ => None,
        }
    }
}

/// Lexemes of a statement plus what was trailing it.
#[derive(Debug, Default)]
pub(crate) struct Lexed {
    pub lexemes: Vec<Lexeme>,
    /// The last non-blank thing in the text is a `--` comment.
    pub ends_in_line_comment: bool,
}

pub(crate) fn lex(sql: &str) -> Lexed {
    match Tokenizer::new(&GenericDialect {}, sql).tokenize() {
        Ok(tokens) => from_tokens(tokens),
        Err(e) => {
            debug!("Tokenizer rejected statement, using fallback scanner: {e}");
            scan(sql)
        }
    }
}

fn from_tokens(tokens: Vec<Token>) -> Lexed {
    let mut lexed = Lexed::default();
    for token in tokens {
        let lexeme = match token {
            Token::Whitespace(Whitespace::SingleLineComment { .. }) => {
                lexed.ends_in_line_comment = true;
                continue;
            }
            Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                lexed.ends_in_line_comment = false;
                continue;
            }
            Token::Whitespace(_) => continue,
            Token::Word(word) => {
                let upper = match word.quote_style {
                    None => word.value.to_uppercase(),
                    Some(_) => String::new(),
                };
                Lexeme::Word {
                    raw: word.value,
                    upper,
                }
            }
            Token::SingleQuotedString(s) => Lexeme::Literal(s),
            Token::LParen => Lexeme::Open,
            Token::RParen => Lexeme::Close,
            Token::SemiColon => Lexeme::Separator,
            other => Lexeme::Other(other.to_string()),
        };
        lexed.ends_in_line_comment = false;
        lexed.lexemes.push(lexeme);
    }
    lexed
}

/// Fallback scanner for text the tokenizer refuses.
fn scan(sql: &str) -> Lexed {
    let mut lexed = Lexed::default();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            lexed.ends_in_line_comment = i >= chars.len();
            continue;
        }
        if c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
            lexed.ends_in_line_comment = false;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        lexed.ends_in_line_comment = false;
        let lexeme = match c {
            '\'' | '"' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && chars[i] != c {
                    i += 1;
                }
                let text: String = chars[start..i.min(chars.len())].iter().collect();
                i += 1;
                if c == '\'' {
                    Lexeme::Literal(text)
                } else {
                    Lexeme::Word {
                        raw: text,
                        upper: String::new(),
                    }
                }
            }
            '(' => {
                i += 1;
                Lexeme::Open
            }
            ')' => {
                i += 1;
                Lexeme::Close
            }
            ';' => {
                i += 1;
                Lexeme::Separator
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                Lexeme::Word {
                    upper: raw.to_uppercase(),
                    raw,
                }
            }
            other => {
                i += 1;
                Lexeme::Other(other.to_string())
            }
        };
        lexed.lexemes.push(lexeme);
    }

    lexed
}
