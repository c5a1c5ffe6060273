//! AQL tokenizer.

use crate::error::{CoreError, CoreResult};

/// A lexical token with its byte position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Byte offset in the query text.
    pub pos: usize,
    /// Token payload.
    pub kind: TokenKind,
}

/// Token kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Reserved keyword (uppercased).
    Keyword(Keyword),
    /// Identifier (variable, collection, function name).
    Ident(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Str(String),
    /// Bind parameter `@name`.
    Param(String),
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<=`
    LtEq,
    /// `>=`
    GtEq,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `=`
    Assign,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `,`
    Comma,
    /// `:`
    Colon,
    /// `.`
    Dot,
    /// `..`
    DotDot,
    /// End of input.
    Eof,
}

/// Reserved words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Keyword {
    For,
    In,
    Filter,
    Let,
    Collect,
    Aggregate,
    Sort,
    Limit,
    Return,
    With,
    As,
    Any,
    All,
    Satisfies,
    Similarity,
    Proximity,
    ShortestPath,
    Fulltext,
    Outbound,
    Inbound,
    Graph,
    And,
    Or,
    Not,
    Asc,
    Desc,
    True,
    False,
    Null,
    To,
}

fn keyword_of(word: &str) -> Option<Keyword> {
    let upper = word.to_ascii_uppercase();
    Some(match upper.as_str() {
        "FOR" => Keyword::For,
        "IN" => Keyword::In,
        "FILTER" => Keyword::Filter,
        "LET" => Keyword::Let,
        "COLLECT" => Keyword::Collect,
        "AGGREGATE" => Keyword::Aggregate,
        "SORT" => Keyword::Sort,
        "LIMIT" => Keyword::Limit,
        "RETURN" => Keyword::Return,
        "WITH" => Keyword::With,
        "AS" => Keyword::As,
        "ANY" => Keyword::Any,
        "ALL" => Keyword::All,
        "SATISFIES" => Keyword::Satisfies,
        "SIMILARITY" => Keyword::Similarity,
        "PROXIMITY" => Keyword::Proximity,
        "SHORTEST_PATH" => Keyword::ShortestPath,
        "FULLTEXT" => Keyword::Fulltext,
        "OUTBOUND" => Keyword::Outbound,
        "INBOUND" => Keyword::Inbound,
        "GRAPH" => Keyword::Graph,
        "AND" => Keyword::And,
        "OR" => Keyword::Or,
        "NOT" => Keyword::Not,
        "ASC" => Keyword::Asc,
        "DESC" => Keyword::Desc,
        "TRUE" => Keyword::True,
        "FALSE" => Keyword::False,
        "NULL" => Keyword::Null,
        "TO" => Keyword::To,
        _ => return None,
    })
}

/// Tokenizes AQL text.
///
/// # Errors
///
/// Returns [`CoreError::Parse`] on unterminated strings, malformed
/// numbers, or unexpected characters.
pub fn tokenize(text: &str) -> CoreResult<Vec<Token>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let start = pos;
        let c = bytes[pos] as char;

        match c {
            c if c.is_whitespace() => {
                pos += 1;
            }
            '/' if bytes.get(pos + 1) == Some(&b'/') => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                pos += 1;
                let mut value = String::new();
                loop {
                    let Some(&b) = bytes.get(pos) else {
                        return Err(CoreError::parse(start, "unterminated string literal"));
                    };
                    let ch = b as char;
                    pos += 1;
                    if ch == quote {
                        break;
                    }
                    if ch == '\\' {
                        let Some(&escaped) = bytes.get(pos) else {
                            return Err(CoreError::parse(start, "unterminated escape"));
                        };
                        pos += 1;
                        value.push(match escaped as char {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                    } else {
                        value.push(ch);
                    }
                }
                tokens.push(Token {
                    pos: start,
                    kind: TokenKind::Str(value),
                });
            }
            '@' => {
                pos += 1;
                let name_start = pos;
                while pos < bytes.len()
                    && ((bytes[pos] as char).is_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                if pos == name_start {
                    return Err(CoreError::parse(start, "empty bind parameter name"));
                }
                tokens.push(Token {
                    pos: start,
                    kind: TokenKind::Param(text[name_start..pos].to_string()),
                });
            }
            c if c.is_ascii_digit() => {
                while pos < bytes.len() && (bytes[pos] as char).is_ascii_digit() {
                    pos += 1;
                }
                // `..` after an integer is the range operator, not a float.
                let is_float = bytes.get(pos) == Some(&b'.')
                    && bytes.get(pos + 1) != Some(&b'.')
                    && bytes
                        .get(pos + 1)
                        .is_some_and(|b| (*b as char).is_ascii_digit());
                if is_float {
                    pos += 1;
                    while pos < bytes.len() && (bytes[pos] as char).is_ascii_digit() {
                        pos += 1;
                    }
                    let value: f64 = text[start..pos]
                        .parse()
                        .map_err(|_| CoreError::parse(start, "malformed number"))?;
                    tokens.push(Token {
                        pos: start,
                        kind: TokenKind::Float(value),
                    });
                } else {
                    let value: i64 = text[start..pos]
                        .parse()
                        .map_err(|_| CoreError::parse(start, "integer out of range"))?;
                    tokens.push(Token {
                        pos: start,
                        kind: TokenKind::Int(value),
                    });
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                while pos < bytes.len()
                    && ((bytes[pos] as char).is_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                let word = &text[start..pos];
                let kind = match keyword_of(word) {
                    Some(keyword) => TokenKind::Keyword(keyword),
                    None => TokenKind::Ident(word.to_string()),
                };
                tokens.push(Token { pos: start, kind });
            }
            _ => {
                let (kind, len) = match (c, bytes.get(pos + 1).map(|&b| b as char)) {
                    ('=', Some('=')) => (TokenKind::EqEq, 2),
                    ('!', Some('=')) => (TokenKind::NotEq, 2),
                    ('<', Some('=')) => (TokenKind::LtEq, 2),
                    ('>', Some('=')) => (TokenKind::GtEq, 2),
                    ('.', Some('.')) => (TokenKind::DotDot, 2),
                    ('=', _) => (TokenKind::Assign, 1),
                    ('<', _) => (TokenKind::Lt, 1),
                    ('>', _) => (TokenKind::Gt, 1),
                    ('+', _) => (TokenKind::Plus, 1),
                    ('-', _) => (TokenKind::Minus, 1),
                    ('*', _) => (TokenKind::Star, 1),
                    ('/', _) => (TokenKind::Slash, 1),
                    ('%', _) => (TokenKind::Percent, 1),
                    ('(', _) => (TokenKind::LParen, 1),
                    (')', _) => (TokenKind::RParen, 1),
                    ('[', _) => (TokenKind::LBracket, 1),
                    (']', _) => (TokenKind::RBracket, 1),
                    ('{', _) => (TokenKind::LBrace, 1),
                    ('}', _) => (TokenKind::RBrace, 1),
                    (',', _) => (TokenKind::Comma, 1),
                    (':', _) => (TokenKind::Colon, 1),
                    ('.', _) => (TokenKind::Dot, 1),
                    (other, _) => {
                        return Err(CoreError::parse(
                            start,
                            format!("unexpected character '{other}'"),
                        ));
                    }
                };
                tokens.push(Token { pos: start, kind });
                pos += len;
            }
        }
    }

    tokens.push(Token {
        pos: text.len(),
        kind: TokenKind::Eof,
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        tokenize(text).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_case_insensitive() {
        assert_eq!(
            kinds("FOR for For"),
            vec![
                TokenKind::Keyword(Keyword::For),
                TokenKind::Keyword(Keyword::For),
                TokenKind::Keyword(Keyword::For),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn identifiers_and_fields() {
        assert_eq!(
            kinds("o.amount"),
            vec![
                TokenKind::Ident("o".to_string()),
                TokenKind::Dot,
                TokenKind::Ident("amount".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(
            kinds("42 3.5 1..3"),
            vec![
                TokenKind::Int(42),
                TokenKind::Float(3.5),
                TokenKind::Int(1),
                TokenKind::DotDot,
                TokenKind::Int(3),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(
            kinds(r#""a\"b" 'c\n'"#),
            vec![
                TokenKind::Str("a\"b".to_string()),
                TokenKind::Str("c\n".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn params() {
        assert_eq!(
            kinds("@bbox @q1"),
            vec![
                TokenKind::Param("bbox".to_string()),
                TokenKind::Param("q1".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            kinds("== != <= >= < > ="),
            vec![
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Assign,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("RETURN 1 // trailing"),
            vec![
                TokenKind::Keyword(Keyword::Return),
                TokenKind::Int(1),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn errors_carry_position() {
        let err = tokenize("RETURN ^").unwrap_err();
        match err {
            CoreError::Parse { pos, .. } => assert_eq!(pos, 7),
            other => panic!("expected parse error, got {other:?}"),
        }

        assert!(tokenize("'unterminated").is_err());
        assert!(tokenize("@ ").is_err());
    }
}
