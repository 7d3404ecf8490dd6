//! Tokenizer for state expressions.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Question,
    Colon,
    Bang,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Int(i) => write!(f, "{i}"),
            Token::Float(x) => write!(f, "{x}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Ident(s) => f.write_str(s),
            Token::True => f.write_str("true"),
            Token::False => f.write_str("false"),
            Token::Null => f.write_str("null"),
            Token::In => f.write_str("in"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::Dot => f.write_str("."),
            Token::Comma => f.write_str(","),
            Token::Question => f.write_str("?"),
            Token::Colon => f.write_str(":"),
            Token::Bang => f.write_str("!"),
            Token::Minus => f.write_str("-"),
            Token::Plus => f.write_str("+"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Percent => f.write_str("%"),
            Token::EqEq => f.write_str("=="),
            Token::NotEq => f.write_str("!="),
            Token::Lt => f.write_str("<"),
            Token::Le => f.write_str("<="),
            Token::Gt => f.write_str(">"),
            Token::Ge => f.write_str(">="),
            Token::AndAnd => f.write_str("&&"),
            Token::OrOr => f.write_str("||"),
        }
    }
}

/// Token plus its byte offset, for error messages.
pub type Spanned = (Token, usize);

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, String> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let two = |a: u8, b: u8| c == a && bytes.get(i + 1) == Some(&b);
        let (tok, len) = if two(b'=', b'=') {
            (Token::EqEq, 2)
        } else if two(b'!', b'=') {
            (Token::NotEq, 2)
        } else if two(b'<', b'=') {
            (Token::Le, 2)
        } else if two(b'>', b'=') {
            (Token::Ge, 2)
        } else if two(b'&', b'&') {
            (Token::AndAnd, 2)
        } else if two(b'|', b'|') {
            (Token::OrOr, 2)
        } else {
            match c {
                b'(' => (Token::LParen, 1),
                b')' => (Token::RParen, 1),
                b'[' => (Token::LBracket, 1),
                b']' => (Token::RBracket, 1),
                b'.' if !bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => (Token::Dot, 1),
                b',' => (Token::Comma, 1),
                b'?' => (Token::Question, 1),
                b':' => (Token::Colon, 1),
                b'!' => (Token::Bang, 1),
                b'-' => (Token::Minus, 1),
                b'+' => (Token::Plus, 1),
                b'*' => (Token::Star, 1),
                b'/' => (Token::Slash, 1),
                b'%' => (Token::Percent, 1),
                b'<' => (Token::Lt, 1),
                b'>' => (Token::Gt, 1),
                b'"' | b'\'' => {
                    let (s, len) = string_literal(&src[i..], c)?;
                    (Token::Str(s), len)
                }
                b'0'..=b'9' | b'.' => number(&src[i..]).map_err(|e| format!("{e} at offset {start}"))?,
                c if c == b'_' || c.is_ascii_alphabetic() => {
                    let len = src[i..].bytes().take_while(|b| *b == b'_' || b.is_ascii_alphanumeric()).count();
                    let word = &src[i..i + len];
                    let tok = match word {
                        "true" => Token::True,
                        "false" => Token::False,
                        "null" => Token::Null,
                        "in" => Token::In,
                        _ => Token::Ident(word.to_string()),
                    };
                    (tok, len)
                }
                _ => return Err(format!("unexpected character {:?} at offset {}", src[i..].chars().next().unwrap_or('?'), start)),
            }
        };
        out.push((tok, start));
        i += len;
    }
    Ok(out)
}

fn string_literal(s: &str, quote: u8) -> Result<(String, usize), String> {
    let mut out = String::new();
    let mut chars = s.char_indices().skip(1);
    while let Some((idx, ch)) = chars.next() {
        match ch {
            c if c as u32 == quote as u32 => return Ok((out, idx + 1)),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, c @ ('\\' | '"' | '\''))) => out.push(c),
                Some((_, c)) => return Err(format!("unknown escape \\{c}")),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err("unterminated string literal".to_string())
}

fn number(s: &str) -> Result<(Token, usize), String> {
    let len = s
        .char_indices()
        .take_while(|(i, c)| {
            c.is_ascii_digit() || *c == '.' || *c == 'e' || *c == 'E' || ((*c == '-' || *c == '+') && *i > 0 && matches!(s.as_bytes()[i - 1], b'e' | b'E'))
        })
        .count();
    let text = &s[..len];
    if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>().map(|f| (Token::Float(f), len)).map_err(|_| format!("invalid number {text:?}"))
    } else {
        text.parse::<i64>().map(|n| (Token::Int(n), len)).map_err(|_| format!("invalid integer {text:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn operators_and_literals() {
        assert_eq!(
            toks(r#"object.status.phase == "Running" && x >= 1.5"#),
            vec![
                Token::Ident("object".into()),
                Token::Dot,
                Token::Ident("status".into()),
                Token::Dot,
                Token::Ident("phase".into()),
                Token::EqEq,
                Token::Str("Running".into()),
                Token::AndAnd,
                Token::Ident("x".into()),
                Token::Ge,
                Token::Float(1.5),
            ]
        );
        assert_eq!(toks("'a\\'b' in [1, 2e3]"), vec![
            Token::Str("a'b".into()),
            Token::In,
            Token::LBracket,
            Token::Int(1),
            Token::Comma,
            Token::Float(2000.0),
            Token::RBracket,
        ]);
    }

    #[test]
    fn lexical_errors() {
        assert!(tokenize("\"open").is_err());
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("a & b").is_err());
    }
}
