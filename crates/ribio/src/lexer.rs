//! Tokenizer for the ASCII RenderMan Interface Bytestream.

use crate::error::{Error, Result};
use logos::Logos;
use smol_str::SmolStr;

#[derive(Logos, Debug, Copy, Clone, PartialEq, Eq)]
enum RawTok {
    #[error]
    #[regex(r"[ \t\r\n]+", logos::skip)]
    #[regex(r"#[^\n]*", logos::skip)]
    Error,

    #[token("[")]
    BeginArray,

    #[token("]")]
    EndArray,

    #[regex(r#""([^"\\]|\\.)*""#)]
    Str,

    #[regex(r"-?[0-9]+")]
    Integer,

    #[regex(r"-?([0-9]+\.[0-9]*|\.[0-9]+)([eE][-+]?[0-9]+)?")]
    #[regex(r"-?[0-9]+[eE][-+]?[0-9]+")]
    Float,

    #[regex(r"[A-Za-z][A-Za-z0-9]*")]
    Request,
}

/// One RIB token with its source position.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    BeginArray,
    EndArray,
    String(SmolStr),
    Integer(i32),
    Float(f32),
    Request(SmolStr),
}

/// Expands the RIB string escape set.
fn unescape(quoted: &str) -> SmolStr {
    let inner = &quoted[1..quoted.len() - 1];
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
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            // Octal escapes \ooo.
            Some(d @ '0'..='7') => {
                let mut v = d as u32 - '0' as u32;
                let mut peek = chars.clone();
                for _ in 0..2 {
                    match peek.next() {
                        Some(o @ '0'..='7') => {
                            v = v * 8 + (o as u32 - '0' as u32);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                out.push(char::from_u32(v).unwrap_or('\u{fffd}'));
            }
            Some(other) => out.push(other),
            None => break,
        }
    }
    SmolStr::new(out)
}

fn position(source: &str, offset: usize) -> (usize, usize) {
    let upto = &source[..offset.min(source.len())];
    let line = upto.matches('\n').count() + 1;
    let col = offset - upto.rfind('\n').map(|i| i + 1).unwrap_or(0) + 1;
    (line, col)
}

/// Tokenizes a whole RIB stream, reporting the line/column of the first
/// bad token.
pub fn tokenize(source: &str) -> Result<Vec<(Token, usize)>> {
    let mut lexer = RawTok::lexer(source);
    let mut out = Vec::new();
    while let Some(tok) = lexer.next() {
        let start = lexer.span().start;
        let token = match tok {
            RawTok::Error => {
                let (line, col) = position(source, start);
                return Err(Error::Lex { line, col });
            }
            RawTok::BeginArray => Token::BeginArray,
            RawTok::EndArray => Token::EndArray,
            RawTok::Str => Token::String(unescape(lexer.slice())),
            RawTok::Integer => {
                Token::Integer(lexer.slice().parse().map_err(|_| {
                    let (line, col) = position(source, start);
                    Error::Lex { line, col }
                })?)
            }
            RawTok::Float => Token::Float(lexer.slice().parse().map_err(|_| {
                let (line, col) = position(source, start);
                Error::Lex { line, col }
            })?),
            RawTok::Request => Token::Request(SmolStr::new(lexer.slice())),
        };
        out.push((token, start));
    }
    Ok(out)
}

pub(crate) fn line_col(source: &str, offset: usize) -> (usize, usize) {
    position(source, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn requests_numbers_and_strings() {
        let t = toks("Sphere 1 -1 1 360 # a sphere\n");
        assert_eq!(
            t,
            vec![
                Token::Request("Sphere".into()),
                Token::Integer(1),
                Token::Integer(-1),
                Token::Integer(1),
                Token::Integer(360),
            ]
        );
    }

    #[test]
    fn floats_in_all_shapes() {
        let t = toks("1.5 .5 -2. 1e3 1.5e-2");
        assert_eq!(
            t,
            vec![
                Token::Float(1.5),
                Token::Float(0.5),
                Token::Float(-2.0),
                Token::Float(1000.0),
                Token::Float(0.015),
            ]
        );
    }

    #[test]
    fn arrays_and_strings() {
        let t = toks(r#"Color [0.5 0.5 0.5] Display "out.tif" "file" "rgba""#);
        assert_eq!(t[0], Token::Request("Color".into()));
        assert_eq!(t[1], Token::BeginArray);
        assert_eq!(t[5], Token::EndArray);
        assert_eq!(t[7], Token::String("out.tif".into()));
    }

    #[test]
    fn string_escapes() {
        let t = toks(r#""a\nb" "q\"q" "\101""#);
        assert_eq!(t[0], Token::String("a\nb".into()));
        assert_eq!(t[1], Token::String("q\"q".into()));
        assert_eq!(t[2], Token::String("A".into()));
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let t = toks("# whole line\nWorldBegin # trailing\nWorldEnd\n");
        assert_eq!(
            t,
            vec![
                Token::Request("WorldBegin".into()),
                Token::Request("WorldEnd".into()),
            ]
        );
    }

    #[test]
    fn bad_tokens_report_position() {
        match tokenize("WorldBegin\n  @@@\n") {
            Err(Error::Lex { line, col }) => {
                assert_eq!(line, 2);
                assert_eq!(col, 3);
            }
            other => panic!("expected lex error, got {other:?}"),
        }
    }
}
