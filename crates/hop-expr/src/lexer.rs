use crate::parser::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    EqEq,   // ==
    NotEq,  // !=
    Lt,     // <
    Le,     // <=
    Gt,     // >
    Ge,     // >=
    AndAnd, // &&
    OrOr,   // ||
    Bang,   // !
    Dot,    // .
    Comma,  // ,
    LParen, // (
    RParen, // )
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let b = bytes[pos];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
                continue;
            }
            b'(' => {
                tokens.push(Token { kind: TokenKind::LParen, pos: start });
                pos += 1;
            }
            b')' => {
                tokens.push(Token { kind: TokenKind::RParen, pos: start });
                pos += 1;
            }
            b'.' => {
                tokens.push(Token { kind: TokenKind::Dot, pos: start });
                pos += 1;
            }
            b',' => {
                tokens.push(Token { kind: TokenKind::Comma, pos: start });
                pos += 1;
            }
            b'=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::EqEq, pos: start });
                    pos += 2;
                } else {
                    return Err(ParseError::new(source, start, "expected '=='"));
                }
            }
            b'!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::NotEq, pos: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Bang, pos: start });
                    pos += 1;
                }
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Le, pos: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, pos: start });
                    pos += 1;
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Ge, pos: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, pos: start });
                    pos += 1;
                }
            }
            b'&' => {
                if bytes.get(pos + 1) == Some(&b'&') {
                    tokens.push(Token { kind: TokenKind::AndAnd, pos: start });
                    pos += 2;
                } else {
                    return Err(ParseError::new(source, start, "expected '&&'"));
                }
            }
            b'|' => {
                if bytes.get(pos + 1) == Some(&b'|') {
                    tokens.push(Token { kind: TokenKind::OrOr, pos: start });
                    pos += 2;
                } else {
                    return Err(ParseError::new(source, start, "expected '||'"));
                }
            }
            b'\'' | b'"' => {
                let quote = b;
                pos += 1;
                let mut value = String::new();
                loop {
                    match bytes.get(pos) {
                        None => {
                            return Err(ParseError::new(source, start, "unterminated string"));
                        }
                        Some(&c) if c == quote => {
                            pos += 1;
                            break;
                        }
                        Some(&b'\\') => {
                            pos += 1;
                            match bytes.get(pos) {
                                Some(&b'n') => value.push('\n'),
                                Some(&b't') => value.push('\t'),
                                Some(&c) => value.push(c as char),
                                None => {
                                    return Err(ParseError::new(
                                        source,
                                        start,
                                        "unterminated string",
                                    ));
                                }
                            }
                            pos += 1;
                        }
                        Some(_) => {
                            let ch = source[pos..].chars().next().unwrap_or('\u{fffd}');
                            value.push(ch);
                            pos += ch.len_utf8();
                        }
                    }
                }
                tokens.push(Token { kind: TokenKind::Str(value), pos: start });
            }
            b'0'..=b'9' => {
                while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                    pos += 1;
                }
                let text = &source[start..pos];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ParseError::new(source, start, "invalid number"))?;
                tokens.push(Token { kind: TokenKind::Number(n), pos: start });
            }
            _ if b.is_ascii_alphabetic() || b == b'_' => {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_' || bytes[pos] == b'-')
                {
                    pos += 1;
                }
                let text = &source[start..pos];
                let kind = match text {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "null" => TokenKind::Null,
                    _ => TokenKind::Ident(text.to_string()),
                };
                tokens.push(Token { kind, pos: start });
            }
            _ => {
                return Err(ParseError::new(source, start, "unexpected character"));
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, pos: bytes.len() });
    Ok(tokens)
}
