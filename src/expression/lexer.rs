/// Tokenizer for the condition language
///
/// Produces a flat token stream. Word operators (`and`, `contains`, ...) are
/// only recognised outside of path position, so `steps.check.contains` still
/// reads as a field named `contains`.

use crate::expression::error::ExpressionError;

/// Binary operators shared by the lexer, parser and evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Contains,
    StartsWith,
    EndsWith,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Contains => "contains",
            BinaryOp::StartsWith => "starts_with",
            BinaryOp::EndsWith => "ends_with",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge)
    }

    pub fn is_string_predicate(&self) -> bool {
        matches!(
            self,
            BinaryOp::Contains | BinaryOp::StartsWith | BinaryOp::EndsWith
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Integer(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Minus,
    Not,
    Op(BinaryOp),
}

/// A token plus its byte offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

fn word_operator(word: &str) -> Option<Token> {
    let token = match word {
        "and" => Token::Op(BinaryOp::And),
        "or" => Token::Op(BinaryOp::Or),
        "not" => Token::Not,
        "eq" => Token::Op(BinaryOp::Eq),
        "ne" => Token::Op(BinaryOp::Ne),
        "lt" => Token::Op(BinaryOp::Lt),
        "le" => Token::Op(BinaryOp::Le),
        "gt" => Token::Op(BinaryOp::Gt),
        "ge" => Token::Op(BinaryOp::Ge),
        "contains" => Token::Op(BinaryOp::Contains),
        "starts_with" | "startsWith" => Token::Op(BinaryOp::StartsWith),
        "ends_with" | "endsWith" => Token::Op(BinaryOp::EndsWith),
        "true" => Token::True,
        "false" => Token::False,
        "null" | "nil" => Token::Null,
        _ => return None,
    };
    Some(token)
}

/// Split `source` into tokens. `offset` is added to every reported position so
/// errors point into the original (possibly `{{ }}`-wrapped) text.
pub fn tokenize(source: &str, offset: usize) -> Result<Vec<Spanned>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens: Vec<Spanned> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let pos = pos + offset;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = chars.get(i + 1).map(|(_, n)| *n);
        let symbol = match (c, two) {
            ('=', Some('=')) => Some((Token::Op(BinaryOp::Eq), 2)),
            ('!', Some('=')) => Some((Token::Op(BinaryOp::Ne), 2)),
            ('<', Some('=')) => Some((Token::Op(BinaryOp::Le), 2)),
            ('>', Some('=')) => Some((Token::Op(BinaryOp::Ge), 2)),
            ('&', Some('&')) => Some((Token::Op(BinaryOp::And), 2)),
            ('|', Some('|')) => Some((Token::Op(BinaryOp::Or), 2)),
            ('*', Some('=')) => Some((Token::Op(BinaryOp::Contains), 2)),
            ('^', Some('=')) => Some((Token::Op(BinaryOp::StartsWith), 2)),
            ('$', Some('=')) => Some((Token::Op(BinaryOp::EndsWith), 2)),
            ('<', _) => Some((Token::Op(BinaryOp::Lt), 1)),
            ('>', _) => Some((Token::Op(BinaryOp::Gt), 1)),
            ('!', _) => Some((Token::Not, 1)),
            ('.', _) => Some((Token::Dot, 1)),
            ('[', _) => Some((Token::LBracket, 1)),
            (']', _) => Some((Token::RBracket, 1)),
            ('(', _) => Some((Token::LParen, 1)),
            (')', _) => Some((Token::RParen, 1)),
            ('-', _) => Some((Token::Minus, 1)),
            _ => None,
        };
        if let Some((token, width)) = symbol {
            tokens.push(Spanned { token, pos });
            i += width;
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            let mut j = i + 1;
            let mut closed = false;
            while j < chars.len() {
                let ch = chars[j].1;
                if ch == '\\' {
                    if let Some((_, escaped)) = chars.get(j + 1) {
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        j += 2;
                        continue;
                    }
                }
                if ch == quote {
                    closed = true;
                    break;
                }
                value.push(ch);
                j += 1;
            }
            if !closed {
                return Err(ExpressionError::parse("unterminated string literal", pos));
            }
            tokens.push(Spanned {
                token: Token::Str(value),
                pos,
            });
            i = j + 1;
            continue;
        }

        let after_dot = matches!(tokens.last(), Some(Spanned { token: Token::Dot, .. }));

        if c.is_ascii_digit() && after_dot {
            // A path segment such as `items.0`, never a fraction.
            let mut j = i;
            while j < chars.len() && chars[j].1.is_ascii_digit() {
                j += 1;
            }
            let end = chars.get(j).map(|(p, _)| *p).unwrap_or(source.len());
            tokens.push(Spanned {
                token: Token::Ident(source[chars[i].0..end].to_string()),
                pos,
            });
            i = j;
            continue;
        }

        if c.is_ascii_digit() {
            let mut j = i;
            let mut seen_dot = false;
            while j < chars.len() {
                let ch = chars[j].1;
                if ch.is_ascii_digit() {
                    j += 1;
                } else if ch == '.'
                    && !seen_dot
                    && chars.get(j + 1).is_some_and(|(_, n)| n.is_ascii_digit())
                {
                    seen_dot = true;
                    j += 1;
                } else {
                    break;
                }
            }
            let end = chars.get(j).map(|(p, _)| *p).unwrap_or(source.len());
            let text = &source[chars[i].0..end];
            let token = if seen_dot {
                text.parse::<f64>()
                    .map(Token::Float)
                    .map_err(|_| ExpressionError::compile(format!("invalid number '{}'", text)))?
            } else {
                text.parse::<i64>()
                    .map(Token::Integer)
                    .map_err(|_| ExpressionError::compile(format!("invalid number '{}'", text)))?
            };
            tokens.push(Spanned { token, pos });
            i = j;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut j = i;
            while j < chars.len() && (chars[j].1.is_alphanumeric() || chars[j].1 == '_') {
                j += 1;
            }
            let end = chars.get(j).map(|(p, _)| *p).unwrap_or(source.len());
            let word = &source[chars[i].0..end];
            let token = if after_dot {
                Token::Ident(word.to_string())
            } else {
                word_operator(word).unwrap_or_else(|| Token::Ident(word.to_string()))
            };
            tokens.push(Spanned { token, pos });
            i = j;
            continue;
        }

        return Err(ExpressionError::compile(format!(
            "unexpected character '{}' at offset {}",
            c, pos
        )));
    }

    Ok(tokens)
}
