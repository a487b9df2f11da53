/// Recursive-descent parser producing the expression AST
///
/// Precedence, loosest first: `||`, `&&`, `!`, comparisons and string
/// predicates (non-associative), unary minus on literals, primaries.

use crate::expression::error::ExpressionError;
use crate::expression::lexer::{tokenize, BinaryOp, Spanned, Token};
use serde_json::Value;
use std::fmt;

/// Longest expression source accepted.
pub const MAX_EXPRESSION_LENGTH: usize = 4096;

/// Deepest nesting of parentheses/unary operators accepted.
pub const MAX_NESTING_DEPTH: usize = 64;

/// The three variable roots an expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Steps,
    Trigger,
    Env,
}

impl Root {
    pub fn as_str(&self) -> &'static str {
        match self {
            Root::Steps => "steps",
            Root::Trigger => "trigger",
            Root::Env => "env",
        }
    }

    fn from_ident(name: &str) -> Option<Self> {
        match name {
            "steps" => Some(Root::Steps),
            "trigger" => Some(Root::Trigger),
            "env" => Some(Root::Env),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// A variable reference such as `steps.fetch.data[0].name`.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub root: Root,
    pub segments: Vec<Segment>,
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.as_str())?;
        for segment in &self.segments {
            match segment {
                Segment::Field(name) => write!(f, ".{}", name)?,
                Segment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(PathExpr),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Collect every variable path referenced by this expression.
    pub fn collect_paths<'a>(&'a self, out: &mut Vec<&'a PathExpr>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(path) => out.push(path),
            Expr::Not(inner) => inner.collect_paths(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_paths(out);
                rhs.collect_paths(out);
            }
        }
    }
}

/// Strip optional `{{ }}` wrapping and check bracket/quote balance.
///
/// Returns the inner source and its byte offset in the original text.
pub fn unwrap_template(source: &str) -> Result<(&str, usize), ExpressionError> {
    if source.len() > MAX_EXPRESSION_LENGTH {
        return Err(ExpressionError::compile(format!(
            "expression exceeds {} characters",
            MAX_EXPRESSION_LENGTH
        )));
    }

    let leading = source.len() - source.trim_start().len();
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(ExpressionError::EmptyExpression);
    }

    let (inner, offset) = if let Some(rest) = trimmed.strip_prefix("{{") {
        let Some(body) = rest.strip_suffix("}}") else {
            return Err(ExpressionError::parse(
                "template opened with '{{' is never closed",
                leading,
            ));
        };
        (body, leading + 2)
    } else if trimmed.ends_with("}}") {
        return Err(ExpressionError::parse(
            "template closed with '}}' was never opened",
            leading + trimmed.len() - 2,
        ));
    } else {
        (trimmed, leading)
    };

    if let Some(pos) = inner.find("{{").or_else(|| inner.find("}}")) {
        return Err(ExpressionError::parse(
            "template markers must wrap the whole expression",
            offset + pos,
        ));
    }
    if inner.trim().is_empty() {
        return Err(ExpressionError::EmptyExpression);
    }

    check_balance(inner, offset)?;
    Ok((inner, offset))
}

fn check_balance(inner: &str, offset: usize) -> Result<(), ExpressionError> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut quote: Option<(char, usize)> = None;
    let mut escaped = false;

    for (pos, c) in inner.char_indices() {
        if let Some((q, _)) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some((c, pos)),
            '(' | '[' => stack.push((c, pos)),
            ')' | ']' => {
                let expected = if c == ')' { '(' } else { '[' };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => {
                        return Err(ExpressionError::parse(
                            format!("unbalanced '{}'", c),
                            offset + pos,
                        ))
                    }
                }
            }
            _ => {}
        }
    }

    if let Some((q, pos)) = quote {
        return Err(ExpressionError::parse(
            format!("unterminated string starting with {}", q),
            offset + pos,
        ));
    }
    if let Some((open, pos)) = stack.pop() {
        return Err(ExpressionError::parse(
            format!("unbalanced '{}'", open),
            offset + pos,
        ));
    }
    Ok(())
}

/// Parse a full expression (optionally `{{ }}`-wrapped) into an AST.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let (inner, offset) = unwrap_template(source)?;
    let tokens = tokenize(inner, offset)?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ExpressionError::compile(format!(
            "unexpected {} at offset {}",
            describe(&extra.token),
            extra.pos
        )));
    }
    Ok(expr)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Integer(n) => format!("number {}", n),
        Token::Float(n) => format!("number {}", n),
        Token::Str(s) => format!("string '{}'", s),
        Token::Ident(name) => format!("identifier '{}'", name),
        Token::True => "'true'".to_string(),
        Token::False => "'false'".to_string(),
        Token::Null => "'null'".to_string(),
        Token::Dot => "'.'".to_string(),
        Token::LBracket => "'['".to_string(),
        Token::RBracket => "']'".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::Minus => "'-'".to_string(),
        Token::Not => "'!'".to_string(),
        Token::Op(op) => format!("operator '{}'", op.symbol()),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.cursor)
    }

    fn next(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.cursor).cloned();
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn next_or_eof(&mut self, wanted: &str) -> Result<Spanned, ExpressionError> {
        self.next().ok_or_else(|| {
            ExpressionError::compile(format!("unexpected end of expression, expected {}", wanted))
        })
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ExpressionError::compile(format!(
                "expression nesting exceeds {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn peek_op(&self, wanted: BinaryOp) -> bool {
        matches!(self.peek(), Some(Spanned { token: Token::Op(op), .. }) if *op == wanted)
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_and()?;
        while self.peek_op(BinaryOp::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_not()?;
        while self.peek_op(BinaryOp::And) {
            self.next();
            let rhs = self.parse_not()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Some(Spanned { token: Token::Not, .. })) {
            self.next();
            self.enter()?;
            let inner = self.parse_not()?;
            self.leave();
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Some(Spanned {
                token: Token::Op(op),
                ..
            }) if !matches!(op, BinaryOp::And | BinaryOp::Or) => *op,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.parse_operand()?;

        if let Some(Spanned {
            token: Token::Op(next),
            pos,
        }) = self.peek()
        {
            if !matches!(next, BinaryOp::And | BinaryOp::Or) {
                return Err(ExpressionError::compile(format!(
                    "comparison operators cannot be chained ('{}' at offset {})",
                    next.symbol(),
                    pos
                )));
            }
        }

        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_operand(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Some(Spanned { token: Token::Minus, .. })) {
            let minus = self.next_or_eof("number")?;
            return match self.next_or_eof("number")?.token {
                Token::Integer(n) => Ok(Expr::Literal(Value::from(-n))),
                Token::Float(n) => Ok(Expr::Literal(Value::from(-n))),
                other => Err(ExpressionError::compile(format!(
                    "unary '-' at offset {} must be followed by a number, found {}",
                    minus.pos,
                    describe(&other)
                ))),
            };
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let Spanned { token, pos } = self.next_or_eof("a value")?;
        match token {
            Token::Integer(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.leave();
                match self.next_or_eof("')'")?.token {
                    Token::RParen => Ok(inner),
                    other => Err(ExpressionError::compile(format!(
                        "expected ')' but found {}",
                        describe(&other)
                    ))),
                }
            }
            Token::Ident(name) => {
                let root = Root::from_ident(&name).ok_or_else(|| {
                    ExpressionError::compile(format!(
                        "unknown variable '{}' at offset {}: paths must start with steps, trigger or env",
                        name, pos
                    ))
                })?;
                self.parse_path(root)
            }
            other => Err(ExpressionError::compile(format!(
                "unexpected {} at offset {}",
                describe(&other),
                pos
            ))),
        }
    }

    fn parse_path(&mut self, root: Root) -> Result<Expr, ExpressionError> {
        let mut segments = Vec::new();
        loop {
            match self.peek().map(|s| &s.token) {
                Some(Token::Dot) => {
                    self.next();
                    match self.next_or_eof("a field name")? {
                        Spanned {
                            token: Token::Ident(name),
                            ..
                        } => segments.push(Segment::Field(name)),
                        Spanned { token, pos } => {
                            return Err(ExpressionError::compile(format!(
                                "expected field name after '.' at offset {}, found {}",
                                pos,
                                describe(&token)
                            )))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = match self.next_or_eof("an index")? {
                        Spanned {
                            token: Token::Integer(n),
                            ..
                        } if n >= 0 => n as usize,
                        Spanned { token, pos } => {
                            return Err(ExpressionError::compile(format!(
                                "array index at offset {} must be a non-negative integer, found {}",
                                pos,
                                describe(&token)
                            )))
                        }
                    };
                    match self.next_or_eof("']'")?.token {
                        Token::RBracket => segments.push(Segment::Index(index)),
                        other => {
                            return Err(ExpressionError::compile(format!(
                                "expected ']' but found {}",
                                describe(&other)
                            )))
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(Expr::Path(PathExpr { root, segments }))
    }
}
