//! Deterministic guard expression evaluation.
//!
//! Edge guards and verification expressions are written in a small, safe
//! expression language evaluated over three bindings: `context` (packet
//! facts), `outputs` (completed task outputs), and `policy` (recorded
//! policy decisions). There is no host-code evaluation: expressions parse
//! into a tiny AST interpreted right here.
//!
//! ```text
//! outputs.scan.total > 0 && context.tier == "prod" && !policy.denied
//! ```
//!
//! Supported: `&& || !`, `== != < <= > >=`, parentheses, dotted property
//! paths rooted at a binding, and literals (`null`, booleans, numbers,
//! quoted strings). Evaluation is side-effect free; parse or evaluation
//! errors are logged at warn and collapse to `false`.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// The three roots a guard expression may reference.
#[derive(Debug, Clone, Default)]
pub struct GuardBindings {
    /// Context packet facts (keyed object).
    pub context: Value,
    /// Outputs of completed tasks, keyed by task id.
    pub outputs: Value,
    /// Policy decisions recorded so far.
    pub policy: Value,
}

impl GuardBindings {
    fn root(&self, name: &str) -> Option<&Value> {
        match name {
            "context" => Some(&self.context),
            "outputs" => Some(&self.outputs),
            "policy" => Some(&self.policy),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Guard parse and evaluation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    /// The expression text failed to tokenize or parse.
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset of the failure.
        offset: usize,
        /// What went wrong.
        message: String,
    },
    /// A path referenced an unknown root binding.
    #[error("unknown binding {0:?} (expected context, outputs, or policy)")]
    UnknownRoot(String),
    /// The expression applied an operator to unsupported operand types.
    #[error("type error: {0}")]
    Type(String),
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Comparison and logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `&&`
    And,
    /// `||`
    Or,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A JSON literal.
    Literal(Value),
    /// A dotted property path; the first segment is the binding root.
    Path(Vec<String>),
    /// Logical negation.
    Not(Box<Expr>),
    /// A binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(BinaryOp),
    Not,
    Dot,
    LParen,
    RParen,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> GuardError {
        GuardError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos = self.pos.saturating_add(1);
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, GuardError> {
        let mut tokens = Vec::new();
        while let Some(ch) = self.peek() {
            let start = self.pos;
            match ch {
                b' ' | b'\t' | b'\n' | b'\r' => self.bump(),
                b'(' => {
                    self.bump();
                    tokens.push((start, Token::LParen));
                }
                b')' => {
                    self.bump();
                    tokens.push((start, Token::RParen));
                }
                b'.' => {
                    self.bump();
                    tokens.push((start, Token::Dot));
                }
                b'&' => {
                    self.bump();
                    if self.peek() == Some(b'&') {
                        self.bump();
                        tokens.push((start, Token::Op(BinaryOp::And)));
                    } else {
                        return Err(self.error("expected '&&'"));
                    }
                }
                b'|' => {
                    self.bump();
                    if self.peek() == Some(b'|') {
                        self.bump();
                        tokens.push((start, Token::Op(BinaryOp::Or)));
                    } else {
                        return Err(self.error("expected '||'"));
                    }
                }
                b'=' => {
                    self.bump();
                    if self.peek() == Some(b'=') {
                        self.bump();
                        tokens.push((start, Token::Op(BinaryOp::Eq)));
                    } else {
                        return Err(self.error("expected '==' (assignment is not supported)"));
                    }
                }
                b'!' => {
                    self.bump();
                    if self.peek() == Some(b'=') {
                        self.bump();
                        tokens.push((start, Token::Op(BinaryOp::Ne)));
                    } else {
                        tokens.push((start, Token::Not));
                    }
                }
                b'<' => {
                    self.bump();
                    if self.peek() == Some(b'=') {
                        self.bump();
                        tokens.push((start, Token::Op(BinaryOp::Le)));
                    } else {
                        tokens.push((start, Token::Op(BinaryOp::Lt)));
                    }
                }
                b'>' => {
                    self.bump();
                    if self.peek() == Some(b'=') {
                        self.bump();
                        tokens.push((start, Token::Op(BinaryOp::Ge)));
                    } else {
                        tokens.push((start, Token::Op(BinaryOp::Gt)));
                    }
                }
                b'"' | b'\'' => {
                    let quote = ch;
                    self.bump();
                    let text_start = self.pos;
                    while let Some(c) = self.peek() {
                        if c == quote {
                            break;
                        }
                        self.bump();
                    }
                    if self.peek() != Some(quote) {
                        return Err(self.error("unterminated string literal"));
                    }
                    let text = self.src.get(text_start..self.pos).unwrap_or("").to_owned();
                    self.bump();
                    tokens.push((start, Token::Str(text)));
                }
                b'0'..=b'9' | b'-' => {
                    if ch == b'-' && !matches!(self.bytes.get(self.pos.saturating_add(1)), Some(b'0'..=b'9')) {
                        return Err(self.error("'-' must begin a number literal"));
                    }
                    self.bump();
                    while matches!(self.peek(), Some(b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')) {
                        // Stop a trailing path-style dot from being eaten:
                        // digits may follow a dot only inside the number.
                        if self.peek() == Some(b'.')
                            && !matches!(self.bytes.get(self.pos.saturating_add(1)), Some(b'0'..=b'9'))
                        {
                            break;
                        }
                        self.bump();
                    }
                    let text = self.src.get(start..self.pos).unwrap_or("");
                    let number: f64 = text
                        .parse()
                        .map_err(|_| self.error(format!("invalid number {text:?}")))?;
                    tokens.push((start, Token::Number(number)));
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    self.bump();
                    while matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-')) {
                        self.bump();
                    }
                    let text = self.src.get(start..self.pos).unwrap_or("").to_owned();
                    tokens.push((start, Token::Ident(text)));
                }
                other => {
                    return Err(self.error(format!("unexpected character {:?}", char::from(other))));
                }
            }
        }
        Ok(tokens)
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn error_at(&self, message: impl Into<String>) -> GuardError {
        let offset = self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(usize::MAX);
        GuardError::Parse {
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos = self.pos.saturating_add(1);
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), GuardError> {
        match self.bump() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(self.error_at(format!("expected {expected:?}, found {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, GuardError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinaryOp::Or)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, GuardError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::Op(BinaryOp::And)) {
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, GuardError> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, GuardError> {
        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Op(op @ (BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge))) => *op,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.parse_operand()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_operand(&mut self) -> Result<Expr, GuardError> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "null" => Ok(Expr::Literal(Value::Null)),
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                _ => {
                    let mut segments = vec![name];
                    while self.peek() == Some(&Token::Dot) {
                        self.bump();
                        match self.bump() {
                            Some(Token::Ident(segment)) => segments.push(segment),
                            Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                                // Array index written as a path segment;
                                // f64 Display renders 1.0 as "1".
                                segments.push(format!("{n}"));
                            }
                            other => {
                                return Err(
                                    self.error_at(format!("expected path segment, found {other:?}"))
                                )
                            }
                        }
                    }
                    Ok(Expr::Path(segments))
                }
            },
            other => Err(self.error_at(format!("expected operand, found {other:?}"))),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        if n < 0.0 {
            return Value::from(n as i64);
        }
        return Value::from(n as u64);
    }
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// Parse a guard expression into its AST without evaluating it.
///
/// # Errors
///
/// Returns [`GuardError::Parse`] on malformed input.
pub fn parse(expr: &str) -> Result<Expr, GuardError> {
    let tokens = Lexer::new(expr).tokenize()?;
    if tokens.is_empty() {
        return Err(GuardError::Parse {
            offset: 0,
            message: "empty expression".to_owned(),
        });
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(parser.error_at("trailing tokens after expression"));
    }
    Ok(ast)
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

fn resolve_path(segments: &[String], bindings: &GuardBindings) -> Result<Value, GuardError> {
    let root_name = segments.first().map(String::as_str).unwrap_or("");
    let root = bindings
        .root(root_name)
        .ok_or_else(|| GuardError::UnknownRoot(root_name.to_owned()))?;

    let mut current = root;
    for segment in segments.iter().skip(1) {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .unwrap_or(&Value::Null),
            // Missing intermediate values resolve to null rather than
            // erroring, so guards can probe optional outputs.
            _ => &Value::Null,
        };
    }
    Ok(current.clone())
}

fn eval_value(expr: &Expr, bindings: &GuardBindings) -> Result<Value, GuardError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => resolve_path(segments, bindings),
        Expr::Not(inner) => {
            let value = eval_value(inner, bindings)?;
            Ok(Value::Bool(!truthy(&value)?))
        }
        Expr::Binary { op, lhs, rhs } => {
            let result = match op {
                BinaryOp::And => {
                    // Short-circuit.
                    truthy(&eval_value(lhs, bindings)?)? && truthy(&eval_value(rhs, bindings)?)?
                }
                BinaryOp::Or => {
                    truthy(&eval_value(lhs, bindings)?)? || truthy(&eval_value(rhs, bindings)?)?
                }
                BinaryOp::Eq => values_equal(&eval_value(lhs, bindings)?, &eval_value(rhs, bindings)?),
                BinaryOp::Ne => !values_equal(&eval_value(lhs, bindings)?, &eval_value(rhs, bindings)?),
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    let ordering = compare(&eval_value(lhs, bindings)?, &eval_value(rhs, bindings)?)?;
                    match op {
                        BinaryOp::Lt => ordering.is_lt(),
                        BinaryOp::Le => ordering.is_le(),
                        BinaryOp::Gt => ordering.is_gt(),
                        _ => ordering.is_ge(),
                    }
                }
            };
            Ok(Value::Bool(result))
        }
    }
}

/// Boolean interpretation: `true`/`false` as themselves, `null` as false.
/// Anything else in a boolean position is a type error.
fn truthy(value: &Value) -> Result<bool, GuardError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(GuardError::Type(format!(
            "expected boolean, found {other}"
        ))),
    }
}

/// Structural equality with numeric normalization (`1 == 1.0`).
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

/// Ordering for numbers and strings only; mixed or unordered types error.
fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, GuardError> {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a.partial_cmp(&b).ok_or_else(|| {
            GuardError::Type("NaN is not orderable".to_owned())
        });
    }
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        return Ok(a.cmp(b));
    }
    Err(GuardError::Type(format!(
        "cannot order {lhs} against {rhs}"
    )))
}

/// Evaluate `expr` against `bindings` to a strict boolean.
///
/// # Errors
///
/// Returns [`GuardError`] on parse failure, unknown roots, or type errors.
/// Callers that must never fail should use [`evaluate_or_false`].
pub fn evaluate(expr: &str, bindings: &GuardBindings) -> Result<bool, GuardError> {
    let ast = parse(expr)?;
    let value = eval_value(&ast, bindings)?;
    truthy(&value)
}

/// Evaluate a guard the way the scheduler does: any error is logged at
/// warn and collapses to `false`, keeping traversal deterministic.
pub fn evaluate_or_false(expr: &str, bindings: &GuardBindings) -> bool {
    match evaluate(expr, bindings) {
        Ok(result) => result,
        Err(e) => {
            warn!(guard = expr, error = %e, "guard evaluation failed, treating as false");
            false
        }
    }
}
