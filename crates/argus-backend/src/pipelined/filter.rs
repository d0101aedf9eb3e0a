//! Sandboxed filter expression evaluation.
//!
//! Filter expressions are predicates over the event document with `event`
//! as the bound variable: dotted field paths, literals, comparisons, and
//! boolean connectives. Nothing else — no calls, no assignment, no I/O —
//! so an expression can never touch the filesystem or network, and every
//! evaluation is bounded by a deadline.
//!
//! ```text
//! event.check.status >= 2 && event.entity.metadata.labels.region == 'eu'
//! ```

use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

/// Longest accepted expression source.
const MAX_EXPRESSION_LEN: usize = 4096;

/// Expression parse or evaluation failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    /// The source could not be parsed.
    #[error("invalid expression: {0}")]
    Parse(String),

    /// Evaluation exceeded its deadline.
    #[error("expression evaluation timed out")]
    Timeout,

    /// Operands of incompatible types were compared.
    #[error("type error: {0}")]
    Type(String),
}

/// Comparison and equality operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Bool(bool),
    Number(f64),
    Str(String),
    Path(Vec<String>),
    Not(Box<Node>),
    Cmp(CmpOp, Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Node,
}

impl Expression {
    /// Parses an expression source.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Parse`] on any syntax error.
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        if source.len() > MAX_EXPRESSION_LEN {
            return Err(FilterError::Parse("expression too long".to_string()));
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(FilterError::Parse(format!(
                "unexpected trailing input at token {}",
                parser.pos
            )));
        }
        Ok(Self { root })
    }

    /// Evaluates against a document rooted at the `event` variable.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Timeout`] past the deadline and
    /// [`FilterError::Type`] on ill-typed comparisons; callers treat both
    /// as "expression did not match".
    pub fn evaluate(&self, event_doc: &Value, deadline: Instant) -> Result<bool, FilterError> {
        self.evaluate_as("event", event_doc, deadline)
    }

    /// Evaluates with a different bound variable name; proxy check
    /// selectors bind `entity` instead of `event`.
    ///
    /// # Errors
    ///
    /// See [`Expression::evaluate`].
    pub fn evaluate_as(
        &self,
        root: &str,
        doc: &Value,
        deadline: Instant,
    ) -> Result<bool, FilterError> {
        let scope = Scope { root, doc };
        truthy(&eval(&self.root, &scope, deadline)?)
    }
}

/// The bound variable and document an evaluation resolves paths in.
struct Scope<'a> {
    root: &'a str,
    doc: &'a Value,
}

/// Runtime values an expression node reduces to.
#[derive(Debug, Clone, PartialEq)]
enum Val {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

fn truthy(val: &Val) -> Result<bool, FilterError> {
    match val {
        Val::Bool(b) => Ok(*b),
        Val::Null => Ok(false),
        other => Err(FilterError::Type(format!(
            "expected a boolean, found {other:?}"
        ))),
    }
}

fn eval(node: &Node, scope: &Scope<'_>, deadline: Instant) -> Result<Val, FilterError> {
    if Instant::now() > deadline {
        return Err(FilterError::Timeout);
    }
    match node {
        Node::Bool(b) => Ok(Val::Bool(*b)),
        Node::Number(n) => Ok(Val::Number(*n)),
        Node::Str(s) => Ok(Val::Str(s.clone())),
        Node::Path(path) => Ok(resolve(path, scope)),
        Node::Not(inner) => Ok(Val::Bool(!truthy(&eval(inner, scope, deadline)?)?)),
        Node::And(lhs, rhs) => {
            if truthy(&eval(lhs, scope, deadline)?)? {
                Ok(Val::Bool(truthy(&eval(rhs, scope, deadline)?)?))
            } else {
                Ok(Val::Bool(false))
            }
        }
        Node::Or(lhs, rhs) => {
            if truthy(&eval(lhs, scope, deadline)?)? {
                Ok(Val::Bool(true))
            } else {
                Ok(Val::Bool(truthy(&eval(rhs, scope, deadline)?)?))
            }
        }
        Node::Cmp(op, lhs, rhs) => {
            let lhs = eval(lhs, scope, deadline)?;
            let rhs = eval(rhs, scope, deadline)?;
            compare(*op, &lhs, &rhs).map(Val::Bool)
        }
    }
}

fn compare(op: CmpOp, lhs: &Val, rhs: &Val) -> Result<bool, FilterError> {
    match op {
        CmpOp::Eq => Ok(equal(lhs, rhs)),
        CmpOp::Ne => Ok(!equal(lhs, rhs)),
        _ => {
            let ordering = match (lhs, rhs) {
                (Val::Number(a), Val::Number(b)) => a.partial_cmp(b),
                (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(FilterError::Type(format!(
                        "cannot order {lhs:?} against {rhs:?}"
                    )))
                }
            };
            let Some(ordering) = ordering else {
                return Ok(false);
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

/// Equality is type-strict; comparing across types is simply false.
fn equal(lhs: &Val, rhs: &Val) -> bool {
    match (lhs, rhs) {
        (Val::Null, Val::Null) => true,
        (Val::Bool(a), Val::Bool(b)) => a == b,
        (Val::Number(a), Val::Number(b)) => (a - b).abs() < f64::EPSILON || a == b,
        (Val::Str(a), Val::Str(b)) => a == b,
        _ => false,
    }
}

/// Resolves a dotted path against the document. Missing fields resolve
/// to null rather than erroring, so filters degrade to "no match".
fn resolve(path: &[String], scope: &Scope<'_>) -> Val {
    let mut current = scope.doc;
    let mut segments = path.iter();
    // The leading segment must name the bound variable.
    match segments.next().map(String::as_str) {
        Some(root) if root == scope.root => {}
        Some(_) | None => return Val::Null,
    }
    for segment in segments {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Val::Null,
        }
    }
    match current {
        Value::Null => Val::Null,
        Value::Bool(b) => Val::Bool(*b),
        Value::Number(n) => n.as_f64().map_or(Val::Null, Val::Number),
        Value::String(s) => Val::Str(s.clone()),
        // Containers have no literal form in the language.
        Value::Array(_) | Value::Object(_) => Val::Null,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Number(f64),
    Str(String),
    Bool(bool),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(FilterError::Parse("expected &&".to_string()));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(FilterError::Parse("expected ||".to_string()));
                }
                tokens.push(Token::Or);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ne));
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(FilterError::Parse("expected ==".to_string()));
                }
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => {
                            return Err(FilterError::Parse("unterminated string".to_string()));
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' | '-' => {
                let mut number = String::new();
                number.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed = number
                    .parse::<f64>()
                    .map_err(|_| FilterError::Parse(format!("bad number {number}")))?;
                tokens.push(Token::Number(parsed));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut path = Vec::new();
                let mut segment = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        segment.push(d);
                        chars.next();
                    } else if d == '.' {
                        if segment.is_empty() {
                            return Err(FilterError::Parse("empty path segment".to_string()));
                        }
                        path.push(std::mem::take(&mut segment));
                        chars.next();
                    } else {
                        break;
                    }
                }
                if segment.is_empty() {
                    return Err(FilterError::Parse("trailing dot in path".to_string()));
                }
                path.push(segment);
                match path.as_slice() {
                    [one] if one == "true" => tokens.push(Token::Bool(true)),
                    [one] if one == "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Path(path)),
                }
            }
            other => {
                return Err(FilterError::Parse(format!("unexpected character {other:?}")));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Node, FilterError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, FilterError> {
        let mut node = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_cmp()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_cmp(&mut self) -> Result<Node, FilterError> {
        let lhs = self.parse_unary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_unary()?;
            return Ok(Node::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, FilterError> {
        match self.next() {
            Some(Token::Not) => Ok(Node::Not(Box::new(self.parse_unary()?))),
            Some(Token::LParen) => {
                let node = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(node),
                    _ => Err(FilterError::Parse("expected )".to_string())),
                }
            }
            Some(Token::Bool(b)) => Ok(Node::Bool(b)),
            Some(Token::Number(n)) => Ok(Node::Number(n)),
            Some(Token::Str(s)) => Ok(Node::Str(s)),
            Some(Token::Path(p)) => Ok(Node::Path(p)),
            other => Err(FilterError::Parse(format!(
                "expected an operand, found {other:?}"
            ))),
        }
    }
}
