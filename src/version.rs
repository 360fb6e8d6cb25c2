//! Version comparison and constraint-expression evaluation.
//!
//! Versions are plain `semver::Version`s; ordering uses semantic-version
//! precedence, so build metadata never participates. Constraints are
//! boolean expressions over comparator clauses:
//!
//! ```text
//! expr   := term ( '|' | '||' term )*
//! term   := factor ( '&' | '&&' | ',' factor )*
//! factor := '(' expr ')' | clause
//! clause := comparators, e.g. ">=1.2.0 <2.0.0", "~1.4", "^2", "=1.0.0", "*"
//! ```
//!
//! Each comparator is evaluated by `semver::VersionReq`, so bare versions
//! ("1.2") follow caret semantics. The literal wildcard `*` matches every
//! version, pre-releases included.

use std::cmp::Ordering;
use std::fmt;

use semver::{Version, VersionReq};

use crate::error::{Error, Result};

/// Parses a semantic version, reporting failures as data errors.
pub fn parse_version(input: &str) -> Result<Version> {
    Version::parse(input.trim()).map_err(|e| Error::InvalidVersion {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Semantic-version precedence: major, minor, patch, then pre-release
/// identifiers; build metadata is ignored.
pub fn compare_precedence(a: &Version, b: &Version) -> Ordering {
    a.cmp_precedence(b)
}

/// A parsed product-compatibility constraint expression.
#[derive(Debug, Clone)]
pub struct Constraint {
    expr: String,
    node: Node,
}

#[derive(Debug, Clone)]
enum Node {
    /// The literal wildcard; matches everything, pre-releases included.
    Any,
    Clause(VersionReq),
    All(Vec<Node>),
    AnyOf(Vec<Node>),
}

impl Constraint {
    /// Parses a constraint expression. Errors are data-validation failures
    /// attributable to one descriptor, never fatal.
    pub fn parse(expr: &str) -> Result<Self> {
        let toks = tokenize(expr)?;
        let mut parser = Parser {
            expr,
            toks,
            pos: 0,
        };
        let node = parser.parse_expr()?;
        if parser.pos != parser.toks.len() {
            return Err(invalid(expr, "unexpected trailing tokens"));
        }
        Ok(Self {
            expr: expr.to_string(),
            node,
        })
    }

    /// The constraint that matches every version.
    pub fn any() -> Self {
        Self {
            expr: "*".to_string(),
            node: Node::Any,
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        eval(&self.node, version)
    }

    /// Whether this is the literal wildcard, which is compatible with any
    /// host independently of its version.
    pub fn is_wildcard(&self) -> bool {
        self.expr.trim() == "*"
    }

    /// The source expression this constraint was parsed from.
    pub fn expr(&self) -> &str {
        &self.expr
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn eval(node: &Node, version: &Version) -> bool {
    match node {
        Node::Any => true,
        Node::Clause(req) => req.matches(version),
        Node::All(nodes) => nodes.iter().all(|n| eval(n, version)),
        Node::AnyOf(nodes) => nodes.iter().any(|n| eval(n, version)),
    }
}

fn invalid(expr: &str, reason: impl fmt::Display) -> Error {
    Error::InvalidConstraint {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug)]
enum Tok {
    Open,
    Close,
    Or,
    And,
    Clause(String),
}

fn tokenize(expr: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut buf = String::new();
    let mut chars = expr.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' => {
                flush(&mut buf, &mut toks);
                toks.push(Tok::Open);
            }
            ')' => {
                flush(&mut buf, &mut toks);
                toks.push(Tok::Close);
            }
            '|' => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                flush(&mut buf, &mut toks);
                toks.push(Tok::Or);
            }
            '&' => {
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                flush(&mut buf, &mut toks);
                toks.push(Tok::And);
            }
            ',' => {
                flush(&mut buf, &mut toks);
                toks.push(Tok::And);
            }
            _ => buf.push(c),
        }
    }
    flush(&mut buf, &mut toks);
    if toks.is_empty() {
        return Err(invalid(expr, "empty constraint expression"));
    }
    Ok(toks)
}

fn flush(buf: &mut String, toks: &mut Vec<Tok>) {
    let trimmed = buf.trim();
    if !trimmed.is_empty() {
        toks.push(Tok::Clause(trimmed.to_string()));
    }
    buf.clear();
}

struct Parser<'a> {
    expr: &'a str,
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn parse_expr(&mut self) -> Result<Node> {
        let first = self.parse_term()?;
        if !matches!(self.peek(), Some(Tok::Or)) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while matches!(self.peek(), Some(Tok::Or)) {
            self.pos += 1;
            terms.push(self.parse_term()?);
        }
        Ok(Node::AnyOf(terms))
    }

    fn parse_term(&mut self) -> Result<Node> {
        let first = self.parse_factor()?;
        if !matches!(self.peek(), Some(Tok::And)) {
            return Ok(first);
        }
        let mut factors = vec![first];
        while matches!(self.peek(), Some(Tok::And)) {
            self.pos += 1;
            factors.push(self.parse_factor()?);
        }
        Ok(Node::All(factors))
    }

    fn parse_factor(&mut self) -> Result<Node> {
        let clause = match self.toks.get(self.pos) {
            Some(Tok::Open) => None,
            Some(Tok::Clause(c)) => Some(c.clone()),
            _ => return Err(invalid(self.expr, "expected a comparator clause")),
        };
        self.pos += 1;
        if let Some(clause) = clause {
            return parse_clause(self.expr, &clause);
        }
        let node = self.parse_expr()?;
        if matches!(self.peek(), Some(Tok::Close)) {
            self.pos += 1;
            Ok(node)
        } else {
            Err(invalid(self.expr, "unbalanced parentheses"))
        }
    }
}

/// Parses one whitespace-separated run of comparators into an AND of
/// `VersionReq` evaluations. An operator split from its operand by spaces
/// (">= 1.0.0") is glued back together first.
fn parse_clause(expr: &str, clause: &str) -> Result<Node> {
    let mut parts = Vec::new();
    let mut pending_op: Option<String> = None;
    for piece in clause.split_whitespace() {
        let piece = match pending_op.take() {
            Some(op) => format!("{op}{piece}"),
            None => piece.to_string(),
        };
        if piece
            .chars()
            .all(|c| matches!(c, '=' | '>' | '<' | '~' | '^'))
        {
            pending_op = Some(piece);
            continue;
        }
        if piece == "*" {
            parts.push(Node::Any);
            continue;
        }
        let req = VersionReq::parse(&piece).map_err(|e| invalid(expr, e))?;
        parts.push(Node::Clause(req));
    }
    if pending_op.is_some() {
        return Err(invalid(expr, "dangling comparison operator"));
    }
    match parts.len() {
        0 => Err(invalid(expr, "empty comparator clause")),
        1 => Ok(parts.swap_remove(0)),
        _ => Ok(Node::All(parts)),
    }
}
