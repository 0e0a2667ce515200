//! In-memory policy store with a small condition evaluator.
//!
//! Supports the condition subset that policies over realtime tables use in
//! practice: `true`, `false`, `<column> = <literal>`, `<column> <> <literal>`,
//! `<column> IS [NOT] NULL`, parentheses, and `AND`/`OR` (AND binds tighter).
//! Anything else is an evaluation error, which callers treat as a denial.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{AuthContext, Policy, RlsError, RlsService};
use crate::realtime::events::Row;

#[derive(Default)]
struct TablePolicies {
    rls_enabled: bool,
    policies: Vec<Policy>,
}

/// Thread-safe per-table RLS flags and policies.
#[derive(Default)]
pub struct MemoryPolicyStore {
    tables: RwLock<HashMap<String, TablePolicies>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_rls(&self, table: &str) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .rls_enabled = true;
    }

    pub fn add_policy(&self, table: &str, policy: Policy) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .policies
            .push(policy);
    }
}

#[async_trait]
impl RlsService for MemoryPolicyStore {
    async fn is_rls_enabled(&self, table: &str) -> Result<bool, RlsError> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|t| t.rls_enabled)
            .unwrap_or(false))
    }

    async fn policies_for_table(&self, table: &str) -> Result<Vec<Policy>, RlsError> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|t| t.policies.clone())
            .unwrap_or_default())
    }

    fn substitute_auth_functions(&self, expr: &str, ctx: &AuthContext) -> String {
        substitute_auth_functions(expr, ctx)
    }

    async fn evaluate(&self, _table: &str, row: &Row, condition: &str) -> Result<bool, RlsError> {
        evaluate_condition(condition, row)
    }
}

// ---------------------------------------------------------------------------
// auth.* substitution
// ---------------------------------------------------------------------------

/// Replace `auth.uid()`, `auth.role()` and `auth.jwt() ->> '<claim>'` with
/// SQL literals for `ctx`.
///
/// One forward pass over `expr`: substituted literals are copied to the
/// output and never scanned again.
pub fn substitute_auth_functions(expr: &str, ctx: &AuthContext) -> String {
    let uid = ctx
        .user_id
        .as_deref()
        .map(quote_literal)
        .unwrap_or_else(|| "NULL".to_string());
    let role = quote_literal(&ctx.role);

    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;
    while let Some(pos) = rest.find("auth.") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("auth.uid()") {
            out.push_str(&uid);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("auth.role()") {
            out.push_str(&role);
            rest = after;
        } else if let Some((literal, after)) = tail
            .strip_prefix("auth.jwt()")
            .and_then(|call| jwt_claim(call, ctx))
        {
            out.push_str(&literal);
            rest = after;
        } else {
            out.push_str("auth.");
            rest = &tail["auth.".len()..];
        }
    }
    out.push_str(rest);
    out
}

/// Parse ` ->> '<claim>'` following `auth.jwt()`. Returns the claim's literal
/// and the remaining input.
fn jwt_claim<'a>(after_call: &'a str, ctx: &AuthContext) -> Option<(String, &'a str)> {
    let name_and_rest = after_call
        .trim_start()
        .strip_prefix("->>")?
        .trim_start()
        .strip_prefix('\'')?;
    let close = name_and_rest.find('\'')?;
    let literal = match ctx.claims.get(&name_and_rest[..close]) {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::String(s)) => quote_literal(s),
        Some(other) => quote_literal(&other.to_string()),
    };
    Some((literal, &name_and_rest[close + 1..]))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Eq,
    NotEq,
    LParen,
    RParen,
    And,
    Or,
    Is,
    Not,
    Null,
    True,
    False,
}

fn eval_error(condition: &str, reason: impl Into<String>) -> RlsError {
    RlsError::Evaluation {
        condition: condition.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(condition: &str) -> Result<Vec<Token>, RlsError> {
    let chars: Vec<char> = condition.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'>') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(eval_error(condition, "unterminated string")),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == '"')
                    .ok_or_else(|| eval_error(condition, "unterminated identifier"))?;
                tokens.push(Token::Ident(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| eval_error(condition, format!("bad number `{text}`")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "IS" => Token::Is,
                    "NOT" => Token::Not,
                    "NULL" => Token::Null,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => {
                return Err(eval_error(condition, format!("unexpected character `{other}`")));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    row: &'a Row,
    condition: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or_expr(&mut self) -> Result<bool, RlsError> {
        let mut value = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<bool, RlsError> {
        let mut value = self.atom()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.atom()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn atom(&mut self) -> Result<bool, RlsError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.or_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(eval_error(self.condition, "expected `)`")),
                }
            }
            Some(Token::True) => {
                self.pos += 1;
                Ok(true)
            }
            Some(Token::False) => {
                self.pos += 1;
                Ok(false)
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<bool, RlsError> {
        let lhs = self.operand()?;
        match self.advance() {
            Some(Token::Eq) => {
                let rhs = self.operand()?;
                Ok(sql_eq(&lhs, &rhs))
            }
            Some(Token::NotEq) => {
                let rhs = self.operand()?;
                Ok(!lhs.is_null() && !rhs.is_null() && !sql_eq(&lhs, &rhs))
            }
            Some(Token::Is) => {
                let negated = self.peek() == Some(&Token::Not);
                if negated {
                    self.pos += 1;
                }
                match self.advance() {
                    Some(Token::Null) => Ok(lhs.is_null() != negated),
                    _ => Err(eval_error(self.condition, "expected NULL after IS")),
                }
            }
            other => Err(eval_error(
                self.condition,
                format!("unsupported operator {other:?}"),
            )),
        }
    }

    fn operand(&mut self) -> Result<Value, RlsError> {
        match self.advance() {
            Some(Token::Ident(name)) => {
                let column = name.rsplit('.').next().unwrap_or(&name);
                Ok(self.row.get(column).cloned().unwrap_or(Value::Null))
            }
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Num(n)) => Ok(serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            other => Err(eval_error(
                self.condition,
                format!("expected operand, found {other:?}"),
            )),
        }
    }
}

/// SQL-style equality: NULL never equals anything, numbers compare
/// numerically, everything else by text.
fn sql_eq(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    as_text(a) == as_text(b)
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate `condition` against `row`.
pub fn evaluate_condition(condition: &str, row: &Row) -> Result<bool, RlsError> {
    let tokens = tokenize(condition)?;
    if tokens.is_empty() {
        return Err(eval_error(condition, "empty condition"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        row,
        condition,
    };
    let value = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(eval_error(condition, "trailing input"));
    }
    Ok(value)
}
