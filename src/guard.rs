//! Guard descriptors and the expression language.
//!
//! Transition conditions, assign values, and log messages share one small
//! expression language evaluated against the extended context and the
//! current event:
//!
//! - `ctx.field` / `ctx.field.nested` - context field access
//! - `event.field` - event payload access (`event.type` is the event type)
//! - `expr == expr`, `!=`, `>`, `>=`, `<`, `<=` - comparisons
//! - `expr + expr`, `-`, `*`, `/` - numeric arithmetic
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping
//! - literals: numbers, `"strings"`, `true`, `false`, `null`
//!
//! Guard positions apply truthiness to the result: `null`, `false`, `0`,
//! `""`, and empty collections are falsy. Examples:
//!
//! - `ctx.isAdmin` - true if the flag is truthy
//! - `ctx.count == 3` - numeric equality
//! - `ctx.retries < ctx.limit && !ctx.aborted` - compound condition
//! - `ctx.count + 1` - an assign value expression
//!
//! A condition string with no `ctx.` or `event.` reference is not an
//! expression at all: it names a guard in the options registry, resolved at
//! evaluation time.

use crate::error::MachineError;
use crate::event::Event;
use serde_json::Value;

/// A transition guard: an inline expression or a named registry entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Inline expression, evaluated with truthiness.
    Expr(Expr),
    /// Named guard resolved from the options registry.
    Named(String),
}

impl Guard {
    /// Classifies and parses a condition string.
    pub fn from_cond(cond: &str) -> Result<Self, MachineError> {
        if cond.contains("ctx.") || cond.contains("event.") {
            Ok(Guard::Expr(Expr::parse(cond)?))
        } else {
            Ok(Guard::Named(cond.trim().to_string()))
        }
    }
}

/// Variable scope of a field reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The extended context.
    Ctx,
    /// The current event.
    Event,
}

/// Binary operators, in the language's precedence groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Add,
    Sub,
    Mul,
    Div,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Lit(Value),
    /// A field access such as `ctx.order.paid` or `event.amount`.
    Field(Scope, String),
    /// Logical negation.
    Not(Box<Expr>),
    /// A binary operation.
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, MachineError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MachineError::InvalidExpression {
                reason: "empty expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos != parser.input.len() {
            return Err(MachineError::InvalidExpression {
                reason: format!("unexpected trailing input at '{}'", &parser.input[parser.pos..]),
            });
        }
        Ok(expr)
    }

    /// Evaluates the expression against a context and event.
    pub fn evaluate(&self, ctx: &Value, event: &Event) -> Value {
        match self {
            Expr::Lit(value) => value.clone(),
            Expr::Field(Scope::Ctx, field) => get_field(ctx, field),
            Expr::Field(Scope::Event, field) => {
                if field == "type" {
                    Value::String(event.event_type.clone())
                } else {
                    get_field(&event.data, field)
                }
            }
            Expr::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(ctx, event))),
            Expr::Binary(op, lhs, rhs) => {
                let op = *op;
                // Short-circuit the logical operators.
                if op == BinOp::And {
                    let left = lhs.evaluate(ctx, event);
                    if !is_truthy(&left) {
                        return Value::Bool(false);
                    }
                    return Value::Bool(is_truthy(&rhs.evaluate(ctx, event)));
                }
                if op == BinOp::Or {
                    let left = lhs.evaluate(ctx, event);
                    if is_truthy(&left) {
                        return Value::Bool(true);
                    }
                    return Value::Bool(is_truthy(&rhs.evaluate(ctx, event)));
                }

                let left = lhs.evaluate(ctx, event);
                let right = rhs.evaluate(ctx, event);
                match op {
                    BinOp::Eq => Value::Bool(values_equal(&left, &right)),
                    BinOp::Ne => Value::Bool(!values_equal(&left, &right)),
                    BinOp::Gt => compare(&left, &right, |a, b| a > b),
                    BinOp::Ge => compare(&left, &right, |a, b| a >= b),
                    BinOp::Lt => compare(&left, &right, |a, b| a < b),
                    BinOp::Le => compare(&left, &right, |a, b| a <= b),
                    BinOp::Add => arithmetic(&left, &right, |a, b| a + b),
                    BinOp::Sub => arithmetic(&left, &right, |a, b| a - b),
                    BinOp::Mul => arithmetic(&left, &right, |a, b| a * b),
                    BinOp::Div => arithmetic(&left, &right, |a, b| a / b),
                    BinOp::And | BinOp::Or => unreachable!(),
                }
            }
        }
    }

    /// Evaluates with truthiness, as guard positions do.
    pub fn check(&self, ctx: &Value, event: &Event) -> bool {
        is_truthy(&self.evaluate(ctx, event))
    }
}

fn get_field(root: &Value, field: &str) -> Value {
    let mut current = root;
    for part in field.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }
    current.clone()
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn compare(a: &Value, b: &Value, op: impl Fn(f64, f64) -> bool) -> Value {
    match as_f64(a).zip(as_f64(b)) {
        Some((a, b)) => Value::Bool(op(a, b)),
        None => Value::Bool(false),
    }
}

fn arithmetic(a: &Value, b: &Value, op: impl Fn(f64, f64) -> f64) -> Value {
    match as_f64(a).zip(as_f64(b)) {
        Some((a, b)) => number(op(a, b)),
        None => Value::Null,
    }
}

/// Converts an f64 result back to a JSON number, preferring integers.
fn number(v: f64) -> Value {
    if !v.is_finite() {
        return Value::Null;
    }
    if v.fract() == 0.0 && v.abs() < (1i64 << 53) as f64 {
        Value::Number(serde_json::Number::from(v as i64))
    } else {
        serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Recursive descent parser.
///
/// Precedence, loosest first: `||`, `&&`, comparisons, `+ -`, `* /`, unary.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, MachineError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, MachineError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, MachineError> {
        let mut left = self.parse_comparison()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, MachineError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            BinOp::Eq
        } else if self.peek_str("!=") {
            BinOp::Ne
        } else if self.peek_str(">=") {
            BinOp::Ge
        } else if self.peek_str("<=") {
            BinOp::Le
        } else if self.peek_char() == Some('>') {
            BinOp::Gt
        } else if self.peek_char() == Some('<') {
            BinOp::Lt
        } else {
            return Ok(left);
        };

        self.pos += match op {
            BinOp::Gt | BinOp::Lt => 1,
            _ => 2,
        };
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, MachineError> {
        let mut left = self.parse_multiplicative()?;
        self.skip_whitespace();

        loop {
            let op = match self.peek_char() {
                Some('+') => BinOp::Add,
                // A '-' here is a binary operator; unary minus is consumed
                // by the number literal parser.
                Some('-') => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, MachineError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        loop {
            let op = match self.peek_char() {
                Some('*') => BinOp::Mul,
                Some('/') => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, MachineError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            // Recursive to allow !!ctx.a
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, MachineError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(MachineError::InvalidExpression {
                    reason: "expected ')'".to_string(),
                });
            }
            self.pos += 1;
            return Ok(expr);
        }

        if self.peek_str("ctx.") {
            self.pos += 4;
            let field = self.parse_field()?;
            return Ok(Expr::Field(Scope::Ctx, field));
        }

        if self.peek_str("event.") {
            self.pos += 6;
            let field = self.parse_field()?;
            return Ok(Expr::Field(Scope::Event, field));
        }

        if self.peek_str("true") {
            self.pos += 4;
            return Ok(Expr::Lit(Value::Bool(true)));
        }
        if self.peek_str("false") {
            self.pos += 5;
            return Ok(Expr::Lit(Value::Bool(false)));
        }
        if self.peek_str("null") {
            self.pos += 4;
            return Ok(Expr::Lit(Value::Null));
        }

        if self.peek_char() == Some('"') {
            return self.parse_string();
        }

        self.parse_number()
    }

    fn parse_field(&mut self) -> Result<String, MachineError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }

        let field = &self.input[start..self.pos];
        if field.is_empty() {
            return Err(MachineError::InvalidExpression {
                reason: "empty field name".to_string(),
            });
        }

        Ok(field.to_string())
    }

    fn parse_string(&mut self) -> Result<Expr, MachineError> {
        // Opening quote already seen.
        self.pos += 1;

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '"' {
                let s = &self.input[start..self.pos];
                self.pos += 1;
                return Ok(Expr::Lit(Value::String(s.to_string())));
            }
            if c == '\\' {
                self.pos += 2;
            } else {
                self.pos += c.len_utf8();
            }
        }

        Err(MachineError::InvalidExpression {
            reason: "unterminated string".to_string(),
        })
    }

    fn parse_number(&mut self) -> Result<Expr, MachineError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }

        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        let parsed = num_str
            .parse::<f64>()
            .map_err(|_| MachineError::InvalidExpression {
                reason: format!("invalid number: '{num_str}'"),
            })?;
        Ok(Expr::Lit(number(parsed)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str, ctx: Value) -> Value {
        Expr::parse(src).unwrap().evaluate(&ctx, &Event::null())
    }

    fn check(src: &str, ctx: Value) -> bool {
        Expr::parse(src).unwrap().check(&ctx, &Event::null())
    }

    #[test]
    fn test_truthy_check() {
        assert!(check("ctx.enabled", json!({"enabled": true})));
        assert!(!check("ctx.enabled", json!({"enabled": false})));
        assert!(!check("ctx.enabled", json!({"enabled": null})));
        assert!(!check("ctx.enabled", json!({})));
    }

    #[test]
    fn test_equality() {
        assert!(check("ctx.status == \"active\"", json!({"status": "active"})));
        assert!(!check("ctx.status == \"active\"", json!({"status": "inactive"})));
        assert!(check("ctx.count == 42", json!({"count": 42})));
        assert!(check("ctx.flag == false", json!({"flag": false})));
        assert!(check("ctx.value == null", json!({"value": null})));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(check("ctx.amount > 100", json!({"amount": 150})));
        assert!(!check("ctx.amount > 100", json!({"amount": 100})));
        assert!(check("ctx.amount >= 100", json!({"amount": 100})));
        assert!(check("ctx.count < 10", json!({"count": 5})));
        assert!(check("ctx.count <= 10", json!({"count": 10})));
        assert!(check("ctx.temp > -10", json!({"temp": 0})));
    }

    #[test]
    fn test_logical_operators() {
        assert!(check("ctx.a && ctx.b", json!({"a": true, "b": true})));
        assert!(!check("ctx.a && ctx.b", json!({"a": true, "b": false})));
        assert!(check("ctx.a || ctx.b", json!({"a": false, "b": true})));
        assert!(check("!ctx.disabled", json!({"disabled": false})));
        assert!(check("!!ctx.a", json!({"a": true})));
    }

    #[test]
    fn test_precedence_and_grouping() {
        // && binds tighter than ||
        assert!(check(
            "ctx.a && ctx.b || ctx.c",
            json!({"a": false, "b": false, "c": true})
        ));
        assert!(!check(
            "(ctx.a || ctx.b) && ctx.c",
            json!({"a": true, "b": true, "c": false})
        ));
        assert!(check(
            "!(ctx.a && ctx.b)",
            json!({"a": true, "b": false})
        ));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("ctx.count + 1", json!({"count": 3})), json!(4));
        assert_eq!(eval("ctx.count - 1", json!({"count": 3})), json!(2));
        assert_eq!(eval("ctx.n * 2 + 1", json!({"n": 10})), json!(21));
        assert_eq!(eval("ctx.n / 4", json!({"n": 10})), json!(2.5));
        assert_eq!(eval("ctx.missing + 1", json!({})), Value::Null);
        assert_eq!(eval("ctx.n / 0", json!({"n": 1})), Value::Null);
    }

    #[test]
    fn test_arithmetic_in_comparison() {
        assert!(check("ctx.count + 1 > 3", json!({"count": 3})));
        assert!(!check("ctx.count + 1 > 3", json!({"count": 2})));
    }

    #[test]
    fn test_nested_field() {
        assert!(check("ctx.order.customer.verified", json!({"order": {"customer": {"verified": true}}})));
        assert!(!check("ctx.order.customer.verified", json!({"order": {}})));
    }

    #[test]
    fn test_event_scope() {
        let expr = Expr::parse("event.amount > 100").unwrap();
        let event = Event::with_data("PAY", json!({"amount": 150}));
        assert!(expr.check(&json!({}), &event));

        let expr = Expr::parse("event.type == \"PAY\"").unwrap();
        assert!(expr.check(&json!({}), &event));
    }

    #[test]
    fn test_truthiness_table() {
        for falsy in [json!(null), json!(false), json!(0), json!(""), json!([]), json!({})] {
            assert!(!check("ctx.v", json!({ "v": falsy })));
        }
        for truthy in [json!(true), json!(1), json!("x"), json!([1]), json!({"k": 1})] {
            assert!(check("ctx.v", json!({ "v": truthy })));
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("   ").is_err());
        assert!(Expr::parse("(ctx.a && ctx.b").is_err());
        assert!(Expr::parse("ctx.name == \"unclosed").is_err());
        assert!(Expr::parse("ctx.value > abc").is_err());
        assert!(Expr::parse("ctx.a ctx.b").is_err());
    }

    #[test]
    fn test_guard_classification() {
        assert!(matches!(
            Guard::from_cond("ctx.isAdmin").unwrap(),
            Guard::Expr(_)
        ));
        assert!(matches!(
            Guard::from_cond("event.amount > 0").unwrap(),
            Guard::Expr(_)
        ));
        assert_eq!(
            Guard::from_cond("isAdmin").unwrap(),
            Guard::Named("isAdmin".to_string())
        );
    }
}
