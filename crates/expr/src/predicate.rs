use serde_json::Value;

/// Errors raised while parsing or evaluating a predicate. Evaluation
/// errors (unknown variable, incompatible comparison) drop the message
/// under the engine's processing-error policy; parse errors are
/// configuration errors and surface before a route starts.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PredicateError {
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string literal at offset {0}")]
    UnterminatedString(usize),

    #[error("unterminated '{{{{' placeholder at offset {0}")]
    UnterminatedVar(usize),

    #[error("invalid number '{0}'")]
    BadNumber(String),

    #[error("bare word '{0}'; variables are written {{{{{0}}}}}")]
    BareWord(String),

    #[error("expected {0}, found {1}")]
    Expected(&'static str, String),

    #[error("unexpected trailing input: {0}")]
    TrailingInput(String),

    #[error("variable '{0}' is not set")]
    UnknownVariable(String),

    #[error("cannot compare {0} with {1}")]
    Incomparable(&'static str, &'static str),

    #[error("'{0}' is not ordered; only numbers and strings support < <= > >=")]
    Unordered(&'static str),

    #[error("'{0}' expects boolean operands, found {1}")]
    NotBoolean(&'static str, &'static str),

    #[error("'in' expects an array or string on the right, found {0}")]
    BadContainer(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

/// A parsed boolean predicate over a message record.
///
/// Grammar, smallest-binding first:
/// ```text
/// expr := and ("or" and)*
/// and  := not ("and" not)*
/// not  := "not" not | cmp
/// cmp  := term (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") term)?
/// term := number | string | true | false | "{{" name "}}" | "(" expr ")"
/// ```
/// Predicates are parsed once at route start and evaluated per message.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    root: Expr,
}

impl Predicate {
    pub fn parse(input: &str) -> Result<Self, PredicateError> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(PredicateError::TrailingInput(format!("{tok:?}")));
        }
        Ok(Self { root })
    }

    pub fn eval<F>(&self, lookup: F) -> Result<bool, PredicateError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        match eval_expr(&self.root, &lookup)? {
            Value::Bool(b) => Ok(b),
            other => Err(PredicateError::NotBoolean("predicate", type_name(&other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Bool(bool),
    Var(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn lex(input: &str) -> Result<Vec<Token>, PredicateError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '{' if bytes.get(i + 1) == Some(&b'{') => {
                let rest = &input[i + 2..];
                let end = rest
                    .find("}}")
                    .ok_or(PredicateError::UnterminatedVar(i))?;
                tokens.push(Token::Var(rest[..end].trim().to_string()));
                i += 2 + end + 2;
            }
            '\'' | '"' => {
                let rest = &input[i + 1..];
                let end = rest
                    .find(c)
                    .ok_or(PredicateError::UnterminatedString(i))?;
                tokens.push(Token::Str(rest[..end].to_string()));
                i += 1 + end + 1;
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < bytes.len() && matches!(bytes[i] as char, '0'..='9' | '.' | 'e' | 'E') {
                    i += 1;
                }
                let text = &input[start..i];
                let n: f64 = text
                    .parse()
                    .map_err(|_| PredicateError::BadNumber(text.to_string()))?;
                tokens.push(Token::Num(n));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && matches!(bytes[i] as char, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_')
                {
                    i += 1;
                }
                match &input[start..i] {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "in" => tokens.push(Token::Op(CmpOp::In)),
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    word => return Err(PredicateError::BareWord(word.to_string())),
                }
            }
            other => return Err(PredicateError::UnexpectedChar(other, i)),
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
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expr(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, PredicateError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> Result<Expr, PredicateError> {
        let lhs = self.term()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.next();
            let rhs = self.term()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, PredicateError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Var(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(PredicateError::Expected("')'", format!("{other:?}"))),
                }
            }
            other => Err(PredicateError::Expected(
                "a literal, variable, or '('",
                format!("{other:?}"),
            )),
        }
    }
}

fn number_value(n: f64) -> Value {
    // Keep integral literals as integers so equality against message
    // integers does not depend on float formatting.
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn eval_expr<F>(expr: &Expr, lookup: &F) -> Result<Value, PredicateError>
where
    F: Fn(&str) -> Option<Value>,
{
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => {
            lookup(name).ok_or_else(|| PredicateError::UnknownVariable(name.clone()))
        }
        Expr::Not(inner) => match eval_expr(inner, lookup)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(PredicateError::NotBoolean("not", type_name(&other))),
        },
        Expr::And(l, r) => {
            // Short-circuit: the right side is not evaluated when the left
            // already decides the outcome.
            match eval_expr(l, lookup)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => match eval_expr(r, lookup)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(PredicateError::NotBoolean("and", type_name(&other))),
                },
                other => Err(PredicateError::NotBoolean("and", type_name(&other))),
            }
        }
        Expr::Or(l, r) => match eval_expr(l, lookup)? {
            Value::Bool(true) => Ok(Value::Bool(true)),
            Value::Bool(false) => match eval_expr(r, lookup)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(PredicateError::NotBoolean("or", type_name(&other))),
            },
            other => Err(PredicateError::NotBoolean("or", type_name(&other))),
        },
        Expr::Cmp(op, l, r) => {
            let l = eval_expr(l, lookup)?;
            let r = eval_expr(r, lookup)?;
            eval_cmp(*op, &l, &r).map(Value::Bool)
        }
    }
}

fn eval_cmp(op: CmpOp, l: &Value, r: &Value) -> Result<bool, PredicateError> {
    match op {
        CmpOp::Eq => strict_eq(l, r),
        CmpOp::Ne => strict_eq(l, r).map(|eq| !eq),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ord = ordering(l, r)?;
            Ok(match op {
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::Le => ord != std::cmp::Ordering::Greater,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                CmpOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            })
        }
        CmpOp::In => match r {
            Value::Array(items) => Ok(items.iter().any(|item| loose_eq(l, item))),
            Value::String(haystack) => match l {
                Value::String(needle) => Ok(haystack.contains(needle.as_str())),
                other => Err(PredicateError::Incomparable(type_name(other), "string")),
            },
            other => Err(PredicateError::BadContainer(type_name(other))),
        },
    }
}

/// Equality requires operands of the same kind; numbers compare across
/// integer and float representations.
fn strict_eq(l: &Value, r: &Value) -> Result<bool, PredicateError> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => Ok(loose_eq(l, r)),
        (Value::String(a), Value::String(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::Null, Value::Null) => Ok(true),
        (Value::Array(a), Value::Array(b)) => Ok(a == b),
        (Value::Object(a), Value::Object(b)) => Ok(a == b),
        (l, r) => Err(PredicateError::Incomparable(type_name(l), type_name(r))),
    }
}

/// Membership equality: as `strict_eq`, but a kind mismatch is simply
/// "not this element" rather than an error, so heterogeneous arrays work.
fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (l, r) => l == r,
    }
}

fn ordering(l: &Value, r: &Value) -> Result<std::cmp::Ordering, PredicateError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or(PredicateError::Unordered("number")),
                _ => Err(PredicateError::Unordered("number")),
            }
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Number(_) | Value::String(_), other) | (other, _) => {
            Err(PredicateError::Unordered(type_name(other)))
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn eval(predicate: &str, record: Value) -> Result<bool, PredicateError> {
        let parsed = Predicate::parse(predicate)?;
        parsed.eval(|name| record.get(name).cloned())
    }

    #[test]
    fn test_comparisons() {
        let record = json!({"v": 15, "label": "person", "ok": true});

        for (predicate, expect) in [
            ("{{v}} > 10", true),
            ("{{v}} >= 15", true),
            ("{{v}} < 15", false),
            ("{{v}} <= 15", true),
            ("{{v}} == 15", true),
            ("{{v}} != 15", false),
            ("{{v}} == 15.0", true),
            ("{{label}} == 'person'", true),
            ("{{label}} != \"car\"", true),
            ("{{ok}} == true", true),
        ] {
            assert_eq!(eval(predicate, record.clone()), Ok(expect), "{predicate}");
        }
    }

    #[test]
    fn test_boolean_connectives_and_precedence() {
        let record = json!({"v": 15, "label": "person"});

        // 'and' binds tighter than 'or'.
        assert_eq!(
            eval("{{v}} > 100 or {{v}} > 10 and {{label}} == 'person'", record.clone()),
            Ok(true),
        );
        assert_eq!(
            eval("({{v}} > 100 or {{v}} > 10) and {{label}} == 'car'", record.clone()),
            Ok(false),
        );
        assert_eq!(eval("not {{v}} > 10", record.clone()), Ok(false));
        assert_eq!(eval("not ({{v}} > 10 and false)", record), Ok(true));
    }

    #[test]
    fn test_in_operator() {
        let record = json!({"label": "person", "tags": ["a", "b"], "n": 5});

        assert_eq!(
            eval("{{label}} in 'person of interest'", record.clone()),
            Ok(true)
        );
        assert_eq!(eval("'c' in {{tags}}", record.clone()), Ok(false));
        assert_eq!(eval("'a' in {{tags}}", record.clone()), Ok(true));
        // Numeric membership coerces across representations, and
        // heterogeneous arrays are fine.
        let mixed = json!({"n": 5, "set": ["x", 5.0]});
        assert_eq!(eval("{{n}} in {{set}}", mixed), Ok(true));
        // A scalar container is an error.
        assert_eq!(
            eval("'a' in {{n}}", record),
            Err(PredicateError::BadContainer("number")),
        );
    }

    #[test]
    fn test_evaluation_errors() {
        let record = json!({"v": 15, "label": "person"});

        assert_eq!(
            eval("{{missing}} > 1", record.clone()),
            Err(PredicateError::UnknownVariable("missing".to_string())),
        );
        assert_eq!(
            eval("{{label}} > 1", record.clone()),
            Err(PredicateError::Unordered("number")),
        );
        assert_eq!(
            eval("{{label}} == 1", record.clone()),
            Err(PredicateError::Incomparable("string", "number")),
        );
        assert_eq!(
            eval("{{v}} and true", record),
            Err(PredicateError::NotBoolean("and", "number")),
        );
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        let record = json!({"v": 15});
        // The right side would fail with an unknown variable, but the left
        // side already decides.
        assert_eq!(eval("{{v}} > 10 or {{missing}} > 1", record.clone()), Ok(true));
        assert_eq!(eval("{{v}} > 100 and {{missing}} > 1", record), Ok(false));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Predicate::parse("{{v}} >"),
            Err(PredicateError::Expected(..)),
        ));
        assert!(matches!(
            Predicate::parse("{{v"),
            Err(PredicateError::UnterminatedVar(0)),
        ));
        assert!(matches!(
            Predicate::parse("'open"),
            Err(PredicateError::UnterminatedString(0)),
        ));
        assert_eq!(
            Predicate::parse("v > 1"),
            Err(PredicateError::BareWord("v".to_string())),
        );
        assert!(matches!(
            Predicate::parse("{{a}} == 1 extra"),
            Err(PredicateError::BareWord(_)),
        ));
        assert!(matches!(
            Predicate::parse("({{a}} == 1"),
            Err(PredicateError::Expected(..)),
        ));
    }

    #[test]
    fn test_bool_literal_predicate() {
        assert_eq!(eval("true", json!({})), Ok(true));
        assert_eq!(eval("false or true", json!({})), Ok(true));
    }

    // Parsing is total over arbitrary input: it returns Ok or Err but
    // never panics, and a parsed predicate re-parses identically.
    #[quickcheck_macros::quickcheck]
    fn prop_parse_never_panics(input: String) -> bool {
        let _ = Predicate::parse(&input);
        true
    }
}
