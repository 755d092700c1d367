//! Instance filter expressions.
//!
//! Batches select their members, constraints select the instances they
//! limit, and scriptlet rules select the instances they apply to, all with
//! the same small boolean language:
//!
//! ```text
//! os_type == "linux" and (name matches "web-*" or cpus >= 8)
//! not running or memory > 4GiB
//! ```
//!
//! Fields: `name`, `location`, `os`, `os_version`, `os_type`,
//! `architecture`, `source`, `description` (strings), `cpus`, `memory`
//! (integers, memory in bytes with optional `KiB`/`MiB`/`GiB`/`TiB`
//! suffix) and `running` (boolean, usable bare). Operators: `==`, `!=`,
//! `<`, `<=`, `>`, `>=`, `matches` (glob, `*` and `?`) and `contains`.
//! Combinators: `and`, `or`, `not` and parentheses.
//!
//! A blank expression matches nothing.

use migration_types::Instance;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Upper bound on expression text.
pub const MAX_EXPRESSION_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("expression longer than {MAX_EXPRESSION_LEN} bytes")]
    TooLong,

    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("operator '{op}' cannot be applied to {field}")]
    InvalidOperator { field: String, op: String },

    #[error("field {field} expects a {expected} value")]
    TypeMismatch { field: String, expected: &'static str },

    #[error("invalid pattern '{0}'")]
    InvalidPattern(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Location,
    Os,
    OsVersion,
    OsType,
    Architecture,
    Source,
    Description,
    Cpus,
    Memory,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Str,
    Int,
    Bool,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "name" => Field::Name,
            "location" => Field::Location,
            "os" => Field::Os,
            "os_version" => Field::OsVersion,
            "os_type" => Field::OsType,
            "architecture" => Field::Architecture,
            "source" => Field::Source,
            "description" => Field::Description,
            "cpus" => Field::Cpus,
            "memory" => Field::Memory,
            "running" => Field::Running,
            _ => return None,
        })
    }

    fn kind(self) -> Kind {
        match self {
            Field::Cpus | Field::Memory => Kind::Int,
            Field::Running => Kind::Bool,
            _ => Kind::Str,
        }
    }

    fn value(self, instance: &Instance) -> Value {
        let props = &instance.properties;
        match self {
            Field::Name => Value::Str(props.name.clone()),
            Field::Location => Value::Str(props.location.clone()),
            Field::Os => Value::Str(props.os.clone()),
            Field::OsVersion => Value::Str(props.os_version.clone()),
            Field::OsType => Value::Str(props.os_type.as_str().to_string()),
            Field::Architecture => Value::Str(props.architecture.clone()),
            Field::Source => Value::Str(instance.source.clone()),
            Field::Description => Value::Str(props.description.clone()),
            Field::Cpus => Value::Int(i64::from(instance.effective_cpus())),
            Field::Memory => {
                Value::Int(i64::try_from(instance.effective_memory_bytes()).unwrap_or(i64::MAX))
            }
            Field::Running => Value::Bool(props.running),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Name => "name",
            Field::Location => "location",
            Field::Os => "os",
            Field::OsVersion => "os_version",
            Field::OsType => "os_type",
            Field::Architecture => "architecture",
            Field::Source => "source",
            Field::Description => "description",
            Field::Cpus => "cpus",
            Field::Memory => "memory",
            Field::Running => "running",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Matches(Regex),
    Contains,
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub struct Expr {
    node: Node,
    text: String,
}

#[derive(Debug, Clone)]
enum Node {
    Const(bool),
    Or(Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Compare { field: Field, op: Op, value: Value },
}

impl Expr {
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        if text.len() > MAX_EXPRESSION_LEN {
            return Err(ExprError::TooLong);
        }

        let node = if text.trim().is_empty() {
            Node::Const(false)
        } else {
            let tokens = tokenize(text)?;
            let mut parser = Parser { tokens, pos: 0 };
            let node = parser.parse_or()?;
            if let Some(token) = parser.peek() {
                return Err(ExprError::UnexpectedToken(token.to_string()));
            }
            node
        };

        Ok(Self {
            node,
            text: text.to_string(),
        })
    }

    /// An expression matching every instance.
    pub fn always() -> Self {
        Self {
            node: Node::Const(true),
            text: "true".to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        eval(&self.node, instance)
    }
}

fn eval(node: &Node, instance: &Instance) -> bool {
    match node {
        Node::Const(value) => *value,
        Node::Or(lhs, rhs) => eval(lhs, instance) || eval(rhs, instance),
        Node::And(lhs, rhs) => eval(lhs, instance) && eval(rhs, instance),
        Node::Not(inner) => !eval(inner, instance),
        Node::Compare { field, op, value } => compare(&field.value(instance), op, value),
    }
}

fn compare(actual: &Value, op: &Op, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Str(a), Value::Str(b)) => match op {
            Op::Eq => a == b,
            Op::Ne => a != b,
            Op::Lt => a < b,
            Op::Le => a <= b,
            Op::Gt => a > b,
            Op::Ge => a >= b,
            Op::Matches(re) => re.is_match(a),
            Op::Contains => a.contains(b.as_str()),
        },
        (Value::Int(a), Value::Int(b)) => match op {
            Op::Eq => a == b,
            Op::Ne => a != b,
            Op::Lt => a < b,
            Op::Le => a <= b,
            Op::Gt => a > b,
            Op::Ge => a >= b,
            Op::Matches(_) | Op::Contains => false,
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            Op::Eq => a == b,
            Op::Ne => a != b,
            _ => false,
        },
        _ => false,
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex, ExprError> {
    let mut pattern = String::with_capacity(glob.len() + 2);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|_| ExprError::InvalidPattern(glob.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Op(&'static str),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => f.write_str(s),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Int(n) => write!(f, "{}", n),
            Token::Op(op) => f.write_str(op),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
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
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(ExprError::UnterminatedString);
                }
                tokens.push(Token::Str(value));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                chars.next();
                let next = chars.peek().map(|&(_, c)| c);
                let op = match (c, next) {
                    ('=', Some('=')) => "==",
                    ('!', Some('=')) => "!=",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('&', Some('&')) => "and",
                    ('|', Some('|')) => "or",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    ('!', _) => "not",
                    _ => return Err(ExprError::UnexpectedChar(c, offset)),
                };
                if op.len() == 2 || op == "and" || op == "or" {
                    chars.next();
                }
                tokens.push(Token::Op(op));
            }
            c if c.is_ascii_digit() => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Int(parse_number(&word)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match word.as_str() {
                    "and" => Token::Op("and"),
                    "or" => Token::Op("or"),
                    "not" => Token::Op("not"),
                    "matches" => Token::Op("matches"),
                    "contains" => Token::Op("contains"),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ExprError::UnexpectedChar(other, offset)),
        }
    }

    Ok(tokens)
}

fn parse_number(word: &str) -> Result<i64, ExprError> {
    let split = word
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(word.len());
    let (digits, suffix) = word.split_at(split);
    let multiplier: i64 = match suffix {
        "" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        _ => return Err(ExprError::InvalidNumber(word.to_string())),
    };
    digits
        .parse::<i64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ExprError::InvalidNumber(word.to_string()))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ExprError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_and()?;
        while self.eat_op("or") {
            node = Node::Or(Box::new(node), Box::new(self.parse_and()?));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_unary()?;
        while self.eat_op("and") {
            node = Node::And(Box::new(node), Box::new(self.parse_unary()?));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        if self.eat_op("not") {
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        match self.next()? {
            Token::LParen => {
                let node = self.parse_or()?;
                match self.next()? {
                    Token::RParen => Ok(node),
                    other => Err(ExprError::UnexpectedToken(other.to_string())),
                }
            }
            Token::Ident(word) if word == "true" => Ok(Node::Const(true)),
            Token::Ident(word) if word == "false" => Ok(Node::Const(false)),
            Token::Ident(word) => {
                let field = Field::parse(&word).ok_or(ExprError::UnknownField(word))?;
                self.parse_comparison(field)
            }
            other => Err(ExprError::UnexpectedToken(other.to_string())),
        }
    }

    fn parse_comparison(&mut self, field: Field) -> Result<Node, ExprError> {
        let op = match self.peek() {
            Some(Token::Op(op)) if !matches!(*op, "and" | "or" | "not") => *op,
            _ if field.kind() == Kind::Bool => {
                return Ok(Node::Compare {
                    field,
                    op: Op::Eq,
                    value: Value::Bool(true),
                })
            }
            Some(other) => return Err(ExprError::UnexpectedToken(other.to_string())),
            None => return Err(ExprError::UnexpectedEnd),
        };
        self.pos += 1;

        let value = match (field.kind(), self.next()?) {
            (Kind::Str, Token::Str(s)) => Value::Str(s),
            (Kind::Int, Token::Int(n)) => Value::Int(n),
            (Kind::Bool, Token::Ident(word)) if word == "true" || word == "false" => {
                Value::Bool(word == "true")
            }
            (kind, _) => {
                return Err(ExprError::TypeMismatch {
                    field: field.to_string(),
                    expected: match kind {
                        Kind::Str => "string",
                        Kind::Int => "integer",
                        Kind::Bool => "boolean",
                    },
                })
            }
        };

        let invalid = || ExprError::InvalidOperator {
            field: field.to_string(),
            op: op.to_string(),
        };
        let op = match op {
            "==" => Op::Eq,
            "!=" => Op::Ne,
            "<" | "<=" | ">" | ">=" if field.kind() == Kind::Bool => return Err(invalid()),
            "<" => Op::Lt,
            "<=" => Op::Le,
            ">" => Op::Gt,
            ">=" => Op::Ge,
            "matches" | "contains" if field.kind() != Kind::Str => return Err(invalid()),
            "matches" => match &value {
                Value::Str(glob) => Op::Matches(glob_to_regex(glob)?),
                _ => return Err(invalid()),
            },
            "contains" => Op::Contains,
            _ => return Err(invalid()),
        };

        Ok(Node::Compare { field, op, value })
    }
}
