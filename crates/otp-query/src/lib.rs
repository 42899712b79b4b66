//! JMESPath-style projection expressions over `serde_json::Value`.
//!
//! Supported grammar: identity (`@`), field access (`a.b`, `"quoted key"`),
//! indexes and slices (`a[0]`, `a[-1]`, `a[1:5:2]`), list and object wildcards
//! (`a[*].b`, `*.b`), flatten (`a[]`), filters (`a[?b == 'x']`), comparisons,
//! `&&`/`||`/`!`, multi-select lists and hashes, raw strings, JSON literals
//! and pipes. Function calls are not supported.
//!
//! Compiling an expression is the only fallible step; evaluation never fails
//! and yields `null` when nothing matches.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "otp-query";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("invalid expression at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
}

impl QueryError {
    fn syntax(offset: usize, message: impl Into<String>) -> Self {
        QueryError::Syntax {
            offset,
            message: message.into(),
        }
    }
}

/// Compile `expression` and apply it to `doc`.
pub fn project(doc: &JsonValue, expression: &str) -> Result<JsonValue, QueryError> {
    Ok(Expression::compile(expression)?.search(doc))
}

/// A compiled projection expression. Cheap to clone and reuse across polls.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Ast,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self, QueryError> {
        let tokens = Tokenizer::tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.expr(0)?;
        let trailing = parser.peek();
        if trailing.kind != TokenKind::Eof {
            return Err(QueryError::syntax(
                trailing.offset,
                format!("unexpected token {}", trailing.kind),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    /// The identity expression, selecting the whole document.
    pub fn identity() -> Self {
        Self {
            source: "@".to_string(),
            ast: Ast::Identity,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn search(&self, doc: &JsonValue) -> JsonValue {
        eval(&self.ast, doc)
    }
}

impl FromStr for Expression {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::compile(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Identifier(String),
    QuotedIdentifier(String),
    RawString(String),
    Literal(JsonValue),
    Number(i64),
    Dot,
    Star,
    Flatten,
    Filter,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Colon,
    Pipe,
    Or,
    And,
    Not,
    Cmp(Comparator),
    At,
    Eof,
}

impl TokenKind {
    /// Left binding power for the Pratt parser.
    fn lbp(&self) -> u8 {
        match self {
            TokenKind::Pipe => 1,
            TokenKind::Or => 2,
            TokenKind::And => 3,
            TokenKind::Cmp(_) => 5,
            TokenKind::Flatten => 9,
            TokenKind::Star => 20,
            TokenKind::Filter => 21,
            TokenKind::Dot => 40,
            TokenKind::Not => 45,
            TokenKind::LBrace => 50,
            TokenKind::LBracket => 55,
            TokenKind::LParen => 60,
            _ => 0,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Identifier(name) => write!(f, "identifier '{name}'"),
            TokenKind::QuotedIdentifier(name) => write!(f, "quoted identifier \"{name}\""),
            TokenKind::RawString(s) => write!(f, "raw string '{s}'"),
            TokenKind::Literal(v) => write!(f, "literal `{v}`"),
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Dot => f.write_str("'.'"),
            TokenKind::Star => f.write_str("'*'"),
            TokenKind::Flatten => f.write_str("'[]'"),
            TokenKind::Filter => f.write_str("'[?'"),
            TokenKind::LBracket => f.write_str("'['"),
            TokenKind::RBracket => f.write_str("']'"),
            TokenKind::LBrace => f.write_str("'{'"),
            TokenKind::RBrace => f.write_str("'}'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Comma => f.write_str("','"),
            TokenKind::Colon => f.write_str("':'"),
            TokenKind::Pipe => f.write_str("'|'"),
            TokenKind::Or => f.write_str("'||'"),
            TokenKind::And => f.write_str("'&&'"),
            TokenKind::Not => f.write_str("'!'"),
            TokenKind::Cmp(op) => write!(f, "'{op}'"),
            TokenKind::At => f.write_str("'@'"),
            TokenKind::Eof => f.write_str("end of expression"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

struct Tokenizer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Tokenizer<'a> {
    fn tokenize(input: &'a str) -> Result<Vec<Token>, QueryError> {
        let mut tokenizer = Tokenizer {
            input,
            chars: input.char_indices().peekable(),
        };
        let mut tokens = Vec::new();
        loop {
            let token = tokenizer.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, QueryError> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some((offset, c)) = self.chars.next() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                offset: self.input.len(),
            });
        };

        let kind = match c {
            '.' => TokenKind::Dot,
            '*' => TokenKind::Star,
            '@' => TokenKind::At,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => {
                if self.chars.next_if(|(_, c)| *c == ']').is_some() {
                    TokenKind::Flatten
                } else if self.chars.next_if(|(_, c)| *c == '?').is_some() {
                    TokenKind::Filter
                } else {
                    TokenKind::LBracket
                }
            }
            '|' => {
                if self.chars.next_if(|(_, c)| *c == '|').is_some() {
                    TokenKind::Or
                } else {
                    TokenKind::Pipe
                }
            }
            '&' => {
                if self.chars.next_if(|(_, c)| *c == '&').is_some() {
                    TokenKind::And
                } else {
                    return Err(QueryError::syntax(offset, "expression references are not supported"));
                }
            }
            '!' => {
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    TokenKind::Cmp(Comparator::Ne)
                } else {
                    TokenKind::Not
                }
            }
            '=' => {
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    TokenKind::Cmp(Comparator::Eq)
                } else {
                    return Err(QueryError::syntax(offset, "expected '==' after '='"));
                }
            }
            '<' => {
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    TokenKind::Cmp(Comparator::Le)
                } else {
                    TokenKind::Cmp(Comparator::Lt)
                }
            }
            '>' => {
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    TokenKind::Cmp(Comparator::Ge)
                } else {
                    TokenKind::Cmp(Comparator::Gt)
                }
            }
            '"' => {
                let end = self.consume_delimited(offset, '"')?;
                let raw = &self.input[offset..end];
                let name: String = serde_json::from_str(raw).map_err(|err| {
                    QueryError::syntax(offset, format!("invalid quoted identifier: {err}"))
                })?;
                TokenKind::QuotedIdentifier(name)
            }
            '\'' => {
                let end = self.consume_delimited(offset, '\'')?;
                let inner = &self.input[offset + 1..end - 1];
                TokenKind::RawString(inner.replace("\\'", "'"))
            }
            '`' => {
                let end = self.consume_delimited(offset, '`')?;
                let inner = self.input[offset + 1..end - 1].replace("\\`", "`");
                let value = serde_json::from_str(inner.trim()).map_err(|err| {
                    QueryError::syntax(offset, format!("invalid JSON literal: {err}"))
                })?;
                TokenKind::Literal(value)
            }
            '-' | '0'..='9' => {
                let mut end = offset + c.len_utf8();
                while let Some((idx, d)) = self.chars.next_if(|(_, d)| d.is_ascii_digit()) {
                    end = idx + d.len_utf8();
                }
                let text = &self.input[offset..end];
                let number = text
                    .parse::<i64>()
                    .map_err(|_| QueryError::syntax(offset, format!("invalid number '{text}'")))?;
                TokenKind::Number(number)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = offset + c.len_utf8();
                while let Some((idx, d)) = self
                    .chars
                    .next_if(|(_, d)| d.is_ascii_alphanumeric() || *d == '_')
                {
                    end = idx + d.len_utf8();
                }
                TokenKind::Identifier(self.input[offset..end].to_string())
            }
            other => {
                return Err(QueryError::syntax(offset, format!("unexpected character '{other}'")));
            }
        };

        Ok(Token { kind, offset })
    }

    /// Consume up to and including the closing `delim`, honoring backslash
    /// escapes. Returns the byte offset just past the closing delimiter.
    fn consume_delimited(&mut self, start: usize, delim: char) -> Result<usize, QueryError> {
        let mut escaped = false;
        for (idx, c) in self.chars.by_ref() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == delim {
                return Ok(idx + c.len_utf8());
            }
        }
        Err(QueryError::syntax(start, format!("unterminated {delim}-delimited token")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Identity,
    Field(String),
    Index(i64),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: i64,
    },
    Literal(JsonValue),
    Subexpr(Box<Ast>, Box<Ast>),
    /// Evaluate the right side against every element of the left-side array.
    ListProjection(Box<Ast>, Box<Ast>),
    /// Evaluate the right side against every value of the left-side object.
    ObjectProjection(Box<Ast>, Box<Ast>),
    Flatten(Box<Ast>),
    Filter {
        lhs: Box<Ast>,
        cond: Box<Ast>,
        rhs: Box<Ast>,
    },
    MultiList(Vec<Ast>),
    MultiHash(Vec<(String, Ast)>),
    Compare(Comparator, Box<Ast>, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    Pipe(Box<Ast>, Box<Ast>),
}

/// Projections stop absorbing tokens whose binding power is below this.
const PROJECTION_STOP: u8 = 10;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), QueryError> {
        let token = self.advance();
        if token.kind == kind {
            Ok(())
        } else {
            Err(QueryError::syntax(
                token.offset,
                format!("expected {kind}, found {}", token.kind),
            ))
        }
    }

    fn expr(&mut self, rbp: u8) -> Result<Ast, QueryError> {
        let token = self.advance();
        let mut left = self.nud(token)?;
        while rbp < self.peek().kind.lbp() {
            let token = self.advance();
            left = self.led(token, left)?;
        }
        Ok(left)
    }

    fn nud(&mut self, token: Token) -> Result<Ast, QueryError> {
        match token.kind {
            TokenKind::At => Ok(Ast::Identity),
            TokenKind::Identifier(name) | TokenKind::QuotedIdentifier(name) => Ok(Ast::Field(name)),
            TokenKind::RawString(s) => Ok(Ast::Literal(JsonValue::String(s))),
            TokenKind::Literal(value) => Ok(Ast::Literal(value)),
            TokenKind::Star => {
                let rhs = self.projection_rhs(TokenKind::Star.lbp())?;
                Ok(Ast::ObjectProjection(Box::new(Ast::Identity), Box::new(rhs)))
            }
            TokenKind::Flatten => {
                let rhs = self.projection_rhs(TokenKind::Flatten.lbp())?;
                Ok(Ast::ListProjection(
                    Box::new(Ast::Flatten(Box::new(Ast::Identity))),
                    Box::new(rhs),
                ))
            }
            TokenKind::Filter => self.parse_filter(Ast::Identity),
            TokenKind::LBracket => match (self.peek_at(0), self.peek_at(1)) {
                (TokenKind::Number(_) | TokenKind::Colon, _) => {
                    self.parse_index_or_slice(Ast::Identity)
                }
                (TokenKind::Star, TokenKind::RBracket) => {
                    self.advance();
                    self.advance();
                    let rhs = self.projection_rhs(TokenKind::Star.lbp())?;
                    Ok(Ast::ListProjection(Box::new(Ast::Identity), Box::new(rhs)))
                }
                _ => self.parse_multi_list(),
            },
            TokenKind::LBrace => self.parse_multi_hash(),
            TokenKind::Not => {
                let operand = self.expr(TokenKind::Not.lbp())?;
                Ok(Ast::Not(Box::new(operand)))
            }
            TokenKind::LParen => {
                let inner = self.expr(0)?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            other => Err(QueryError::syntax(token.offset, format!("unexpected {other}"))),
        }
    }

    fn led(&mut self, token: Token, left: Ast) -> Result<Ast, QueryError> {
        let bp = token.kind.lbp();
        match token.kind {
            TokenKind::Dot => {
                if self.peek().kind == TokenKind::Star {
                    self.advance();
                    let rhs = self.projection_rhs(TokenKind::Star.lbp())?;
                    Ok(Ast::ObjectProjection(Box::new(left), Box::new(rhs)))
                } else {
                    let rhs = self.parse_dot_rhs(bp)?;
                    Ok(Ast::Subexpr(Box::new(left), Box::new(rhs)))
                }
            }
            TokenKind::LBracket => match (self.peek_at(0), self.peek_at(1)) {
                (TokenKind::Number(_) | TokenKind::Colon, _) => self.parse_index_or_slice(left),
                (TokenKind::Star, TokenKind::RBracket) => {
                    self.advance();
                    self.advance();
                    let rhs = self.projection_rhs(TokenKind::Star.lbp())?;
                    Ok(Ast::ListProjection(Box::new(left), Box::new(rhs)))
                }
                _ => {
                    let next = self.peek();
                    Err(QueryError::syntax(
                        next.offset,
                        format!("expected index, slice or '*', found {}", next.kind),
                    ))
                }
            },
            TokenKind::Flatten => {
                let rhs = self.projection_rhs(bp)?;
                Ok(Ast::ListProjection(
                    Box::new(Ast::Flatten(Box::new(left))),
                    Box::new(rhs),
                ))
            }
            TokenKind::Filter => self.parse_filter(left),
            TokenKind::Pipe => {
                let rhs = self.expr(bp)?;
                Ok(Ast::Pipe(Box::new(left), Box::new(rhs)))
            }
            TokenKind::Or => {
                let rhs = self.expr(bp)?;
                Ok(Ast::Or(Box::new(left), Box::new(rhs)))
            }
            TokenKind::And => {
                let rhs = self.expr(bp)?;
                Ok(Ast::And(Box::new(left), Box::new(rhs)))
            }
            TokenKind::Cmp(op) => {
                let rhs = self.expr(bp)?;
                Ok(Ast::Compare(op, Box::new(left), Box::new(rhs)))
            }
            other => Err(QueryError::syntax(token.offset, format!("unexpected {other}"))),
        }
    }

    fn projection_rhs(&mut self, bp: u8) -> Result<Ast, QueryError> {
        let next = self.peek().clone();
        if next.kind.lbp() < PROJECTION_STOP {
            return Ok(Ast::Identity);
        }
        match next.kind {
            TokenKind::LBracket | TokenKind::Filter => self.expr(bp),
            TokenKind::Dot => {
                self.advance();
                self.parse_dot_rhs(bp)
            }
            _ => Err(QueryError::syntax(
                next.offset,
                format!("expected '.', '[' or '[?' after projection, found {}", next.kind),
            )),
        }
    }

    fn parse_dot_rhs(&mut self, bp: u8) -> Result<Ast, QueryError> {
        let next = self.peek().clone();
        match next.kind {
            TokenKind::Identifier(_) | TokenKind::QuotedIdentifier(_) | TokenKind::At => {
                self.expr(bp)
            }
            TokenKind::LBracket => {
                self.advance();
                self.parse_multi_list()
            }
            TokenKind::LBrace => {
                self.advance();
                self.parse_multi_hash()
            }
            other => Err(QueryError::syntax(
                next.offset,
                format!("expected identifier, '[' or '{{' after '.', found {other}"),
            )),
        }
    }

    /// Called with the opening `[` consumed and a number or `:` next.
    fn parse_index_or_slice(&mut self, left: Ast) -> Result<Ast, QueryError> {
        let mut parts: [Option<i64>; 3] = [None; 3];
        let mut slot = 0usize;
        loop {
            let token = self.advance();
            match token.kind {
                TokenKind::RBracket => break,
                TokenKind::Number(n) if parts[slot].is_none() => parts[slot] = Some(n),
                TokenKind::Colon if slot < 2 => slot += 1,
                other => {
                    return Err(QueryError::syntax(
                        token.offset,
                        format!("unexpected {other} in index or slice"),
                    ));
                }
            }
        }

        if slot == 0 {
            let index = parts[0].ok_or_else(|| QueryError::syntax(self.peek().offset, "empty index"))?;
            return Ok(Ast::Subexpr(Box::new(left), Box::new(Ast::Index(index))));
        }

        let step = parts[2].unwrap_or(1);
        if step == 0 {
            return Err(QueryError::syntax(self.peek().offset, "slice step cannot be 0"));
        }
        let slice = Ast::Slice {
            start: parts[0],
            stop: parts[1],
            step,
        };
        let rhs = self.projection_rhs(TokenKind::Star.lbp())?;
        Ok(Ast::ListProjection(
            Box::new(Ast::Subexpr(Box::new(left), Box::new(slice))),
            Box::new(rhs),
        ))
    }

    /// Called with `[?` consumed.
    fn parse_filter(&mut self, left: Ast) -> Result<Ast, QueryError> {
        let cond = self.expr(0)?;
        self.expect(TokenKind::RBracket)?;
        let rhs = self.projection_rhs(TokenKind::Filter.lbp())?;
        Ok(Ast::Filter {
            lhs: Box::new(left),
            cond: Box::new(cond),
            rhs: Box::new(rhs),
        })
    }

    /// Called with the opening `[` consumed.
    fn parse_multi_list(&mut self) -> Result<Ast, QueryError> {
        let mut items = Vec::new();
        loop {
            items.push(self.expr(0)?);
            let token = self.advance();
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::RBracket => return Ok(Ast::MultiList(items)),
                other => {
                    return Err(QueryError::syntax(
                        token.offset,
                        format!("expected ',' or ']', found {other}"),
                    ));
                }
            }
        }
    }

    /// Called with the opening `{` consumed.
    fn parse_multi_hash(&mut self) -> Result<Ast, QueryError> {
        let mut entries = Vec::new();
        loop {
            let token = self.advance();
            let key = match token.kind {
                TokenKind::Identifier(name) | TokenKind::QuotedIdentifier(name) => name,
                other => {
                    return Err(QueryError::syntax(
                        token.offset,
                        format!("expected key name, found {other}"),
                    ));
                }
            };
            self.expect(TokenKind::Colon)?;
            entries.push((key, self.expr(0)?));
            let token = self.advance();
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::RBrace => return Ok(Ast::MultiHash(entries)),
                other => {
                    return Err(QueryError::syntax(
                        token.offset,
                        format!("expected ',' or '}}', found {other}"),
                    ));
                }
            }
        }
    }
}

fn eval(ast: &Ast, data: &JsonValue) -> JsonValue {
    match ast {
        Ast::Identity => data.clone(),
        Ast::Field(name) => data.get(name.as_str()).cloned().unwrap_or(JsonValue::Null),
        Ast::Index(index) => match data {
            JsonValue::Array(items) => resolve_index(*index, items.len())
                .map(|i| items[i].clone())
                .unwrap_or(JsonValue::Null),
            _ => JsonValue::Null,
        },
        Ast::Slice { start, stop, step } => match data {
            JsonValue::Array(items) => JsonValue::Array(slice(items, *start, *stop, *step)),
            _ => JsonValue::Null,
        },
        Ast::Literal(value) => value.clone(),
        Ast::Subexpr(lhs, rhs) => eval(rhs, &eval(lhs, data)),
        Ast::ListProjection(lhs, rhs) => match eval(lhs, data) {
            JsonValue::Array(items) => collect_projected(items.iter(), rhs),
            _ => JsonValue::Null,
        },
        Ast::ObjectProjection(lhs, rhs) => match eval(lhs, data) {
            JsonValue::Object(map) => {
                let mut entries = map.iter().collect::<Vec<_>>();
                entries.sort_by(|(a, _), (b, _)| a.cmp(b));
                collect_projected(entries.into_iter().map(|(_, value)| value), rhs)
            }
            _ => JsonValue::Null,
        },
        Ast::Flatten(inner) => match eval(inner, data) {
            JsonValue::Array(items) => {
                let mut flat = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        JsonValue::Array(nested) => flat.extend(nested),
                        other => flat.push(other),
                    }
                }
                JsonValue::Array(flat)
            }
            _ => JsonValue::Null,
        },
        Ast::Filter { lhs, cond, rhs } => match eval(lhs, data) {
            JsonValue::Array(items) => {
                collect_projected(items.iter().filter(|item| is_truthy(&eval(cond, item))), rhs)
            }
            _ => JsonValue::Null,
        },
        Ast::MultiList(items) => {
            if data.is_null() {
                return JsonValue::Null;
            }
            JsonValue::Array(items.iter().map(|item| eval(item, data)).collect())
        }
        Ast::MultiHash(entries) => {
            if data.is_null() {
                return JsonValue::Null;
            }
            let map = entries
                .iter()
                .map(|(key, item)| (key.clone(), eval(item, data)))
                .collect::<Map<String, JsonValue>>();
            JsonValue::Object(map)
        }
        Ast::Compare(op, lhs, rhs) => compare(*op, &eval(lhs, data), &eval(rhs, data)),
        Ast::And(lhs, rhs) => {
            let left = eval(lhs, data);
            if is_truthy(&left) {
                eval(rhs, data)
            } else {
                left
            }
        }
        Ast::Or(lhs, rhs) => {
            let left = eval(lhs, data);
            if is_truthy(&left) {
                left
            } else {
                eval(rhs, data)
            }
        }
        Ast::Not(inner) => JsonValue::Bool(!is_truthy(&eval(inner, data))),
        Ast::Pipe(lhs, rhs) => eval(rhs, &eval(lhs, data)),
    }
}

fn collect_projected<'v>(items: impl Iterator<Item = &'v JsonValue>, rhs: &Ast) -> JsonValue {
    JsonValue::Array(
        items
            .map(|item| eval(rhs, item))
            .filter(|value| !value.is_null())
            .collect(),
    )
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
        JsonValue::Number(_) => true,
    }
}

fn compare(op: Comparator, left: &JsonValue, right: &JsonValue) -> JsonValue {
    let numbers = left.as_f64().zip(right.as_f64());
    match op {
        Comparator::Eq | Comparator::Ne => {
            let equal = match numbers {
                Some((a, b)) => a == b,
                None => left == right,
            };
            JsonValue::Bool(equal == (op == Comparator::Eq))
        }
        _ => match numbers {
            Some((a, b)) => JsonValue::Bool(match op {
                Comparator::Lt => a < b,
                Comparator::Le => a <= b,
                Comparator::Gt => a > b,
                _ => a >= b,
            }),
            None => JsonValue::Null,
        },
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { index + len } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

fn slice(items: &[JsonValue], start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<JsonValue> {
    let len = items.len() as i64;
    let clamp = |value: i64| -> i64 {
        if value < 0 {
            let shifted = value + len;
            if shifted < 0 {
                if step < 0 {
                    -1
                } else {
                    0
                }
            } else {
                shifted
            }
        } else if value >= len {
            if step < 0 {
                len - 1
            } else {
                len
            }
        } else {
            value
        }
    };

    let start = match start {
        Some(v) => clamp(v),
        None if step < 0 => len - 1,
        None => 0,
    };
    let stop = match stop {
        Some(v) => clamp(v),
        None if step < 0 => -1,
        None => len,
    };

    let in_range = |i: i64| if step > 0 { i < stop } else { i > stop };
    let mut out = Vec::new();
    let mut i = start;
    while in_range(i) {
        out.push(items[i as usize].clone());
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    out
}
