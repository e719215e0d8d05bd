//! Parser for Nomad job specifications (HCL).
//!
//! Produces a generic body/block/attribute tree. Literal values are decoded;
//! any other expression (variable references, function calls, operators) is
//! kept as its raw source text in [`Value::Expr`].

use super::lexer::{Lexer, Token, TokenKind};
use crate::error::{NomadicError, Result};

/// Attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    List(Vec<Value>),
    Object(Vec<(String, Value)>),
    /// Unevaluated expression, as written
    Expr(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as u64),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// String form of a scalar, used for env and meta values
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Expr(e) => Some(e.clone()),
            _ => None,
        }
    }
}

/// `name = value`
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: Value,
    pub line: usize,
}

/// `kind "label" ... { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: String,
    pub labels: Vec<String>,
    pub body: Body,
    pub line: usize,
}

impl Block {
    pub fn label(&self) -> Option<&str> {
        self.labels.first().map(String::as_str)
    }
}

/// Attributes and nested blocks in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    pub attributes: Vec<Attribute>,
    pub blocks: Vec<Block>,
}

impl Body {
    /// Last assignment wins
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .rev()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(Value::as_str)
    }

    pub fn block(&self, kind: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.kind == kind)
    }

    pub fn blocks<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks.iter().filter(move |b| b.kind == kind)
    }
}

/// Parse HCL text into a body
pub fn parse(input: &str, source_name: &str) -> Result<Body> {
    let tokens = Lexer::new(input, source_name).tokenize()?;
    let mut parser = Parser {
        input,
        source_name,
        tokens,
        pos: 0,
    };
    parser.parse_body(false)
}

/// Parser state.
struct Parser<'a> {
    input: &'a str,
    source_name: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos).or_else(|| self.tokens.last())
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, message: impl std::fmt::Display) -> NomadicError {
        let (line, column) = self
            .current()
            .map(|t| (t.span.line, t.span.column))
            .unwrap_or((0, 0));
        NomadicError::parse(
            self.source_name,
            format!("line {}, column {}: {}", line, column, message),
        )
    }

    fn unexpected(&self, expected: &str) -> NomadicError {
        self.error(format!("expected {}, found {}", expected, self.peek().name()))
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }

    fn line(&self) -> usize {
        self.current().map(|t| t.span.line).unwrap_or(0)
    }

    fn parse_body(&mut self, nested: bool) -> Result<Body> {
        let mut body = Body::default();

        loop {
            self.skip_newlines();
            let line = self.line();

            let name = match self.peek().clone() {
                TokenKind::Eof if nested => return Err(self.error("unclosed block")),
                TokenKind::Eof => break,
                TokenKind::RBrace if nested => break,
                TokenKind::Ident(name) => name,
                _ => return Err(self.unexpected("attribute or block")),
            };
            self.advance();

            if matches!(self.peek(), TokenKind::Equals) {
                self.advance();
                let value = self.parse_expr()?;
                match self.peek() {
                    TokenKind::Newline | TokenKind::Eof | TokenKind::RBrace => {}
                    _ => return Err(self.unexpected("newline after attribute")),
                }
                body.attributes.push(Attribute { name, value, line });
                continue;
            }

            let mut labels = Vec::new();
            loop {
                match self.peek().clone() {
                    TokenKind::String(label) | TokenKind::Ident(label) => {
                        self.advance();
                        labels.push(label);
                    }
                    TokenKind::LBrace => {
                        self.advance();
                        break;
                    }
                    _ => return Err(self.unexpected("block label or '{'")),
                }
            }

            let inner = self.parse_body(true)?;
            self.advance(); // closing brace
            body.blocks.push(Block {
                kind: name,
                labels,
                body: inner,
                line,
            });
        }

        Ok(body)
    }

    fn at_terminator(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Newline
                | TokenKind::Eof
                | TokenKind::Comma
                | TokenKind::RBrace
                | TokenKind::RBracket
        )
    }

    fn parse_expr(&mut self) -> Result<Value> {
        let start = self.pos;
        let value = self.parse_primary()?;

        if self.at_terminator() || matches!(value, Value::Expr(_)) {
            return Ok(value);
        }

        // Literal followed by an operator: keep the whole expression raw
        self.pos = start;
        self.parse_raw()
    }

    fn parse_primary(&mut self) -> Result<Value> {
        match self.peek().clone() {
            TokenKind::String(s) | TokenKind::Heredoc(s) => {
                self.advance();
                Ok(Value::String(s))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Value::Number(n))
            }
            TokenKind::Bool(b) => {
                self.advance();
                Ok(Value::Bool(b))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Value::Null)
            }
            TokenKind::Punct('-') => {
                let start = self.pos;
                self.advance();
                if let TokenKind::Number(n) = self.peek().clone() {
                    self.advance();
                    Ok(Value::Number(-n))
                } else {
                    self.pos = start;
                    self.parse_raw()
                }
            }
            TokenKind::LBracket => self.parse_list(),
            TokenKind::LBrace => self.parse_object(),
            TokenKind::Ident(_) | TokenKind::LParen | TokenKind::Punct(_) => self.parse_raw(),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_list(&mut self) -> Result<Value> {
        self.advance();
        let mut items = Vec::new();

        loop {
            self.skip_newlines();
            if matches!(self.peek(), TokenKind::RBracket) {
                self.advance();
                break;
            }
            items.push(self.parse_expr()?);
            self.skip_newlines();
            match self.peek() {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RBracket => {}
                _ => return Err(self.unexpected("',' or ']'")),
            }
        }

        Ok(Value::List(items))
    }

    fn parse_object(&mut self) -> Result<Value> {
        self.advance();
        let mut entries = Vec::new();

        loop {
            while matches!(self.peek(), TokenKind::Newline | TokenKind::Comma) {
                self.advance();
            }

            let key = match self.peek().clone() {
                TokenKind::RBrace => {
                    self.advance();
                    break;
                }
                TokenKind::Ident(k) | TokenKind::String(k) => {
                    self.advance();
                    k
                }
                _ => return Err(self.unexpected("object key")),
            };

            match self.peek() {
                TokenKind::Equals | TokenKind::Colon => {
                    self.advance();
                }
                _ => return Err(self.unexpected("'=' or ':'")),
            }

            let value = self.parse_expr()?;
            entries.push((key, value));

            match self.peek() {
                TokenKind::Newline | TokenKind::Comma | TokenKind::RBrace => {}
                _ => return Err(self.unexpected("',' or '}'")),
            }
        }

        Ok(Value::Object(entries))
    }

    /// Consume tokens up to the next terminator at nesting depth zero
    fn parse_raw(&mut self) -> Result<Value> {
        let first = self.pos;
        let mut depth = 0usize;

        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                TokenKind::Newline | TokenKind::Comma if depth == 0 => break,
                _ => {}
            }
            self.advance();
        }

        if self.pos == first {
            return Err(self.unexpected("expression"));
        }

        let start = self.tokens[first].span.start;
        let end = self.tokens[self.pos - 1].span.end;
        Ok(Value::Expr(self.input[start..end].trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_blocks() {
        let src = r#"
job "web" {
  datacenters = ["dc1", "dc2"]

  group "app" {
    count = 2

    task "server" {
      driver = "docker"
      config {
        image = "nginx:1.25"
      }
    }
  }
}
"#;
        let body = parse(src, "web.nomad").unwrap();
        let job = body.block("job").unwrap();
        assert_eq!(job.label(), Some("web"));
        assert_eq!(
            job.body.attr("datacenters"),
            Some(&Value::List(vec![
                Value::String("dc1".into()),
                Value::String("dc2".into())
            ]))
        );

        let group = job.body.block("group").unwrap();
        assert_eq!(group.body.attr("count").and_then(Value::as_u64), Some(2));

        let task = group.body.block("task").unwrap();
        assert_eq!(task.body.string("driver"), Some("docker"));
        assert_eq!(
            task.body.block("config").unwrap().body.string("image"),
            Some("nginx:1.25")
        );
    }

    #[test]
    fn test_objects_and_single_line_blocks() {
        let src = r#"
env = {
  "HTTP_PORT" = "8080"
  MODE: "prod",
}
check_restart { limit = 3 }
"#;
        let body = parse(src, "t.hcl").unwrap();
        let env = body.attr("env").unwrap().as_object().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0], ("HTTP_PORT".to_string(), Value::String("8080".into())));
        assert_eq!(env[1], ("MODE".to_string(), Value::String("prod".into())));

        let restart = body.block("check_restart").unwrap();
        assert_eq!(restart.body.attr("limit").and_then(Value::as_u64), Some(3));
    }

    #[test]
    fn test_raw_expressions_are_preserved() {
        let src = "image = var.image\ncount = var.count + 1\ncpu = -1\nports = [local.port]\n";
        let body = parse(src, "t.hcl").unwrap();
        assert_eq!(body.attr("image"), Some(&Value::Expr("var.image".into())));
        assert_eq!(
            body.attr("count"),
            Some(&Value::Expr("var.count + 1".into()))
        );
        assert_eq!(body.attr("cpu"), Some(&Value::Number(-1.0)));
        assert_eq!(
            body.attr("ports"),
            Some(&Value::List(vec![Value::Expr("local.port".into())]))
        );
    }

    #[test]
    fn test_unclosed_block_is_error() {
        let err = parse("job \"web\" {\n  group \"a\" {\n", "open.nomad").unwrap_err();
        assert!(err.to_string().contains("unclosed block"));
    }

    #[test]
    fn test_missing_value_reports_line() {
        let err = parse("job \"web\" {\n  count =\n}\n", "bad.nomad").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 2"), "{}", msg);
    }
}
