//! Lexer for Nomad job specifications (HCL).

use crate::error::{NomadicError, Result};

/// Token types.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Ident(String),
    /// Quoted string with escapes resolved; `${...}` sequences are kept as written
    String(String),
    Heredoc(String),
    Number(f64),
    Bool(bool),
    Null,

    // Symbols
    LBrace,   // {
    RBrace,   // }
    LBracket, // [
    RBracket, // ]
    LParen,   // (
    RParen,   // )
    Comma,    // ,
    Equals,   // =
    Colon,    // :
    /// Operators and other punctuation that only appear inside expressions
    Punct(char),

    Newline,
    Eof,
}

impl TokenKind {
    pub fn name(&self) -> &'static str {
        match self {
            TokenKind::Ident(_) => "identifier",
            TokenKind::String(_) => "string",
            TokenKind::Heredoc(_) => "heredoc",
            TokenKind::Number(_) => "number",
            TokenKind::Bool(_) => "bool",
            TokenKind::Null => "null",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::Comma => ",",
            TokenKind::Equals => "=",
            TokenKind::Colon => ":",
            TokenKind::Punct(_) => "operator",
            TokenKind::Newline => "newline",
            TokenKind::Eof => "end of input",
        }
    }
}

/// Byte range plus the line/column where a token starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

/// A token with its span.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Lexer state.
pub struct Lexer<'a> {
    input: &'a str,
    source_name: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str, source_name: &'a str) -> Self {
        Self {
            input,
            source_name,
            chars: input.char_indices().peekable(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize all input into a vector of tokens.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = matches!(token.kind, TokenKind::Eof);
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn error(&self, line: usize, column: usize, message: impl std::fmt::Display) -> NomadicError {
        NomadicError::parse(
            self.source_name,
            format!("line {}, column {}: {}", line, column, message),
        )
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_second(&self) -> Option<char> {
        self.input[self.pos..].chars().nth(1)
    }

    fn next_char(&mut self) -> Option<char> {
        let (pos, c) = self.chars.next()?;
        self.pos = pos + c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// Skip blanks and comments; newlines are significant and left in place
    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek_char() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.next_char();
                }
                Some('#') => self.skip_line(),
                Some('/') if self.peek_second() == Some('/') => self.skip_line(),
                Some('/') if self.peek_second() == Some('*') => {
                    let (line, column) = (self.line, self.column);
                    self.next_char();
                    self.next_char();
                    loop {
                        match self.next_char() {
                            None => return Err(self.error(line, column, "unterminated comment")),
                            Some('*') if self.peek_char() == Some('/') => {
                                self.next_char();
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == '\n' {
                break;
            }
            self.next_char();
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_trivia()?;

        let start = self.pos;
        let line = self.line;
        let column = self.column;

        let Some(c) = self.next_char() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                span: Span {
                    start,
                    end: start,
                    line,
                    column,
                },
            });
        };

        let kind = match c {
            '\n' => TokenKind::Newline,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '=' => {
                if self.peek_char() == Some('=') {
                    self.next_char();
                    TokenKind::Punct('=')
                } else {
                    TokenKind::Equals
                }
            }
            '<' if self.peek_char() == Some('<') => self.scan_heredoc(line, column)?,
            '"' => self.scan_string(line, column)?,
            '_' | 'a'..='z' | 'A'..='Z' => self.scan_ident(start),
            '0'..='9' => self.scan_number(start, line, column)?,
            other => TokenKind::Punct(other),
        };

        Ok(Token {
            kind,
            span: Span {
                start,
                end: self.pos,
                line,
                column,
            },
        })
    }

    fn scan_ident(&mut self, start: usize) -> TokenKind {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                self.next_char();
            } else {
                break;
            }
        }

        match &self.input[start..self.pos] {
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            "null" => TokenKind::Null,
            ident => TokenKind::Ident(ident.to_string()),
        }
    }

    fn scan_number(&mut self, start: usize, line: usize, column: usize) -> Result<TokenKind> {
        while matches!(self.peek_char(), Some('0'..='9')) {
            self.next_char();
        }
        if self.peek_char() == Some('.') && matches!(self.peek_second(), Some('0'..='9')) {
            self.next_char();
            while matches!(self.peek_char(), Some('0'..='9')) {
                self.next_char();
            }
        }
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            self.next_char();
            if matches!(self.peek_char(), Some('+') | Some('-')) {
                self.next_char();
            }
            while matches!(self.peek_char(), Some('0'..='9')) {
                self.next_char();
            }
        }

        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| self.error(line, column, format!("invalid number '{}'", text)))
    }

    /// Scan a quoted template. Escapes are resolved, `$${` / `%%{` collapse
    /// to their literal forms, and `${...}` sequences are copied verbatim.
    fn scan_string(&mut self, line: usize, column: usize) -> Result<TokenKind> {
        let mut value = String::new();

        loop {
            match self.next_char() {
                None | Some('\n') => return Err(self.error(line, column, "unterminated string")),
                Some('"') => break,
                Some('\\') => {
                    let escaped = match self.next_char() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('u') => self.scan_unicode_escape(line, column)?,
                        Some(c) => {
                            return Err(self.error(
                                self.line,
                                self.column,
                                format!("invalid escape sequence '\\{}'", c),
                            ))
                        }
                        None => return Err(self.error(line, column, "unterminated string")),
                    };
                    value.push(escaped);
                }
                Some(c @ ('$' | '%')) => match self.peek_char() {
                    Some(next) if next == c && self.peek_second() == Some('{') => {
                        self.next_char();
                        value.push(c);
                    }
                    Some('{') => {
                        value.push(c);
                        self.scan_interpolation(&mut value, line, column)?;
                    }
                    _ => value.push(c),
                },
                Some(c) => value.push(c),
            }
        }

        Ok(TokenKind::String(value))
    }

    /// Copy a `{ ... }` template sequence, including nested quotes and braces
    fn scan_interpolation(&mut self, value: &mut String, line: usize, column: usize) -> Result<()> {
        let mut depth = 0usize;
        let mut in_quote = false;

        loop {
            let Some(c) = self.next_char() else {
                return Err(self.error(line, column, "unterminated template sequence"));
            };
            value.push(c);
            match c {
                '\\' if in_quote => {
                    if let Some(next) = self.next_char() {
                        value.push(next);
                    }
                }
                '"' => in_quote = !in_quote,
                '{' if !in_quote => depth += 1,
                '}' if !in_quote => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                '\n' => return Err(self.error(line, column, "unterminated template sequence")),
                _ => {}
            }
        }
    }

    fn scan_unicode_escape(&mut self, line: usize, column: usize) -> Result<char> {
        let mut hex = String::new();
        for _ in 0..4 {
            match self.next_char() {
                Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                _ => return Err(self.error(line, column, "invalid unicode escape")),
            }
        }
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error(line, column, "invalid unicode escape"))
    }

    /// `<<MARKER` or `<<-MARKER` (indented) heredoc
    fn scan_heredoc(&mut self, line: usize, column: usize) -> Result<TokenKind> {
        self.next_char();
        let indented = if self.peek_char() == Some('-') {
            self.next_char();
            true
        } else {
            false
        };

        let marker_start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.next_char();
            } else {
                break;
            }
        }
        let marker = self.input[marker_start..self.pos].to_string();
        if marker.is_empty() || self.next_char() != Some('\n') {
            return Err(self.error(line, column, "invalid heredoc marker"));
        }

        let mut lines = Vec::new();
        loop {
            if self.peek_char().is_none() {
                return Err(self.error(
                    line,
                    column,
                    format!("heredoc is missing closing marker '{}'", marker),
                ));
            }
            let line_start = self.pos;
            self.skip_line();
            let text = &self.input[line_start..self.pos];
            if text.trim() == marker {
                break;
            }
            lines.push(text.trim_end_matches('\r').to_string());
            self.next_char();
        }

        if indented {
            let indent = lines
                .iter()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.len() - l.trim_start().len())
                .min()
                .unwrap_or(0);
            for l in lines.iter_mut() {
                *l = l.chars().skip(indent).collect();
            }
        }

        let mut content = lines.join("\n");
        content.push('\n');
        Ok(TokenKind::Heredoc(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(input: &str) -> Vec<TokenKind> {
        Lexer::new(input, "test.nomad")
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_block_header() {
        let kinds = tokenize(r#"job "web" {"#);
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("job".into()),
                TokenKind::String("web".into()),
                TokenKind::LBrace,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_attribute_values() {
        let kinds = tokenize("count = 3\nenabled = true\nratio = 0.5");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("count".into()),
                TokenKind::Equals,
                TokenKind::Number(3.0),
                TokenKind::Newline,
                TokenKind::Ident("enabled".into()),
                TokenKind::Equals,
                TokenKind::Bool(true),
                TokenKind::Newline,
                TokenKind::Ident("ratio".into()),
                TokenKind::Equals,
                TokenKind::Number(0.5),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments() {
        let kinds = tokenize("# comment\na = 1 // trailing\n/* block\ncomment */ b = 2");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Newline,
                TokenKind::Ident("a".into()),
                TokenKind::Equals,
                TokenKind::Number(1.0),
                TokenKind::Newline,
                TokenKind::Ident("b".into()),
                TokenKind::Equals,
                TokenKind::Number(2.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes_and_templates() {
        let kinds = tokenize(r#""a\"b\\c\n" "$${literal}" "${NOMAD_PORT_http}" "%%{x}""#);
        assert_eq!(
            kinds,
            vec![
                TokenKind::String("a\"b\\c\n".into()),
                TokenKind::String("${literal}".into()),
                TokenKind::String("${NOMAD_PORT_http}".into()),
                TokenKind::String("%{x}".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_consul_template_braces_are_plain_text() {
        let kinds = tokenize(r#""{{ with nomadVar \"nomad/jobs/app/db\" }}""#);
        assert_eq!(
            kinds,
            vec![
                TokenKind::String(r#"{{ with nomadVar "nomad/jobs/app/db" }}"#.into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_heredoc() {
        let kinds = tokenize("data = <<-EOF\n    line one\n      line two\n    EOF\n");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("data".into()),
                TokenKind::Equals,
                TokenKind::Heredoc("line one\n  line two\n".into()),
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string_reports_position() {
        let err = Lexer::new("a = 1\nb = \"open\n", "bad.nomad")
            .tokenize()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad.nomad"));
        assert!(msg.contains("line 2, column 5"));
    }
}
