//! Parser for the opam file format.
//!
//! Grammar (informal):
//!
//! ```text
//! file    := item*
//! item    := FIELD value | IDENT STRING? '{' item* '}'
//! value   := or
//! or      := and ('|' and)*
//! and     := rel ('&' rel)*
//! rel     := unary (RELOP unary)?
//! unary   := '!' unary | '?' unary | RELOP postfix | postfix
//! postfix := atom ('{' value* '}')?
//! atom    := STRING | IDENT (ENVOP value)? | BOOL | INT | '[' value* ']' | '(' value* ')'
//! ```
//!
//! A FIELD is an identifier immediately followed by `:` that is not part of
//! a package variable such as `ocaml:version`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    And,
    Or,
}

/// A value in an opam file.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    String(String),
    Ident(String),
    List(Vec<Value>),
    Group(Vec<Value>),
    /// `value { filters }`
    Option(Box<Value>, Vec<Value>),
    Logop(LogOp, Box<Value>, Box<Value>),
    Relop(RelOp, Box<Value>, Box<Value>),
    /// `>= "1.0"` inside version constraints
    PrefixRelop(RelOp, Box<Value>),
    Not(Box<Value>),
    Defined(Box<Value>),
    /// `VAR += "value"` inside `build-env`/`setenv`
    EnvBinding(String, String, Box<Value>),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list; a non-list value is a one-element list.
    #[must_use]
    pub fn items(&self) -> Vec<&Value> {
        match self {
            Self::List(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    /// Split `value { filters }` into its parts.
    #[must_use]
    pub fn with_filters(&self) -> (&Value, &[Value]) {
        match self {
            Self::Option(inner, filters) => (inner, filters),
            other => (other, &[]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Variable(String, Value),
    Section(Section),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub kind: String,
    pub name: Option<String>,
    pub items: Vec<Item>,
}

/// A parsed opam file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpamFile {
    pub items: Vec<Item>,
}

impl OpamFile {
    /// Value of a top-level field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        field_in(&self.items, name)
    }

    /// First top-level section of the given kind.
    #[must_use]
    pub fn section(&self, kind: &str) -> Option<&Section> {
        self.items.iter().find_map(|item| match item {
            Item::Section(s) if s.kind == kind => Some(s),
            _ => None,
        })
    }
}

impl Section {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        field_in(&self.items, name)
    }
}

fn field_in<'a>(items: &'a [Item], name: &str) -> Option<&'a Value> {
    items.iter().find_map(|item| match item {
        Item::Variable(n, v) if n == name => Some(v),
        _ => None,
    })
}

/// Syntax error with the 1-based line it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for SyntaxError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Ident(String),
    Field(String),
    Bool(bool),
    Int(i64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    And,
    Or,
    Not,
    Question,
    Relop(RelOp),
    EnvOp(String),
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn err(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, SyntaxError> {
        let mut tokens = Vec::new();
        while let Some(tok) = self.next_token()? {
            tokens.push((tok, self.line));
        }
        Ok(tokens)
    }

    fn skip_trivia(&mut self) -> Result<(), SyntaxError> {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(c) = self.bump() {
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                Some(b'(') if self.peek_at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some(b'*') if self.peek() == Some(b')') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.err("unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, SyntaxError> {
        self.skip_trivia()?;
        let Some(c) = self.peek() else {
            return Ok(None);
        };

        let tok = match c {
            b'"' => self.string()?,
            b'{' => self.single(Token::LBrace),
            b'}' => self.single(Token::RBrace),
            b'[' => self.single(Token::LBracket),
            b']' => self.single(Token::RBracket),
            b'(' => self.single(Token::LParen),
            b')' => self.single(Token::RParen),
            b'&' => self.single(Token::And),
            b'|' => self.single(Token::Or),
            b'?' => self.single(Token::Question),
            b'!' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Token::Relop(RelOp::Neq)
                } else {
                    Token::Not
                }
            }
            b'<' | b'>' => {
                self.bump();
                let eq = self.peek() == Some(b'=');
                if eq {
                    self.bump();
                }
                Token::Relop(match (c, eq) {
                    (b'<', false) => RelOp::Lt,
                    (b'<', true) => RelOp::Le,
                    (_, false) => RelOp::Gt,
                    (_, true) => RelOp::Ge,
                })
            }
            b'=' => {
                self.bump();
                match self.peek() {
                    Some(b'+') => {
                        self.bump();
                        if self.peek() == Some(b'=') {
                            self.bump();
                            Token::EnvOp("=+=".to_string())
                        } else {
                            Token::EnvOp("=+".to_string())
                        }
                    }
                    Some(b':') => {
                        self.bump();
                        Token::EnvOp("=:".to_string())
                    }
                    Some(b'=') => {
                        self.bump();
                        Token::Relop(RelOp::Eq)
                    }
                    _ => Token::Relop(RelOp::Eq),
                }
            }
            b'+' if self.peek_at(1) == Some(b'=') => {
                self.bump();
                self.bump();
                Token::EnvOp("+=".to_string())
            }
            b':' if self.peek_at(1) == Some(b'=') => {
                self.bump();
                self.bump();
                Token::EnvOp(":=".to_string())
            }
            b'-' | b'0'..=b'9' => self.int()?,
            c if c.is_ascii_alphabetic() || c == b'_' => self.ident(),
            other => {
                return Err(self.err(format!("unexpected character '{}'", other as char)));
            }
        };
        Ok(Some(tok))
    }

    fn single(&mut self, tok: Token) -> Token {
        self.bump();
        tok
    }

    fn int(&mut self) -> Result<Token, SyntaxError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.bump();
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]);
        text.parse()
            .map(Token::Int)
            .map_err(|_| self.err(format!("invalid integer '{text}'")))
    }

    fn ident(&mut self) -> Token {
        let is_ident_char = |c: u8| c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'+');
        let start = self.pos;
        loop {
            while self.peek().is_some_and(is_ident_char) {
                self.bump();
            }
            // `pkg:var` continues the identifier, `field:` ends it
            if self.peek() == Some(b':')
                && self
                    .peek_at(1)
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == b'_')
            {
                self.bump();
                continue;
            }
            break;
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();

        if self.peek() == Some(b':') && self.peek_at(1) != Some(b'=') {
            self.bump();
            return Token::Field(text);
        }

        match text.as_str() {
            "true" => Token::Bool(true),
            "false" => Token::Bool(false),
            _ => Token::Ident(text),
        }
    }

    fn string(&mut self) -> Result<Token, SyntaxError> {
        let triple = self.peek_at(1) == Some(b'"') && self.peek_at(2) == Some(b'"');
        let quotes = if triple { 3 } else { 1 };
        for _ in 0..quotes {
            self.bump();
        }

        let mut out = Vec::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.err("unterminated string"));
            };
            match c {
                b'"' if !triple => break,
                b'"' if self.peek() == Some(b'"') && self.peek_at(1) == Some(b'"') => {
                    self.bump();
                    self.bump();
                    break;
                }
                b'\\' => match self.bump() {
                    Some(b'n') => out.push(b'\n'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b'b') => out.push(0x08),
                    Some(b'"') => out.push(b'"'),
                    Some(b'\\') => out.push(b'\\'),
                    Some(b'\n') => {
                        while self.peek().is_some_and(|c| c == b' ' || c == b'\t') {
                            self.bump();
                        }
                    }
                    Some(other) => {
                        out.push(b'\\');
                        out.push(other);
                    }
                    None => return Err(self.err("unterminated string")),
                },
                other => out.push(other),
            }
        }
        Ok(Token::Str(String::from_utf8_lossy(&out).into_owned()))
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |(_, line)| *line)
    }

    fn err(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), SyntaxError> {
        match self.next() {
            Some(ref tok) if tok == expected => Ok(()),
            Some(tok) => Err(self.err(format!("expected {expected:?}, found {tok:?}"))),
            None => Err(self.err(format!("expected {expected:?}, found end of file"))),
        }
    }

    fn items(&mut self, in_section: bool) -> Result<Vec<Item>, SyntaxError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None if !in_section => return Ok(items),
                None => return Err(self.err("unterminated section")),
                Some(Token::RBrace) if in_section => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(Token::Field(name)) => {
                    let name = name.clone();
                    self.pos += 1;
                    let value = self.value()?;
                    items.push(Item::Variable(name, value));
                }
                Some(Token::Ident(kind)) => {
                    let kind = kind.clone();
                    self.pos += 1;
                    let name = match self.peek() {
                        Some(Token::Str(s)) => {
                            let s = s.clone();
                            self.pos += 1;
                            Some(s)
                        }
                        _ => None,
                    };
                    self.expect(&Token::LBrace)?;
                    let inner = self.items(true)?;
                    items.push(Item::Section(Section {
                        kind,
                        name,
                        items: inner,
                    }));
                }
                Some(tok) => {
                    let msg = format!("expected field or section, found {tok:?}");
                    return Err(self.err(msg));
                }
            }
        }
    }

    fn value(&mut self) -> Result<Value, SyntaxError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Value::Logop(LogOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Value, SyntaxError> {
        let mut lhs = self.rel()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.rel()?;
            lhs = Value::Logop(LogOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn rel(&mut self) -> Result<Value, SyntaxError> {
        let lhs = self.unary()?;
        if let Some(Token::Relop(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.unary()?;
            return Ok(Value::Relop(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Value, SyntaxError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Value::Not(Box::new(self.unary()?)))
            }
            Some(Token::Question) => {
                self.pos += 1;
                Ok(Value::Defined(Box::new(self.unary()?)))
            }
            Some(Token::Relop(op)) => {
                let op = *op;
                self.pos += 1;
                Ok(Value::PrefixRelop(op, Box::new(self.postfix()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Value, SyntaxError> {
        let atom = self.atom()?;
        if self.peek() == Some(&Token::LBrace) {
            self.pos += 1;
            let filters = self.sequence(&Token::RBrace)?;
            return Ok(Value::Option(Box::new(atom), filters));
        }
        Ok(atom)
    }

    fn atom(&mut self) -> Result<Value, SyntaxError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Ident(name)) => {
                if let Some(Token::EnvOp(op)) = self.peek() {
                    let op = op.clone();
                    self.pos += 1;
                    let rhs = self.postfix()?;
                    return Ok(Value::EnvBinding(name, op, Box::new(rhs)));
                }
                Ok(Value::Ident(name))
            }
            Some(Token::LBracket) => Ok(Value::List(self.sequence(&Token::RBracket)?)),
            Some(Token::LParen) => Ok(Value::Group(self.sequence(&Token::RParen)?)),
            Some(tok) => Err(self.err(format!("unexpected {tok:?}"))),
            None => Err(self.err("unexpected end of file")),
        }
    }

    /// Values up to and including the closing token.
    fn sequence(&mut self, close: &Token) -> Result<Vec<Value>, SyntaxError> {
        let mut values = Vec::new();
        loop {
            match self.peek() {
                Some(tok) if tok == close => {
                    self.pos += 1;
                    return Ok(values);
                }
                None => return Err(self.err(format!("expected {close:?}, found end of file"))),
                // A field here means the closing bracket was forgotten
                Some(Token::Field(_)) if self.peek_at(1).is_some() => {
                    return Err(self.err(format!("expected {close:?} before next field")));
                }
                _ => values.push(self.value()?),
            }
        }
    }
}

/// Parse the contents of an opam file.
///
/// # Errors
/// Returns a [`SyntaxError`] when the input is not valid opam syntax.
pub fn parse(source: &str) -> Result<OpamFile, SyntaxError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let items = parser.items(false)?;
    Ok(OpamFile { items })
}
