//! Query text → AST parser.
//!
//! A hand-written lexer and recursive-descent parser for the object store's
//! filter/order/paginate language:
//!
//! ```text
//! name = "alice" AND (age > $1 OR active = $2) ORDER BY CAST(age) DESC LIMIT 10
//! ```
//!
//! Parsing is purely functional over the input string and all-or-nothing:
//! either a complete [`Query`] is produced or a [`SyntaxError`] naming the
//! offending byte offset (and derived line/column) is returned. Keywords are
//! case-insensitive; path segments are case-sensitive identifiers. String
//! literals carry no escape sequences, so a `"` cannot occur inside one.

use thiserror::Error;

use super::types::{
    CompareOp, Conjunction, Disjunction, Operand, OrderBy, OrderKey, Path, Predicate, Query, Term,
};

/// A position-tagged parse failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub message: String,
    /// Byte offset into the query text.
    pub offset: usize,
    /// 1-based line derived from the offset.
    pub line: usize,
    /// 1-based column derived from the offset.
    pub column: usize,
}

impl SyntaxError {
    fn new(src: &str, offset: usize, message: impl Into<String>) -> Self {
        let (line, column) = line_col(src, offset);
        SyntaxError {
            message: message.into(),
            offset,
            line,
            column,
        }
    }
}

/// Compute 1-based line/column from a byte offset.
fn line_col(src: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut column = 1;
    for (i, ch) in src.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

/// Parse one query string into its AST.
pub fn parse(input: &str) -> Result<Query, SyntaxError> {
    let tokens = tokenize(input)?;
    Parser {
        src: input,
        tokens,
        pos: 0,
    }
    .query()
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    /// Raw numeric text; the parser decides int vs. float by the `.`.
    Num(String),
    Placeholder(usize),
    Op(CompareOp),
    LParen,
    RParen,
    Dot,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("'{s}'"),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Num(s) => format!("'{s}'"),
            Tok::Placeholder(n) => format!("'${n}'"),
            Tok::Op(op) => format!("'{}'", op.sql()),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::Dot => "'.'".to_string(),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    start: usize,
}

fn tokenize(src: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(start, ch)) = chars.peek() {
        match ch {
            c if c.is_ascii_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    tok: Tok::Ident(ident),
                    start,
                });
            }
            c if c.is_ascii_digit() || c == '-' => {
                chars.next();
                let mut num = String::from(c);
                if c == '-' && !chars.peek().is_some_and(|&(_, c)| c.is_ascii_digit()) {
                    return Err(SyntaxError::new(src, start, "expected digit after '-'"));
                }
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek().is_some_and(|&(_, c)| c == '.') {
                    chars.next();
                    num.push('.');
                    if !chars.peek().is_some_and(|&(_, c)| c.is_ascii_digit()) {
                        return Err(SyntaxError::new(
                            src,
                            start,
                            "expected digit after decimal point",
                        ));
                    }
                    while let Some(&(_, c)) = chars.peek() {
                        if c.is_ascii_digit() {
                            num.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                tokens.push(Token {
                    tok: Tok::Num(num),
                    start,
                });
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    s.push(c);
                }
                if !closed {
                    return Err(SyntaxError::new(src, start, "unterminated string literal"));
                }
                tokens.push(Token {
                    tok: Tok::Str(s),
                    start,
                });
            }
            '$' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        digits.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if digits.is_empty() {
                    return Err(SyntaxError::new(src, start, "expected digit after '$'"));
                }
                let index = digits.parse::<usize>().map_err(|_| {
                    SyntaxError::new(src, start, format!("placeholder ${digits} is too large"))
                })?;
                tokens.push(Token {
                    tok: Tok::Placeholder(index),
                    start,
                });
            }
            '(' => {
                chars.next();
                tokens.push(Token {
                    tok: Tok::LParen,
                    start,
                });
            }
            ')' => {
                chars.next();
                tokens.push(Token {
                    tok: Tok::RParen,
                    start,
                });
            }
            '.' => {
                chars.next();
                tokens.push(Token {
                    tok: Tok::Dot,
                    start,
                });
            }
            '=' => {
                chars.next();
                tokens.push(Token {
                    tok: Tok::Op(CompareOp::Eq),
                    start,
                });
            }
            '!' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    tokens.push(Token {
                        tok: Tok::Op(CompareOp::NotEq),
                        start,
                    });
                } else {
                    return Err(SyntaxError::new(src, start, "expected '=' after '!'"));
                }
            }
            '<' => {
                chars.next();
                let op = if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    CompareOp::LtEq
                } else {
                    CompareOp::Lt
                };
                tokens.push(Token {
                    tok: Tok::Op(op),
                    start,
                });
            }
            '>' => {
                chars.next();
                let op = if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    CompareOp::GtEq
                } else {
                    CompareOp::Gt
                };
                tokens.push(Token {
                    tok: Tok::Op(op),
                    start,
                });
            }
            other => {
                return Err(SyntaxError::new(
                    src,
                    start,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }

    tokens.push(Token {
        tok: Tok::Eof,
        start: src.len(),
    });
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.src, offset, message)
    }

    /// True if the current token is the given keyword (case-insensitive).
    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().tok, Tok::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), SyntaxError> {
        if self.at_keyword(keyword) {
            self.advance();
            Ok(())
        } else {
            let token = self.peek();
            Err(self.error(
                token.start,
                format!("expected {keyword}, found {}", token.tok.describe()),
            ))
        }
    }

    fn query(&mut self) -> Result<Query, SyntaxError> {
        let filter = self.disjunction()?;

        let order_by = if self.at_keyword("order") {
            Some(self.order_by()?)
        } else {
            None
        };
        let limit = if self.at_keyword("limit") {
            self.advance();
            Some(self.integer("LIMIT")?)
        } else {
            None
        };
        let offset = if self.at_keyword("offset") {
            self.advance();
            Some(self.integer("OFFSET")?)
        } else {
            None
        };

        let token = self.peek();
        if token.tok != Tok::Eof {
            return Err(self.error(
                token.start,
                format!("unexpected {}", token.tok.describe()),
            ));
        }

        Ok(Query {
            filter,
            order_by,
            limit,
            offset,
        })
    }

    fn disjunction(&mut self) -> Result<Disjunction, SyntaxError> {
        let mut conjunctions = vec![self.conjunction()?];
        while self.at_keyword("or") {
            self.advance();
            conjunctions.push(self.conjunction()?);
        }
        Ok(Disjunction { conjunctions })
    }

    fn conjunction(&mut self) -> Result<Conjunction, SyntaxError> {
        let mut terms = vec![self.term()?];
        while self.at_keyword("and") {
            self.advance();
            terms.push(self.term()?);
        }
        Ok(Conjunction { terms })
    }

    fn term(&mut self) -> Result<Term, SyntaxError> {
        let token = self.peek().clone();
        match token.tok {
            Tok::LParen => {
                self.advance();
                let group = self.disjunction()?;
                let token = self.peek();
                if token.tok != Tok::RParen {
                    return Err(self.error(
                        token.start,
                        format!("expected ')', found {}", token.tok.describe()),
                    ));
                }
                self.advance();
                Ok(Term::Group(group))
            }
            Tok::Ident(s) if s.eq_ignore_ascii_case("true") => {
                self.advance();
                Ok(Term::Bool(true))
            }
            Tok::Ident(s) if s.eq_ignore_ascii_case("false") => {
                self.advance();
                Ok(Term::Bool(false))
            }
            Tok::Ident(_) => Ok(Term::Predicate(self.predicate()?)),
            other => Err(self.error(
                token.start,
                format!("expected a predicate or '(', found {}", other.describe()),
            )),
        }
    }

    fn predicate(&mut self) -> Result<Predicate, SyntaxError> {
        let path = self.path()?;
        let token = self.peek().clone();
        let op = match token.tok {
            Tok::Op(op) => {
                self.advance();
                op
            }
            other => {
                return Err(self.error(
                    token.start,
                    format!("expected comparison operator, found {}", other.describe()),
                ));
            }
        };
        let operand = self.operand()?;
        Ok(Predicate { path, op, operand })
    }

    fn path(&mut self) -> Result<Path, SyntaxError> {
        let mut segments = Vec::new();
        match self.advance() {
            Token {
                tok: Tok::Ident(s), ..
            } => segments.push(s),
            token => {
                return Err(self.error(
                    token.start,
                    format!("expected identifier, found {}", token.tok.describe()),
                ))
            }
        }
        while self.peek().tok == Tok::Dot {
            self.advance();
            match self.advance() {
                Token {
                    tok: Tok::Ident(s), ..
                } => segments.push(s),
                token => {
                    return Err(self.error(
                        token.start,
                        format!(
                            "expected identifier after '.', found {}",
                            token.tok.describe()
                        ),
                    ))
                }
            }
        }
        Ok(Path { segments })
    }

    fn operand(&mut self) -> Result<Operand, SyntaxError> {
        let token = self.advance();
        match token.tok {
            Tok::Str(s) => Ok(Operand::String(s)),
            Tok::Num(raw) => {
                if raw.contains('.') {
                    raw.parse::<f64>()
                        .map(Operand::Float)
                        .map_err(|_| self.error(token.start, format!("invalid number '{raw}'")))
                } else {
                    raw.parse::<i64>().map(Operand::Int).map_err(|_| {
                        self.error(token.start, format!("integer literal '{raw}' out of range"))
                    })
                }
            }
            Tok::Placeholder(index) => Ok(Operand::Placeholder(index)),
            Tok::Ident(s) if s.eq_ignore_ascii_case("true") => Ok(Operand::Bool(true)),
            Tok::Ident(s) if s.eq_ignore_ascii_case("false") => Ok(Operand::Bool(false)),
            Tok::Ident(s) if s.eq_ignore_ascii_case("null") => Ok(Operand::Null),
            other => Err(self.error(
                token.start,
                format!("expected a literal or placeholder, found {}", other.describe()),
            )),
        }
    }

    /// A plain unsigned integer, as required by LIMIT and OFFSET.
    fn integer(&mut self, clause: &str) -> Result<u64, SyntaxError> {
        let token = self.advance();
        match token.tok {
            Tok::Num(raw) if !raw.contains('.') && !raw.starts_with('-') => {
                raw.parse::<u64>().map_err(|_| {
                    self.error(token.start, format!("integer literal '{raw}' out of range"))
                })
            }
            other => Err(self.error(
                token.start,
                format!("expected integer after {clause}, found {}", other.describe()),
            )),
        }
    }

    fn order_by(&mut self) -> Result<OrderBy, SyntaxError> {
        self.expect_keyword("order")?;
        self.expect_keyword("by")?;

        let key = if self.at_keyword("cast") {
            self.advance();
            let token = self.peek();
            if token.tok != Tok::LParen {
                return Err(self.error(
                    token.start,
                    format!("expected '(' after CAST, found {}", token.tok.describe()),
                ));
            }
            self.advance();
            let path = self.path()?;
            let token = self.peek();
            if token.tok != Tok::RParen {
                return Err(self.error(
                    token.start,
                    format!("expected ')', found {}", token.tok.describe()),
                ));
            }
            self.advance();
            OrderKey::Cast(path)
        } else {
            OrderKey::Path(self.path()?)
        };

        let asc = if self.at_keyword("asc") {
            self.advance();
            Some(true)
        } else if self.at_keyword("desc") {
            self.advance();
            Some(false)
        } else {
            None
        };

        Ok(OrderBy { key, asc })
    }
}
