//! S-expression trees as they travel over the SWANK wire.
//!
//! The reader accepts the subset of Lisp printer output SWANK produces:
//! lists, double-quoted strings with backslash escapes, integers, and
//! everything else as symbols (keywords, `nil`, `t`, floats, `|quoted|`
//! names). Quote sugar `'x` reads as `(quote x)`.

use std::fmt;

/// Nesting limit for the reader.
const MAX_DEPTH: usize = 512;

/// A parsed S-expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexpr {
    Symbol(String),
    Str(String),
    Int(i64),
    List(Vec<Sexpr>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SexprError {
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },
    #[error("unbalanced ')' at byte {offset}")]
    UnexpectedClose { offset: usize },
    #[error("unterminated string starting at byte {offset}")]
    UnterminatedString { offset: usize },
    #[error("unterminated |symbol| starting at byte {offset}")]
    UnterminatedSymbol { offset: usize },
    #[error("trailing input at byte {offset}")]
    TrailingInput { offset: usize },
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

impl Sexpr {
    /// Read exactly one form from `text`. Surrounding whitespace and
    /// `;` comments are allowed; anything else after the form is an error.
    pub fn parse(text: &str) -> Result<Self, SexprError> {
        let mut reader = Reader { text, pos: 0 };
        let form = reader.read(0)?;
        reader.skip_whitespace();
        if reader.pos < text.len() {
            return Err(SexprError::TrailingInput { offset: reader.pos });
        }
        Ok(form)
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol(name.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    #[must_use]
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(name) => Some(name),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Sexpr]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Symbol comparison is case-insensitive, matching the Lisp reader's
    /// default upcasing.
    #[must_use]
    pub fn is_symbol(&self, name: &str) -> bool {
        self.as_symbol()
            .is_some_and(|sym| sym.eq_ignore_ascii_case(name))
    }

    /// `nil` and `()` are the same object in Lisp.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        match self {
            Self::Symbol(name) => name.eq_ignore_ascii_case("nil"),
            Self::List(items) => items.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Sexpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symbol(name) => f.write_str(name),
            Self::Str(value) => f.write_str(&quote_string(value)),
            Self::Int(value) => write!(f, "{value}"),
            Self::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Render `value` as a Lisp string literal, escaping backslashes and
/// double quotes.
#[must_use]
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

struct Reader<'a> {
    text: &'a str,
    pos: usize,
}

impl Reader<'_> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.bump();
            } else if ch == ';' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn read(&mut self, depth: usize) -> Result<Sexpr, SexprError> {
        if depth > MAX_DEPTH {
            return Err(SexprError::TooDeep);
        }
        self.skip_whitespace();
        let start = self.pos;
        match self.bump() {
            None => Err(SexprError::UnexpectedEof { offset: start }),
            Some('(') => self.read_list(depth),
            Some(')') => Err(SexprError::UnexpectedClose { offset: start }),
            Some('"') => self.read_string(start),
            Some('\'') => {
                let quoted = self.read(depth + 1)?;
                Ok(Sexpr::List(vec![Sexpr::symbol("quote"), quoted]))
            }
            Some(_) => {
                self.pos = start;
                self.read_atom()
            }
        }
    }

    fn read_list(&mut self, depth: usize) -> Result<Sexpr, SexprError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(SexprError::UnexpectedEof { offset: self.pos }),
                Some(')') => {
                    self.bump();
                    return Ok(Sexpr::List(items));
                }
                Some(_) => items.push(self.read(depth + 1)?),
            }
        }
    }

    fn read_string(&mut self, start: usize) -> Result<Sexpr, SexprError> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(SexprError::UnterminatedString { offset: start }),
                Some('"') => return Ok(Sexpr::Str(value)),
                Some('\\') => match self.bump() {
                    Some(escaped) => value.push(escaped),
                    None => return Err(SexprError::UnterminatedString { offset: start }),
                },
                Some(ch) => value.push(ch),
            }
        }
    }

    fn read_atom(&mut self) -> Result<Sexpr, SexprError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            match ch {
                '(' | ')' | '"' | '\'' | ';' => break,
                c if c.is_whitespace() => break,
                '|' => {
                    let bar = self.pos;
                    self.bump();
                    loop {
                        match self.bump() {
                            None => return Err(SexprError::UnterminatedSymbol { offset: bar }),
                            Some('|') => break,
                            Some(_) => {}
                        }
                    }
                }
                '\\' => {
                    self.bump();
                    self.bump();
                }
                _ => {
                    self.bump();
                }
            }
        }
        let token = &self.text[start..self.pos];
        Ok(parse_integer(token).map_or_else(|| Sexpr::symbol(token), Sexpr::Int))
    }
}

/// Integers are an optional sign followed by decimal digits. Values outside
/// `i64` fall back to symbols so their text survives.
fn parse_integer(token: &str) -> Option<i64> {
    let digits = token.strip_prefix(['-', '+']).unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}
