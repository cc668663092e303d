use std::fmt;

use crate::error::{Error, Result};

/// A value in a machine interface record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Const(String),
    Tuple(Tuple),
    List(List),
}

/// `{name=value,...}`, order preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple(pub Vec<(String, Value)>);

/// `[value,...]` or `[name=value,...]`.
#[derive(Debug, Clone, PartialEq)]
pub enum List {
    Values(Vec<Value>),
    Results(Vec<(String, Value)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*`, state changes of the target.
    Exec,
    /// `+`, progress of slow operations.
    Status,
    /// `=`, supplementary information.
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

/// One line of debugger output.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Tuple,
    },
    Async {
        token: Option<u64>,
        kind: AsyncKind,
        class: String,
        results: Tuple,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
    Prompt,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Const(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Tuple> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

impl Tuple {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_tuple(&self, name: &str) -> Option<&Tuple> {
        self.get(name).and_then(Value::as_tuple)
    }

    pub fn get_list(&self, name: &str) -> Option<&List> {
        self.get(name).and_then(Value::as_list)
    }

    /// Reads a field that holds a number, in decimal or `0x` hexadecimal.
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get_str(name).and_then(parse_number)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl List {
    /// The elements, dropping result names.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            List::Values(values) => values.iter().collect(),
            List::Results(results) => results.iter().map(|(_, v)| v).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            List::Values(values) => values.len(),
            List::Results(results) => results.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Const(s) => write!(f, "\"{}\"", escape(s)),
            Value::Tuple(t) => t.fmt(f),
            Value::List(List::Values(values)) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::List(List::Results(results)) => {
                write!(f, "[")?;
                write_results(f, results)?;
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        write_results(f, &self.0)?;
        write!(f, "}}")
    }
}

fn write_results(f: &mut fmt::Formatter, results: &[(String, Value)]) -> fmt::Result {
    for (i, (name, value)) in results.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{}={}", name, value)?;
    }
    Ok(())
}

/// Parses a decimal or `0x` prefixed hexadecimal number.
pub fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Escapes a string for use inside a c-string.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Parses one output line. Returns `None` for blank lines.
pub fn parse_record(line: &str) -> Result<Option<Record>> {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
    if line.trim().is_empty() {
        return Ok(None);
    }
    if line.trim_end() == "(gdb)" {
        return Ok(Some(Record::Prompt));
    }
    let mut parser = Parser::new(line);
    let record = parser.record()?;
    if !parser.at_end() {
        return Err(parser.error("trailing characters"));
    }
    Ok(Some(record))
}

struct Parser<'a> {
    line: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(line: &'a str) -> Self {
        Parser {
            line,
            bytes: line.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, what: &str) -> Error {
        Error::Protocol(format!("{} at column {} in `{}`", what, self.pos, self.line))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", byte as char)))
        }
    }

    fn record(&mut self) -> Result<Record> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let token = if self.pos > start {
            Some(
                self.line[start..self.pos]
                    .parse::<u64>()
                    .map_err(|_| self.error("token out of range"))?,
            )
        } else {
            None
        };

        let marker = self.peek().ok_or_else(|| self.error("missing record type"))?;
        self.pos += 1;
        match marker {
            b'^' => {
                let class = match self.word() {
                    "done" => ResultClass::Done,
                    "running" => ResultClass::Running,
                    "connected" => ResultClass::Connected,
                    "error" => ResultClass::Error,
                    "exit" => ResultClass::Exit,
                    _ => return Err(self.error("unknown result class")),
                };
                let results = self.results()?;
                Ok(Record::Result {
                    token,
                    class,
                    results,
                })
            }
            b'*' | b'+' | b'=' => {
                let kind = match marker {
                    b'*' => AsyncKind::Exec,
                    b'+' => AsyncKind::Status,
                    _ => AsyncKind::Notify,
                };
                let class = self.word().to_string();
                if class.is_empty() {
                    return Err(self.error("missing async class"));
                }
                let results = self.results()?;
                Ok(Record::Async {
                    token,
                    kind,
                    class,
                    results,
                })
            }
            b'~' | b'@' | b'&' if token.is_none() => {
                let kind = match marker {
                    b'~' => StreamKind::Console,
                    b'@' => StreamKind::Target,
                    _ => StreamKind::Log,
                };
                let text = self.c_string()?;
                Ok(Record::Stream { kind, text })
            }
            _ => {
                self.pos -= 1;
                Err(self.error("unknown record type"))
            }
        }
    }

    fn word(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'-' || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.line[start..self.pos]
    }

    /// `("," result)*` until the end of the line.
    fn results(&mut self) -> Result<Tuple> {
        let mut results = vec![];
        while self.peek() == Some(b',') {
            self.pos += 1;
            results.push(self.result()?);
        }
        Ok(Tuple(results))
    }

    fn result(&mut self) -> Result<(String, Value)> {
        let name = self.word().to_string();
        if name.is_empty() {
            return Err(self.error("expected a variable name"));
        }
        self.expect(b'=')?;
        let value = self.value()?;
        Ok((name, value))
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek() {
            Some(b'"') => Ok(Value::Const(self.c_string()?)),
            Some(b'{') => {
                self.pos += 1;
                let mut results = vec![];
                if self.peek() == Some(b'}') {
                    self.pos += 1;
                    return Ok(Value::Tuple(Tuple(results)));
                }
                loop {
                    results.push(self.result()?);
                    match self.peek() {
                        Some(b',') => self.pos += 1,
                        Some(b'}') => {
                            self.pos += 1;
                            return Ok(Value::Tuple(Tuple(results)));
                        }
                        _ => return Err(self.error("unterminated tuple")),
                    }
                }
            }
            Some(b'[') => {
                self.pos += 1;
                if self.peek() == Some(b']') {
                    self.pos += 1;
                    return Ok(Value::List(List::Values(vec![])));
                }
                let named = matches!(self.peek(), Some(c) if c.is_ascii_alphabetic());
                let mut values = vec![];
                let mut results = vec![];
                loop {
                    if named {
                        results.push(self.result()?);
                    } else {
                        values.push(self.value()?);
                    }
                    match self.peek() {
                        Some(b',') => self.pos += 1,
                        Some(b']') => {
                            self.pos += 1;
                            return Ok(Value::List(if named {
                                List::Results(results)
                            } else {
                                List::Values(values)
                            }));
                        }
                        _ => return Err(self.error("unterminated list")),
                    }
                }
            }
            _ => Err(self.error("expected a value")),
        }
    }

    fn c_string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut out: Vec<u8> = Vec::new();
        loop {
            let c = self.peek().ok_or_else(|| self.error("unterminated string"))?;
            self.pos += 1;
            match c {
                b'"' => break,
                b'\\' => {
                    let e = self.peek().ok_or_else(|| self.error("unterminated escape"))?;
                    self.pos += 1;
                    match e {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'v' => out.push(0x0b),
                        b'e' => out.push(0x1b),
                        b'0'..=b'7' => {
                            let mut code = u32::from(e - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        code = code * 8 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push(code as u8);
                        }
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
