//! Turns values printed by the debugger into host values.
//!
//! Handles what `-data-evaluate-expression` prints for C expressions: integers in decimal or
//! hexadecimal, characters (`97 'a'`), booleans, floats, pointers with an optional cast and symbol
//! (`(uint32_t *) 0x20000000 <global_data>`), strings, brace initialisers for structs and arrays
//! (including `<repeats N times>`) and `<optimized out>`.

use super::value::{StructValue, TargetPtr, Value};
use crate::mi::record::parse_number;

/// Parses a value. Text that is not understood is returned as `Value::Text`.
pub fn parse_value(text: &str) -> Value {
    let mut parser = ValueParser::new(text.trim());
    match parser.value() {
        Some(value) if parser.at_end() => value,
        _ => Value::Text(text.trim().to_string()),
    }
}

struct ValueParser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> ValueParser<'a> {
    fn new(text: &'a str) -> Self {
        ValueParser { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_whitespace();
        let value = match self.peek()? {
            '{' => self.aggregate()?,
            '"' => Value::Text(self.string()?),
            '(' => self.cast()?,
            '<' => {
                let annotation = self.annotation()?;
                if annotation == "optimized out" {
                    Value::OptimizedOut
                } else {
                    Value::Text(format!("<{}>", annotation))
                }
            }
            '\'' => {
                let c = self.character()?;
                Value::Unsigned(c as u64)
            }
            _ => self.scalar()?,
        };
        Some(value)
    }

    /// `(type) value`, the type decides whether the value is a pointer.
    fn cast(&mut self) -> Option<Value> {
        let start = self.pos;
        let mut depth = 0;
        for (i, c) in self.rest().char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let cast = &self.text[start + 1..start + i];
                        self.pos = start + i + 1;
                        let value = self.value()?;
                        if cast.contains('*') {
                            if let Some(address) = value.as_u64() {
                                return Some(Value::Pointer(TargetPtr(address as u32)));
                            }
                        }
                        return Some(value);
                    }
                }
                _ => (),
            }
        }
        None
    }

    fn scalar(&mut self) -> Option<Value> {
        let word_end = self
            .rest()
            .find(|c: char| c == ',' || c == '}' || c.is_whitespace())
            .unwrap_or_else(|| self.rest().len());
        let word = &self.rest()[..word_end];
        if word.is_empty() {
            return None;
        }
        self.pos += word_end;

        let value = match word {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "void" => Value::Void,
            _ => number(word).unwrap_or_else(|| Value::Text(word.to_string())),
        };

        // Decorations after a number: `97 'a'`, `0x8000200 <main>`, `0x8000400 "text"`.
        let save = self.pos;
        self.skip_whitespace();
        match self.peek() {
            Some('\'') if value.as_u64().is_some() => {
                self.character()?;
                Some(value)
            }
            Some('<') if word.starts_with("0x") => {
                let annotation = self.annotation()?;
                if annotation.starts_with("repeats ") {
                    // Handled by the aggregate parser.
                    self.pos = save;
                    return Some(value);
                }
                Some(value.as_u64().map_or(value, |a| Value::Pointer(TargetPtr(a as u32))))
            }
            Some('"') if word.starts_with("0x") => {
                self.string()?;
                Some(value.as_u64().map_or(value, |a| Value::Pointer(TargetPtr(a as u32))))
            }
            _ => {
                self.pos = save;
                Some(value)
            }
        }
    }

    /// `<...>` without the brackets.
    fn annotation(&mut self) -> Option<String> {
        if !self.eat("<") {
            return None;
        }
        let end = self.rest().find('>')?;
        let inner = self.rest()[..end].to_string();
        self.pos += end + 1;
        Some(inner)
    }

    fn character(&mut self) -> Option<char> {
        if !self.eat("'") {
            return None;
        }
        let c = match self.peek()? {
            '\\' => {
                self.pos += 1;
                self.escape()?
            }
            c => {
                self.pos += c.len_utf8();
                c
            }
        };
        if !self.eat("'") {
            return None;
        }
        Some(c)
    }

    fn string(&mut self) -> Option<String> {
        if !self.eat("\"") {
            return None;
        }
        let mut out = String::new();
        loop {
            let c = self.peek()?;
            self.pos += c.len_utf8();
            match c {
                '"' => break,
                '\\' => out.push(self.escape()?),
                c => out.push(c),
            }
        }
        // Long strings are printed as `"abc"...`.
        self.eat("...");
        Some(out)
    }

    fn escape(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'a' => '\u{7}',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            'e' => '\u{1b}',
            '0'..='7' => {
                let mut value = c.to_digit(8)?;
                for _ in 0..2 {
                    match self.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            self.pos += 1;
                        }
                        None => break,
                    }
                }
                std::char::from_u32(value)?
            }
            other => other,
        })
    }

    fn aggregate(&mut self) -> Option<Value> {
        self.eat("{");
        let mut fields: Vec<(String, Value)> = vec![];
        let mut elements: Vec<Value> = vec![];
        loop {
            self.skip_whitespace();
            if self.eat("}") {
                break;
            }
            if self.eat("...") {
                continue;
            }
            match self.field_name() {
                Some(name) => {
                    let value = self.value()?;
                    fields.push((name, value));
                }
                None => {
                    let value = self.value()?;
                    let repeat = self.repeats();
                    for _ in 1..repeat {
                        elements.push(value.clone());
                    }
                    elements.push(value);
                }
            }
            self.skip_whitespace();
            if !self.eat(",") {
                self.skip_whitespace();
                self.eat("...");
                if !self.eat("}") {
                    return None;
                }
                break;
            }
        }
        if !fields.is_empty() {
            return Some(Value::Struct(StructValue {
                name: String::new(),
                fields,
            }));
        }
        Some(Value::Array(elements))
    }

    /// `name = ` in front of a struct member.
    fn field_name(&mut self) -> Option<String> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or_else(|| rest.len());
        if end == 0 || rest[..1].chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let after = &rest[end..];
        if !after.starts_with(" = ") {
            return None;
        }
        let name = rest[..end].to_string();
        self.pos += end + 3;
        Some(name)
    }

    /// ` <repeats 15 times>` after an element.
    fn repeats(&mut self) -> usize {
        let save = self.pos;
        self.skip_whitespace();
        if let Some(annotation) = self.annotation() {
            if let Some(count) = annotation
                .strip_prefix("repeats ")
                .and_then(|r| r.strip_suffix(" times"))
                .and_then(|n| n.parse().ok())
            {
                return count;
            }
        }
        self.pos = save;
        1
    }
}

fn number(word: &str) -> Option<Value> {
    if let Some(digits) = word.strip_prefix('-') {
        if let Some(n) = parse_number(digits) {
            return Some(Value::Signed((n as i64).wrapping_neg()));
        }
    } else if let Some(n) = parse_number(word) {
        return Some(Value::Unsigned(n));
    }
    match word {
        "inf" => return Some(Value::Float(f64::INFINITY)),
        "-inf" => return Some(Value::Float(f64::NEG_INFINITY)),
        _ => (),
    }
    if word.starts_with("nan(") || word.starts_with("-nan(") {
        return Some(Value::Float(f64::NAN));
    }
    word.parse::<f64>().ok().map(Value::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalars() {
        assert_eq!(parse_value("42"), Value::Unsigned(42));
        assert_eq!(parse_value("-7"), Value::Signed(-7));
        assert_eq!(parse_value("0x2a"), Value::Unsigned(42));
        assert_eq!(parse_value("97 'a'"), Value::Unsigned(97));
        assert_eq!(parse_value("0 '\\000'"), Value::Unsigned(0));
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("1.5"), Value::Float(1.5));
        assert_eq!(parse_value("<optimized out>"), Value::OptimizedOut);
        assert_eq!(parse_value("RED"), Value::Text("RED".to_string()));
    }

    #[test]
    fn parses_pointers() {
        assert_eq!(
            parse_value("(uint32_t *) 0x20000000 <global_data>"),
            Value::Pointer(TargetPtr(0x2000_0000))
        );
        assert_eq!(
            parse_value("(uint32_t (*)(void)) 0x8000200 <example_GetA>"),
            Value::Pointer(TargetPtr(0x0800_0200))
        );
        assert_eq!(
            parse_value("0x8000400 \"hello\""),
            Value::Pointer(TargetPtr(0x0800_0400))
        );
    }

    #[test]
    fn parses_aggregates() {
        let value = parse_value("{paddA = 0 '\\000', a = 31, paddB = 0 '\\000', b = 11, sum = 42}");
        assert_eq!(value.field("a"), Some(&Value::Unsigned(31)));
        assert_eq!(value.field("sum"), Some(&Value::Unsigned(42)));

        assert_eq!(
            parse_value("{1, 2, 3}"),
            Value::Array(vec![
                Value::Unsigned(1),
                Value::Unsigned(2),
                Value::Unsigned(3)
            ])
        );
        match parse_value("{0 <repeats 16 times>, 5}") {
            Value::Array(values) => {
                assert_eq!(values.len(), 17);
                assert_eq!(values[16], Value::Unsigned(5));
            }
            other => panic!("unexpected {:?}", other),
        }
        let nested = parse_value("{inner = {x = -1, y = 2}, data = \"ab\"}");
        assert_eq!(
            nested.field("inner").and_then(|i| i.field("x")),
            Some(&Value::Signed(-1))
        );
        assert_eq!(nested.field("data"), Some(&Value::Text("ab".to_string())));
    }

    #[test]
    fn falls_back_to_text() {
        assert_eq!(
            parse_value("{a = 1"),
            Value::Text("{a = 1".to_string())
        );
    }
}
