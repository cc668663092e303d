//! Type information recovered from the debugger's own output, used when the image's DWARF
//! information is not available locally.

use std::rc::Rc;

use super::types::{Field, ScalarEncoding, TypeDescriptor};
use crate::mi::record::parse_number;

/// A member line of `ptype/o` output.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    /// Offset from the start of the outermost type.
    pub offset: u64,
    pub size: u64,
    pub ty: DeclaredType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeclaredType {
    /// The type as written, e.g. `uint32_t *`.
    Named(String),
    /// A struct or union printed inline.
    Nested { header: String, fields: Vec<Declaration> },
}

/// Parsed `ptype/o` output.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    /// Text after `type = `, without a trailing `{`.
    pub header: String,
    pub size: Option<u64>,
    pub fields: Vec<Declaration>,
    /// Declarator after the closing brace, `*` for a pointer to the printed struct.
    pub suffix: String,
}

impl Layout {
    pub fn is_aggregate(&self) -> bool {
        (self.header.starts_with("struct") || self.header.starts_with("union"))
            && self.suffix.is_empty()
    }

    /// True if the printed struct is only the target of a pointer.
    pub fn is_pointer_to_aggregate(&self) -> bool {
        self.suffix.starts_with('*')
    }
}

/// Extracts the first hexadecimal number of a value such as `(int (*)(void)) 0x8000201 <f>`.
pub fn parse_address(value: &str) -> Option<u32> {
    let start = value.find("0x")?;
    let digits: String = value[start + 2..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    u32::from_str_radix(&digits, 16).ok()
}

/// Accepts `0x8000200`, `*0x8000200` and decimal addresses.
pub fn parse_location_literal(location: &str) -> Option<u32> {
    let location = location.trim();
    let location = location.strip_prefix('*').unwrap_or(location).trim();
    parse_number(location).map(|n| n as u32)
}

/// The leading number of a value such as `24` or `4 '\004'`.
pub fn parse_size(value: &str) -> Option<u64> {
    value.split_whitespace().next().and_then(parse_number)
}

/// Splits a function type like `uint32_t (uint32_t, uint8_t *)` into its return type, its
/// parameter types and whether it is variadic.
pub fn parse_function_type(text: &str) -> Option<(String, Vec<String>, bool)> {
    let text = text.trim();
    if !text.ends_with(')') {
        return None;
    }
    let bytes = text.as_bytes();
    let mut depth = 0;
    let mut open = None;
    for (i, c) in bytes.iter().enumerate().rev() {
        match c {
            b')' => depth += 1,
            b'(' => {
                depth -= 1;
                if depth == 0 {
                    open = Some(i);
                    break;
                }
            }
            _ => (),
        }
    }
    let open = open?;
    let ret = text[..open].trim().to_string();
    let inner = &text[open + 1..text.len() - 1];

    let mut params = vec![];
    let mut variadic = false;
    let mut depth = 0;
    let mut start = 0;
    let mut pieces = vec![];
    for (i, c) in inner.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                pieces.push(&inner[start..i]);
                start = i + 1;
            }
            _ => (),
        }
    }
    pieces.push(&inner[start..]);
    for piece in pieces {
        let piece = piece.trim();
        match piece {
            "" | "void" => (),
            "..." => variadic = true,
            other => params.push(other.to_string()),
        }
    }
    Some((ret, params, variadic))
}

/// The text after `type = ` in `ptype`/`whatis` output.
pub fn parse_type_header(text: &str) -> Option<String> {
    let line = text.lines().find(|l| l.contains("type = "))?;
    let start = line.find("type = ")? + "type = ".len();
    Some(line[start..].trim().trim_end_matches('{').trim().to_string())
}

/// Parses the output of `ptype/o`.
pub fn parse_layout(text: &str) -> Option<Layout> {
    let header = parse_type_header(text)?;
    let mut lines = text.lines().skip_while(|l| !l.contains("type = ")).skip(1);
    let (fields, closing) = parse_block(&mut lines);
    let suffix = closing
        .unwrap_or("")
        .trim_start_matches('}')
        .trim()
        .to_string();
    let size = text
        .lines()
        .rev()
        .find(|l| l.contains("total size (bytes):"))
        .and_then(|l| {
            let start = l.find(':')? + 1;
            parse_size(l[start..].trim().trim_end_matches("*/"))
        });
    Some(Layout {
        header,
        size,
        fields,
        suffix,
    })
}

/// Parses member lines up to the closing `}` of the block, which is returned as well.
fn parse_block<'a, I>(lines: &mut I) -> (Vec<Declaration>, Option<&'a str>)
where
    I: Iterator<Item = &'a str>,
{
    let mut fields = vec![];
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed.starts_with('}') {
            return (fields, Some(trimmed));
        }
        let (offset, size, declaration) = match split_member_line(trimmed) {
            Some(parts) => parts,
            None => continue,
        };
        if let Some(header) = declaration.strip_suffix('{') {
            let (nested, closing) = parse_block(lines);
            // `} name;`
            let name = closing
                .unwrap_or("")
                .trim_start_matches('}')
                .trim()
                .trim_end_matches(';')
                .trim()
                .to_string();
            fields.push(Declaration {
                name,
                offset,
                size,
                ty: DeclaredType::Nested {
                    header: header.trim().to_string(),
                    fields: nested,
                },
            });
            continue;
        }
        if let Some((ty, name)) = split_declaration(declaration) {
            fields.push(Declaration {
                name,
                offset,
                size,
                ty: DeclaredType::Named(ty),
            });
        }
    }
    (fields, None)
}

/// `/*    4      |       4 */    uint32_t a;` into offset, size and declaration.
fn split_member_line(line: &str) -> Option<(u64, u64, &str)> {
    if !line.starts_with("/*") {
        return None;
    }
    let end = line.find("*/")?;
    let comment = &line[2..end];
    let (offset, size) = {
        let mut parts = comment.split('|');
        let offset = parts.next()?.trim();
        let size = parts.next()?.trim();
        // Bitfields print `offset: bit`.
        let offset = offset.split(':').next()?.trim();
        (parse_number(offset)?, parse_number(size)?)
    };
    Some((offset, size, line[end + 2..].trim()))
}

/// `uint32_t *ptr;` into (`uint32_t *`, `ptr`).
fn split_declaration(declaration: &str) -> Option<(String, String)> {
    let declaration = declaration.trim().trim_end_matches(';').trim();
    if declaration.is_empty() {
        return None;
    }
    // Function pointers: `void (*callback)(int)`.
    if let Some(start) = declaration.find("(*") {
        let end = declaration[start..].find(')')? + start;
        let name = declaration[start + 2..end].trim().to_string();
        let ty = format!("{}(*){}", &declaration[..start], &declaration[end + 1..]);
        return Some((ty, name));
    }
    // Arrays: `uint8_t buf[4]`.
    let (base, suffix) = match declaration.find('[') {
        Some(i) => (&declaration[..i], &declaration[i..]),
        None => (declaration, ""),
    };
    let split = base.rfind(|c: char| c.is_whitespace() || c == '*')?;
    let name = base[split + 1..].trim().to_string();
    let ty = format!("{} {}", base[..split + 1].trim(), suffix);
    Some((ty.trim().to_string(), name))
}

/// Best effort classification of a scalar type name.
pub fn classify_scalar(name: &str) -> ScalarEncoding {
    let name = name
        .trim()
        .trim_start_matches("const ")
        .trim_start_matches("volatile ")
        .trim();
    if name.contains("float") || name.contains("double") {
        return ScalarEncoding::Float;
    }
    if name == "bool" || name == "_Bool" {
        return ScalarEncoding::Bool;
    }
    if name.starts_with("unsigned")
        || name.starts_with("uint")
        || name.starts_with("size_t")
        || name.starts_with("enum")
        || name == "char"
    {
        return ScalarEncoding::Unsigned;
    }
    if name.starts_with("signed")
        || name.starts_with("int")
        || name.starts_with("short")
        || name.starts_with("long")
        || name.starts_with("ssize_t")
        || name.starts_with("ptrdiff_t")
    {
        return ScalarEncoding::Signed;
    }
    ScalarEncoding::Unsigned
}

/// Builds a descriptor from a declared type and its size as printed by `ptype/o`.
pub fn descriptor_from_text(text: &str, size: u64) -> Rc<TypeDescriptor> {
    let text = text.trim();
    if text.ends_with(']') {
        if let Some(open) = text.rfind('[') {
            let count = parse_number(&text[open + 1..text.len() - 1]).unwrap_or(0);
            let element_size = if count > 0 { size / count } else { 0 };
            let element = descriptor_from_text(&text[..open], element_size);
            return TypeDescriptor::array(text, element, count);
        }
    }
    if text.contains("(*") || text.ends_with('*') {
        return TypeDescriptor::pointer(text, if size == 0 { 4 } else { size }, None);
    }
    TypeDescriptor::scalar(text, size, classify_scalar(text))
}

/// Turns member declarations into fields, offsets relative to `base`.
pub fn fields_from_declarations(declarations: &[Declaration], base: u64) -> Vec<Field> {
    declarations
        .iter()
        .map(|d| {
            let ty = match &d.ty {
                DeclaredType::Named(text) => descriptor_from_text(text, d.size),
                DeclaredType::Nested { header, fields } => TypeDescriptor::aggregate(
                    header,
                    d.size,
                    fields_from_declarations(fields, d.offset),
                ),
            };
            Field {
                name: d.name.clone(),
                offset: d.offset.saturating_sub(base),
                ty,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::types::TypeKind;

    const MY_ADD: &str = "/* offset      |    size */  type = struct {
/*      0      |       1 */    uint8_t paddA;
/* XXX  3-byte hole      */
/*      4      |       4 */    uint32_t a;
/*      8      |       1 */    uint8_t paddB;
/* XXX  3-byte hole      */
/*     12      |       4 */    uint32_t b;
/*     16      |       1 */    uint8_t paddC;
/* XXX  3-byte hole      */
/*     20      |       4 */    uint32_t sum;

                               /* total size (bytes):   24 */
                             }
";

    #[test]
    fn parses_struct_layout() {
        let layout = parse_layout(MY_ADD).unwrap();
        assert!(layout.is_aggregate());
        assert_eq!(layout.size, Some(24));
        assert_eq!(layout.suffix, "");
        let summary: Vec<(&str, u64, u64)> = layout
            .fields
            .iter()
            .map(|d| (d.name.as_str(), d.offset, d.size))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("paddA", 0, 1),
                ("a", 4, 4),
                ("paddB", 8, 1),
                ("b", 12, 4),
                ("paddC", 16, 1),
                ("sum", 20, 4)
            ]
        );
        let fields = fields_from_declarations(&layout.fields, 0);
        assert_eq!(fields[1].ty.kind, TypeKind::Scalar(ScalarEncoding::Unsigned));
    }

    #[test]
    fn parses_nested_blocks_pointers_and_arrays() {
        let text = "/* offset      |    size */  type = struct outer {
/*      0      |       4 */    uint32_t *ptr;
/*      4      |       8 */    struct inner {
/*      4      |       4 */        int32_t x;
/*      8      |       2 */        uint8_t raw[2];
/* XXX  2-byte padding   */
                               } in;
/*     12      |       4 */    void (*callback)(int);

                               /* total size (bytes):   16 */
                             }
";
        let layout = parse_layout(text).unwrap();
        assert_eq!(layout.header, "struct outer");
        assert_eq!(layout.fields.len(), 3);
        assert_eq!(layout.fields[0].ty, DeclaredType::Named("uint32_t *".into()));
        assert_eq!(layout.fields[1].name, "in");
        assert_eq!(layout.fields[2].name, "callback");

        let fields = fields_from_declarations(&layout.fields, 0);
        assert!(fields[0].ty.is_pointer());
        let inner = &fields[1].ty;
        assert_eq!(inner.field("x").map(|f| f.offset), Some(0));
        let raw = inner.field("raw").unwrap();
        assert_eq!(raw.offset, 4);
        assert!(matches!(raw.ty.kind, TypeKind::Array { count: 2, .. }));
        assert!(fields[2].ty.is_pointer());
    }

    #[test]
    fn detects_pointer_to_struct() {
        let text = "/* offset      |    size */  type = struct {
/*      0      |       4 */    uint32_t a;

                               /* total size (bytes):    4 */
                             } *
";
        let layout = parse_layout(text).unwrap();
        assert!(!layout.is_aggregate());
        assert!(layout.is_pointer_to_aggregate());
        assert_eq!(layout.fields.len(), 1);
    }

    #[test]
    fn splits_function_types() {
        assert_eq!(
            parse_function_type("uint32_t (uint32_t, uint32_t)"),
            Some((
                "uint32_t".to_string(),
                vec!["uint32_t".to_string(), "uint32_t".to_string()],
                false
            ))
        );
        assert_eq!(
            parse_function_type("void (void)"),
            Some(("void".to_string(), vec![], false))
        );
        assert_eq!(
            parse_function_type("int (void (*)(int), const char *, ...)"),
            Some((
                "int".to_string(),
                vec!["void (*)(int)".to_string(), "const char *".to_string()],
                true
            ))
        );
        assert_eq!(parse_function_type("uint32_t"), None);
    }

    #[test]
    fn reads_addresses_and_sizes() {
        assert_eq!(
            parse_address("(uint32_t (*)(void)) 0x8000200 <example_GetA>"),
            Some(0x0800_0200)
        );
        assert_eq!(parse_address("42"), None);
        assert_eq!(parse_location_literal("*0x08000200"), Some(0x0800_0200));
        assert_eq!(parse_location_literal("example_GetA"), None);
        assert_eq!(parse_size("24"), Some(24));
        assert_eq!(classify_scalar("int16_t"), ScalarEncoding::Signed);
        assert_eq!(classify_scalar("const uint8_t"), ScalarEncoding::Unsigned);
        assert_eq!(classify_scalar("double"), ScalarEncoding::Float);
    }
}
