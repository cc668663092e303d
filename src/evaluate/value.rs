use std::fmt;

/// An address on the target. Returned for pointers, never dereferenced on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetPtr(pub u32);

impl TargetPtr {
    pub fn address(&self) -> u32 {
        self.0
    }

    pub fn offset(&self, bytes: u32) -> TargetPtr {
        TargetPtr(self.0.wrapping_add(bytes))
    }
}

impl fmt::Display for TargetPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A host-side value crossing the host/target boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
    Pointer(TargetPtr),

    /// Raw bytes, passed to pointer parameters by copying them into scratch memory.
    Bytes(Vec<u8>),
    /// A host value passed by reference: copied into scratch memory for the duration of a call.
    Ref(Box<Value>),

    Struct(StructValue),
    Array(Vec<Value>),

    /// Anything the debugger printed that has no better representation, e.g. an enumerator.
    Text(String),
    Void,
    OptimizedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub name: String,
    pub fields: Vec<(String, Value)>,
}

impl StructValue {
    pub fn new(name: &str) -> StructValue {
        StructValue {
            name: name.to_string(),
            fields: vec![],
        }
    }

    /// Builder style field insertion.
    pub fn with<V: Into<Value>>(mut self, name: &str, value: V) -> StructValue {
        self.fields.push((name.to_string(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl Value {
    /// Wraps a host value so it is passed by pointer.
    pub fn by_ref<V: Into<Value>>(value: V) -> Value {
        Value::Ref(Box::new(value.into()))
    }

    /// The value as an unsigned integer, if it is integral.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) => Some(*v),
            Value::Signed(v) => Some(*v as u64),
            Value::Bool(v) => Some(*v as u64),
            Value::Pointer(p) => Some(u64::from(p.0)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Unsigned(v) => Some(*v as i64),
            Value::Signed(v) => Some(*v),
            Value::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Unsigned(v) => Some(*v as f64),
            Value::Signed(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<TargetPtr> {
        match self {
            Value::Pointer(p) => Some(*p),
            Value::Unsigned(v) if *v <= u64::from(u32::MAX) => Some(TargetPtr(*v as u32)),
            _ => None,
        }
    }

    /// Looks up a struct field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(s) => s.get(name),
            _ => None,
        }
    }

    pub fn get_type(&self) -> String {
        match self {
            Value::Unsigned(_) => "unsigned".to_owned(),
            Value::Signed(_) => "signed".to_owned(),
            Value::Float(_) => "float".to_owned(),
            Value::Bool(_) => "bool".to_owned(),
            Value::Pointer(_) => "pointer".to_owned(),
            Value::Bytes(b) => format!("bytes[{}]", b.len()),
            Value::Ref(v) => format!("&{}", v.get_type()),
            Value::Struct(s) => s.name.clone(),
            Value::Array(a) => format!("array[{}]", a.len()),
            Value::Text(_) => "text".to_owned(),
            Value::Void => "void".to_owned(),
            Value::OptimizedOut => "<optimized out>".to_owned(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return match self {
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Pointer(p) => p.fmt(f),
            Value::Bytes(b) => write!(f, "{:02x?}", b),
            Value::Ref(v) => write!(f, "&{}", v),
            Value::Struct(s) => s.fmt(f),
            Value::Array(values) => write!(f, "[ {} ]", format_values(values)),
            Value::Text(t) => write!(f, "{}", t),
            Value::Void => write!(f, "void"),
            Value::OptimizedOut => write!(f, "< OptimizedOut >"),
        };
    }
}

impl fmt::Display for StructValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut res = format!("{} {{ ", self.name);
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                res = format!("{}, ", res);
            }
            res = format!("{}{}: {}", res, name, value);
        }
        write!(f, "{} }}", res)
    }
}

fn format_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<String>>()
        .join(", ")
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Value {
                Value::Unsigned(v as u64)
            }
        })*
    };
}

macro_rules! impl_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Value {
                Value::Signed(v as i64)
            }
        })*
    };
}

impl_from_unsigned!(u8, u16, u32, u64);
impl_from_signed!(i8, i16, i32, i64);

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<TargetPtr> for Value {
    fn from(p: TargetPtr) -> Value {
        Value::Pointer(p)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Value {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Value {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<StructValue> for Value {
    fn from(s: StructValue) -> Value {
        Value::Struct(s)
    }
}
