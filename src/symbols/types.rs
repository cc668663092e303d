use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarEncoding {
    Unsigned,
    Signed,
    Float,
    Bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Void,
    Scalar(ScalarEncoding),
    /// `pointee` is `None` for `void *` and for types that point back to themselves.
    Pointer { pointee: Option<Rc<TypeDescriptor>> },
    /// Structs and unions; fields are ordered by declaration.
    Aggregate { fields: Vec<Field> },
    Array { element: Rc<TypeDescriptor>, count: u64 },
}

/// Size and layout of a target type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    pub name: String,
    pub size: u64,
    pub kind: TypeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub offset: u64,
    pub ty: Rc<TypeDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: Option<String>,
    pub ty: Rc<TypeDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    pub name: String,
    pub parameters: Vec<Parameter>,
    /// `None` for `void` functions.
    pub return_type: Option<Rc<TypeDescriptor>>,
    pub variadic: bool,
}

/// A resolved name.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    pub name: String,
    pub address: u32,
    pub ty: Option<Rc<TypeDescriptor>>,
}

impl TypeDescriptor {
    pub fn scalar(name: &str, size: u64, encoding: ScalarEncoding) -> Rc<TypeDescriptor> {
        Rc::new(TypeDescriptor {
            name: name.to_string(),
            size,
            kind: TypeKind::Scalar(encoding),
        })
    }

    pub fn pointer(
        name: &str,
        size: u64,
        pointee: Option<Rc<TypeDescriptor>>,
    ) -> Rc<TypeDescriptor> {
        Rc::new(TypeDescriptor {
            name: name.to_string(),
            size,
            kind: TypeKind::Pointer { pointee },
        })
    }

    pub fn aggregate(name: &str, size: u64, fields: Vec<Field>) -> Rc<TypeDescriptor> {
        Rc::new(TypeDescriptor {
            name: name.to_string(),
            size,
            kind: TypeKind::Aggregate { fields },
        })
    }

    pub fn array(name: &str, element: Rc<TypeDescriptor>, count: u64) -> Rc<TypeDescriptor> {
        Rc::new(TypeDescriptor {
            name: name.to_string(),
            size: element.size * count,
            kind: TypeKind::Array { element, count },
        })
    }

    pub fn void() -> Rc<TypeDescriptor> {
        Rc::new(TypeDescriptor {
            name: "void".to_string(),
            size: 0,
            kind: TypeKind::Void,
        })
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, TypeKind::Scalar(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer { .. })
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, TypeKind::Aggregate { .. } | TypeKind::Array { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        match &self.kind {
            TypeKind::Aggregate { fields } => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }

    /// Natural alignment, which is the largest scalar alignment inside the type.
    pub fn alignment(&self) -> u64 {
        match &self.kind {
            TypeKind::Void => 1,
            TypeKind::Scalar(_) | TypeKind::Pointer { .. } => self.size.max(1).min(8),
            TypeKind::Aggregate { fields } => fields
                .iter()
                .map(|f| f.ty.alignment())
                .max()
                .unwrap_or(1),
            TypeKind::Array { element, .. } => element.alignment(),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            TypeKind::Aggregate { fields } => {
                write!(f, "{} {{ ", self.name)?;
                for field in fields {
                    write!(f, "{}: {} @{}, ", field.name, field.ty.name, field.offset)?;
                }
                write!(f, "}} ({} bytes)", self.size)
            }
            _ => write!(f, "{} ({} bytes)", self.name, self.size),
        }
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ret = self
            .return_type
            .as_ref()
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "void".to_string());
        write!(f, "{} {}(", ret, self.name)?;
        for (i, p) in self.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match &p.name {
                Some(name) => write!(f, "{} {}", p.ty.name, name)?,
                None => write!(f, "{}", p.ty.name)?,
            }
        }
        if self.variadic {
            write!(f, ", ...")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_alignment_follows_widest_member() {
        let u8_t = TypeDescriptor::scalar("uint8_t", 1, ScalarEncoding::Unsigned);
        let u64_t = TypeDescriptor::scalar("uint64_t", 8, ScalarEncoding::Unsigned);
        let s = TypeDescriptor::aggregate(
            "wide",
            16,
            vec![
                Field {
                    name: "tag".into(),
                    offset: 0,
                    ty: u8_t.clone(),
                },
                Field {
                    name: "value".into(),
                    offset: 8,
                    ty: u64_t,
                },
            ],
        );
        assert_eq!(s.alignment(), 8);
        assert_eq!(s.field("value").map(|f| f.offset), Some(8));
        assert!(s.is_aggregate());
        assert_eq!(TypeDescriptor::array("uint8_t[3]", u8_t, 3).size, 3);
    }
}
