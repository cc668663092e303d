//! Conversion between host values and the target's byte layout.
//!
//! The target is little endian. Aggregates are laid out at their declared field offsets, padding
//! bytes are zero.

use std::rc::Rc;

use super::value::{StructValue, TargetPtr, Value};
use crate::error::{Error, Result};
use crate::symbols::{FunctionSignature, ScalarEncoding, TypeDescriptor, TypeKind};

/// Checks a call's arguments against the function's signature, without touching the target.
pub fn check_arguments(signature: &FunctionSignature, arguments: &[Value]) -> Result<()> {
    let expected = signature.parameters.len();
    if arguments.len() < expected || (arguments.len() > expected && !signature.variadic) {
        return Err(Error::ArgumentType(format!(
            "`{}` takes {} argument{}, {} given",
            signature,
            expected,
            if expected == 1 { "" } else { "s" },
            arguments.len()
        )));
    }
    for (index, (parameter, value)) in signature.parameters.iter().zip(arguments).enumerate() {
        check(&parameter.ty, value).map_err(|err| match err {
            Error::ArgumentType(message) => Error::ArgumentType(format!(
                "argument {} of `{}`: {}",
                index + 1,
                signature.name,
                message
            )),
            other => other,
        })?;
    }
    for value in &arguments[expected..] {
        host_layout(value)?;
    }
    Ok(())
}

/// Checks that `value` can be stored in a `ty`.
pub fn check(ty: &TypeDescriptor, value: &Value) -> Result<()> {
    let mismatch = || {
        Err(Error::ArgumentType(format!(
            "a {} does not fit `{}`",
            value.get_type(),
            ty.name
        )))
    };
    match (&ty.kind, value) {
        (TypeKind::Void, _) => mismatch(),
        (_, Value::Bytes(bytes)) if !ty.is_pointer() => {
            if bytes.len() as u64 == ty.size {
                Ok(())
            } else {
                Err(Error::ArgumentType(format!(
                    "`{}` takes {} bytes, got {}",
                    ty.name,
                    ty.size,
                    bytes.len()
                )))
            }
        }
        (TypeKind::Scalar(ScalarEncoding::Float), Value::Float(_))
        | (TypeKind::Scalar(ScalarEncoding::Float), Value::Unsigned(_))
        | (TypeKind::Scalar(ScalarEncoding::Float), Value::Signed(_)) => {
            if ty.size == 4 || ty.size == 8 {
                Ok(())
            } else {
                mismatch()
            }
        }
        (TypeKind::Scalar(ScalarEncoding::Bool), Value::Bool(_)) => Ok(()),
        (TypeKind::Scalar(encoding), Value::Unsigned(_))
        | (TypeKind::Scalar(encoding), Value::Signed(_))
        | (TypeKind::Scalar(encoding), Value::Bool(_))
            if *encoding != ScalarEncoding::Float =>
        {
            if fits(ty.size, *encoding, value) {
                Ok(())
            } else {
                Err(Error::ArgumentType(format!(
                    "{} does not fit in `{}` ({} bytes)",
                    value, ty.name, ty.size
                )))
            }
        }
        (TypeKind::Pointer { .. }, Value::Pointer(_)) => Ok(()),
        (TypeKind::Pointer { .. }, Value::Unsigned(address)) => {
            if *address <= u64::from(u32::MAX) {
                Ok(())
            } else {
                mismatch()
            }
        }
        (TypeKind::Pointer { .. }, Value::Bytes(_)) | (TypeKind::Pointer { .. }, Value::Text(_)) => {
            Ok(())
        }
        (TypeKind::Pointer { pointee }, Value::Ref(inner)) => match pointee {
            Some(pointee) if !pointee.is_void() => check(pointee, inner),
            _ => host_layout(inner).map(|_| ()),
        },
        (TypeKind::Aggregate { fields }, Value::Struct(value)) => {
            for (name, _) in &value.fields {
                if !fields.iter().any(|f| &f.name == name) {
                    return Err(Error::ArgumentType(format!(
                        "`{}` has no field `{}`",
                        ty.name, name
                    )));
                }
            }
            for field in fields {
                match value.get(&field.name) {
                    Some(v) => check(&field.ty, v)?,
                    None => {
                        return Err(Error::ArgumentType(format!(
                            "field `{}` of `{}` is missing",
                            field.name, ty.name
                        )))
                    }
                }
            }
            Ok(())
        }
        (TypeKind::Array { element, count }, Value::Array(values)) => {
            if values.len() as u64 != *count {
                return Err(Error::ArgumentType(format!(
                    "`{}` has {} elements, got {}",
                    ty.name,
                    count,
                    values.len()
                )));
            }
            values.iter().try_for_each(|v| check(element, v))
        }
        (TypeKind::Array { count, .. }, Value::Text(text)) => {
            if text.len() as u64 <= *count {
                Ok(())
            } else {
                mismatch()
            }
        }
        _ => mismatch(),
    }
}

fn fits(size: u64, encoding: ScalarEncoding, value: &Value) -> bool {
    let bits = (size * 8) as u32;
    if size == 0 || size > 8 {
        return false;
    }
    match value {
        Value::Bool(_) => true,
        Value::Unsigned(v) => bits >= 64 || *v < (1u64 << bits),
        Value::Signed(v) => match encoding {
            ScalarEncoding::Signed => {
                bits >= 64 || (*v >= -(1i64 << (bits - 1)) && *v < (1i64 << (bits - 1)))
            }
            _ => *v >= 0 && (bits >= 64 || (*v as u64) < (1u64 << bits)),
        },
        _ => false,
    }
}

/// Encodes `value` as a `ty`.
///
/// Description:
///
/// * `ty` - The target type, `check` must have accepted the value.
/// * `value` - The host value.
/// * `place` - Copies bytes into scratch memory and returns their address, needed for values
/// passed by pointer. Its arguments are the bytes and their alignment.
pub fn encode<F>(ty: &TypeDescriptor, value: &Value, place: &mut F) -> Result<Vec<u8>>
where
    F: FnMut(&[u8], u32) -> Result<u32>,
{
    let size = ty.size as usize;
    let bytes = match (&ty.kind, value) {
        (_, Value::Bytes(bytes)) if !ty.is_pointer() => bytes.clone(),
        (TypeKind::Scalar(ScalarEncoding::Float), value) => {
            let v = value.as_f64().ok_or_else(|| type_error(ty, value))?;
            if size == 4 {
                (v as f32).to_le_bytes().to_vec()
            } else {
                v.to_le_bytes().to_vec()
            }
        }
        (TypeKind::Scalar(_), value) => {
            let v = value.as_u64().ok_or_else(|| type_error(ty, value))?;
            v.to_le_bytes()[..size.min(8)].to_vec()
        }
        (TypeKind::Pointer { pointee }, value) => {
            let address = match value {
                Value::Pointer(p) => p.address(),
                Value::Unsigned(address) => *address as u32,
                Value::Bytes(bytes) => place(bytes, 4)?,
                Value::Text(text) => {
                    let mut bytes = text.as_bytes().to_vec();
                    bytes.push(0);
                    place(&bytes, 1)?
                }
                Value::Ref(inner) => match pointee {
                    Some(pointee) if !pointee.is_void() => {
                        let bytes = encode(pointee, inner, place)?;
                        place(&bytes, pointee.alignment() as u32)?
                    }
                    _ => {
                        let (bytes, alignment) = host_layout(inner)?;
                        place(&bytes, alignment)?
                    }
                },
                other => return Err(type_error(ty, other)),
            };
            address.to_le_bytes()[..size.min(4)].to_vec()
        }
        (TypeKind::Aggregate { fields }, Value::Struct(value)) => {
            let mut bytes = vec![0; size];
            for field in fields {
                let v = value
                    .get(&field.name)
                    .ok_or_else(|| type_error(&field.ty, &Value::Void))?;
                let encoded = encode(&field.ty, v, place)?;
                write_at(&mut bytes, field.offset as usize, &encoded)?;
            }
            bytes
        }
        (TypeKind::Array { element, .. }, Value::Array(values)) => {
            let mut bytes = vec![0; size];
            for (index, v) in values.iter().enumerate() {
                let encoded = encode(element, v, place)?;
                write_at(&mut bytes, index * element.size as usize, &encoded)?;
            }
            bytes
        }
        (TypeKind::Array { .. }, Value::Text(text)) => {
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(size, 0);
            bytes
        }
        (_, other) => return Err(type_error(ty, other)),
    };
    if bytes.len() != size {
        return Err(Error::ArgumentType(format!(
            "`{}` takes {} bytes, encoded {}",
            ty.name,
            size,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn write_at(bytes: &mut [u8], offset: usize, data: &[u8]) -> Result<()> {
    let end = offset + data.len();
    if end > bytes.len() {
        return Err(Error::ArgumentType(format!(
            "member at offset {} overruns its {} byte container",
            offset,
            bytes.len()
        )));
    }
    bytes[offset..end].copy_from_slice(data);
    Ok(())
}

fn type_error(ty: &TypeDescriptor, value: &Value) -> Error {
    Error::ArgumentType(format!("a {} does not fit `{}`", value.get_type(), ty.name))
}

/// The bytes and alignment of a value without a target type, as used for variadic arguments and
/// untyped references.
pub fn host_layout(value: &Value) -> Result<(Vec<u8>, u32)> {
    Ok(match value {
        Value::Unsigned(v) if *v > u64::from(u32::MAX) => (v.to_le_bytes().to_vec(), 8),
        Value::Unsigned(v) => ((*v as u32).to_le_bytes().to_vec(), 4),
        Value::Signed(v) if *v < i64::from(i32::MIN) || *v > i64::from(i32::MAX) => {
            (v.to_le_bytes().to_vec(), 8)
        }
        Value::Signed(v) => ((*v as i32).to_le_bytes().to_vec(), 4),
        // Default argument promotion turns floats into doubles.
        Value::Float(v) => (v.to_le_bytes().to_vec(), 8),
        Value::Bool(v) => ((*v as u32).to_le_bytes().to_vec(), 4),
        Value::Pointer(p) => (p.address().to_le_bytes().to_vec(), 4),
        Value::Bytes(bytes) => (bytes.clone(), 4),
        Value::Text(text) => {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            (bytes, 1)
        }
        other => {
            return Err(Error::ArgumentType(format!(
                "a {} needs a target type",
                other.get_type()
            )))
        }
    })
}

/// Decodes bytes read from the target.
pub fn decode(ty: &TypeDescriptor, bytes: &[u8]) -> Result<Value> {
    let size = ty.size as usize;
    if bytes.len() < size {
        return Err(Error::Protocol(format!(
            "`{}` needs {} bytes, got {}",
            ty.name,
            size,
            bytes.len()
        )));
    }
    let bytes = &bytes[..size];
    Ok(match &ty.kind {
        TypeKind::Void => Value::Void,
        TypeKind::Scalar(ScalarEncoding::Unsigned) => Value::Unsigned(le_u64(bytes)),
        TypeKind::Scalar(ScalarEncoding::Bool) => Value::Bool(le_u64(bytes) != 0),
        TypeKind::Scalar(ScalarEncoding::Signed) => {
            let raw = le_u64(bytes);
            let shift = 64 - (size.min(8) as u32 * 8);
            let value = if shift == 64 {
                0
            } else {
                ((raw << shift) as i64) >> shift
            };
            Value::Signed(value)
        }
        TypeKind::Scalar(ScalarEncoding::Float) => match size {
            4 => {
                let mut raw = [0; 4];
                raw.copy_from_slice(bytes);
                Value::Float(f64::from(f32::from_le_bytes(raw)))
            }
            8 => {
                let mut raw = [0; 8];
                raw.copy_from_slice(bytes);
                Value::Float(f64::from_le_bytes(raw))
            }
            _ => Value::Bytes(bytes.to_vec()),
        },
        TypeKind::Pointer { .. } => Value::Pointer(TargetPtr(le_u64(bytes) as u32)),
        TypeKind::Aggregate { fields } => {
            let mut value = StructValue::new(&ty.name);
            for field in fields {
                let start = field.offset as usize;
                let end = start + field.ty.size as usize;
                let field_bytes = bytes.get(start..end).ok_or_else(|| {
                    Error::Protocol(format!(
                        "field `{}` of `{}` lies outside the type",
                        field.name, ty.name
                    ))
                })?;
                value
                    .fields
                    .push((field.name.clone(), decode(&field.ty, field_bytes)?));
            }
            Value::Struct(value)
        }
        TypeKind::Array { element, count } => {
            let element_size = element.size as usize;
            let mut values = vec![];
            for index in 0..*count as usize {
                let start = index * element_size;
                values.push(decode(element, &bytes[start..start + element_size])?);
            }
            Value::Array(values)
        }
    })
}

fn le_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}

/// The type a host value is encoded as when nothing else is known.
pub fn host_type(value: &Value) -> Rc<TypeDescriptor> {
    match value {
        Value::Signed(_) => TypeDescriptor::scalar("int32_t", 4, ScalarEncoding::Signed),
        Value::Float(_) => TypeDescriptor::scalar("double", 8, ScalarEncoding::Float),
        Value::Bool(_) => TypeDescriptor::scalar("bool", 1, ScalarEncoding::Bool),
        Value::Pointer(_) => TypeDescriptor::pointer("void *", 4, None),
        _ => TypeDescriptor::scalar("uint32_t", 4, ScalarEncoding::Unsigned),
    }
}
