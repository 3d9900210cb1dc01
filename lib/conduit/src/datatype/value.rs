use crate::datatype::{AtomicType, CompoundType, DataType, TypeId, MAX_READ_DEPTH};
use crate::error::{ErrorKind, NetError, NetResult};
use std::fmt::Write;

/// In-memory representation of a value described by a [`DataType`]
/// dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Char(u8),
    SInt8(i8),
    SInt16(i16),
    SInt32(i32),
    SInt64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    VarInt(u32),
    String(String),
    Pointer(Option<Box<Value>>),
    FixedArray(Vec<Value>),
    Vector(Vec<Value>),
    Structure(Vec<Value>),
}

impl DataType {
    /// Constructs the default-initialized value of the given type:
    /// zeros, empty strings and vectors, null pointers.
    pub fn create_value(&self, id: TypeId) -> NetResult<Value> {
        self.create_value_depth(id, 0)
    }

    fn create_value_depth(&self, id: TypeId, depth: usize) -> NetResult<Value> {
        if depth > MAX_READ_DEPTH {
            return Err(NetError::Fatal(ErrorKind::DepthOverflow));
        }
        if let Some(atomic) = AtomicType::from_id(id) {
            return Ok(match atomic {
                AtomicType::Bool => Value::Bool(false),
                AtomicType::Char => Value::Char(0),
                AtomicType::SInt8 => Value::SInt8(0),
                AtomicType::SInt16 => Value::SInt16(0),
                AtomicType::SInt32 => Value::SInt32(0),
                AtomicType::SInt64 => Value::SInt64(0),
                AtomicType::UInt8 => Value::UInt8(0),
                AtomicType::UInt16 => Value::UInt16(0),
                AtomicType::UInt32 => Value::UInt32(0),
                AtomicType::UInt64 => Value::UInt64(0),
                AtomicType::Float32 => Value::Float32(0.0),
                AtomicType::Float64 => Value::Float64(0.0),
                AtomicType::VarInt => Value::VarInt(0),
                AtomicType::String => Value::String(String::new()),
            });
        }
        match self.compound(id)? {
            CompoundType::Pointer { .. } => Ok(Value::Pointer(None)),
            CompoundType::FixedArray {
                num_elements,
                element_type,
            } => {
                let (count, element) = (*num_elements, *element_type);
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(self.create_value_depth(element, depth + 1)?);
                }
                Ok(Value::FixedArray(values))
            }
            CompoundType::Vector { .. } => Ok(Value::Vector(Vec::new())),
            CompoundType::Structure { elements } => {
                let element_types: Vec<TypeId> =
                    elements.iter().map(|element| element.element_type).collect();
                let mut values = Vec::with_capacity(element_types.len());
                for element in element_types {
                    values.push(self.create_value_depth(element, depth + 1)?);
                }
                Ok(Value::Structure(values))
            }
        }
    }

    /// Verifies that a value matches its declared type: variant kinds,
    /// fixed-array lengths, vector size limits.
    pub fn check_value(&self, id: TypeId, value: &Value) -> NetResult<()> {
        self.check_value_depth(id, value, 0)
    }

    fn check_value_depth(&self, id: TypeId, value: &Value, depth: usize) -> NetResult<()> {
        if depth > MAX_READ_DEPTH {
            return Err(NetError::Fatal(ErrorKind::DepthOverflow));
        }
        let mismatch = || Err(NetError::Fatal(ErrorKind::TypeMismatch));
        if let Some(atomic) = AtomicType::from_id(id) {
            let matches = matches!(
                (atomic, value),
                (AtomicType::Bool, Value::Bool(_))
                    | (AtomicType::Char, Value::Char(_))
                    | (AtomicType::SInt8, Value::SInt8(_))
                    | (AtomicType::SInt16, Value::SInt16(_))
                    | (AtomicType::SInt32, Value::SInt32(_))
                    | (AtomicType::SInt64, Value::SInt64(_))
                    | (AtomicType::UInt8, Value::UInt8(_))
                    | (AtomicType::UInt16, Value::UInt16(_))
                    | (AtomicType::UInt32, Value::UInt32(_))
                    | (AtomicType::UInt64, Value::UInt64(_))
                    | (AtomicType::Float32, Value::Float32(_))
                    | (AtomicType::Float64, Value::Float64(_))
                    | (AtomicType::VarInt, Value::VarInt(_))
                    | (AtomicType::String, Value::String(_))
            );
            return if matches { Ok(()) } else { mismatch() };
        }
        match (self.compound(id)?, value) {
            (CompoundType::Pointer { .. }, Value::Pointer(None)) => Ok(()),
            (CompoundType::Pointer { element_type }, Value::Pointer(Some(target))) => {
                self.check_value_depth(*element_type, target, depth + 1)
            }
            (
                CompoundType::FixedArray {
                    num_elements,
                    element_type,
                },
                Value::FixedArray(values),
            ) => {
                if values.len() != *num_elements {
                    return mismatch();
                }
                for element in values {
                    self.check_value_depth(*element_type, element, depth + 1)?;
                }
                Ok(())
            }
            (CompoundType::Vector { element_type }, Value::Vector(values)) => {
                if values.len() > u32::MAX as usize {
                    return Err(NetError::Fatal(ErrorKind::SizeOverflow));
                }
                for element in values {
                    self.check_value_depth(*element_type, element, depth + 1)?;
                }
                Ok(())
            }
            (CompoundType::Structure { elements }, Value::Structure(values)) => {
                if values.len() != elements.len() {
                    return mismatch();
                }
                for (element, value) in elements.iter().zip(values) {
                    self.check_value_depth(element.element_type, value, depth + 1)?;
                }
                Ok(())
            }
            _ => mismatch(),
        }
    }
}

/// Renders a value for the operator console.
pub fn format_value(value: &Value) -> String {
    let mut out = String::new();
    append_value(&mut out, value);
    out
}

fn append_value(out: &mut String, value: &Value) {
    match value {
        Value::Bool(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::Char(v) => {
            let _ = write!(out, "'{}'", *v as char);
        }
        Value::SInt8(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::SInt16(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::SInt32(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::SInt64(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::UInt8(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::UInt16(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::UInt32(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::UInt64(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::Float32(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::Float64(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::VarInt(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::String(v) => {
            let _ = write!(out, "{:?}", v);
        }
        Value::Pointer(None) => out.push_str("null"),
        Value::Pointer(Some(target)) => {
            out.push_str("-> ");
            append_value(out, target);
        }
        Value::FixedArray(values) | Value::Vector(values) => {
            out.push('[');
            for (i, element) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                append_value(out, element);
            }
            out.push(']');
        }
        Value::Structure(values) => {
            out.push('{');
            for (i, element) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                append_value(out, element);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_value_construction() {
        let mut dict = DataType::new();
        let array = dict.add_fixed_array(2, AtomicType::UInt16.id()).unwrap();
        let structure = dict
            .add_structure(&[array, AtomicType::String.id()])
            .unwrap();

        let value = dict.create_value(structure).unwrap();
        assert_eq!(
            value,
            Value::Structure(vec![
                Value::FixedArray(vec![Value::UInt16(0), Value::UInt16(0)]),
                Value::String(String::new()),
            ])
        );
        dict.check_value(structure, &value).unwrap();
    }

    #[test]
    fn test_check_value_rejects_wrong_shape() {
        let mut dict = DataType::new();
        let array = dict.add_fixed_array(2, AtomicType::UInt16.id()).unwrap();

        assert!(dict
            .check_value(array, &Value::FixedArray(vec![Value::UInt16(1)]))
            .is_err());
        assert!(dict.check_value(array, &Value::UInt16(1)).is_err());
        assert!(dict
            .check_value(AtomicType::Bool.id(), &Value::UInt8(1))
            .is_err());
    }

    #[test]
    fn test_format_value_nested() {
        let value = Value::Structure(vec![
            Value::UInt32(5),
            Value::Vector(vec![Value::Float32(1.5), Value::Float32(2.5)]),
            Value::Pointer(Some(Box::new(Value::String("end".to_owned())))),
        ]);
        assert_eq!(format_value(&value), "{5, [1.5, 2.5], -> \"end\"}");
    }
}
