//! Field and method descriptors.
//!
//! Descriptors drive slot accounting: how many operand slots a call
//! consumes, how many a field or return value occupies and how array
//! elements are packed.
use std::sync::LazyLock;

use regex::Regex;

use crate::runtime::{Result, RuntimeError};

static METHOD_DESCRIPTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(([^\)]*)\)(.+)$").expect("method descriptor pattern")
});

/// Primitive and reference types of the JVM type system.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
    Object,
    Array,
}

/// JVM value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub t: BaseTypeKind,
    /// Element type of an array.
    pub sub_t: Option<Box<Type>>,
    /// Internal class name of an object type.
    pub class_name: Option<String>,
}

impl Type {
    const fn base(t: BaseTypeKind) -> Self {
        Self {
            t,
            sub_t: None,
            class_name: None,
        }
    }

    /// Returns the size in slots of a given type.
    pub const fn size(&self) -> usize {
        match self.t {
            BaseTypeKind::Long | BaseTypeKind::Double => 2,
            BaseTypeKind::Void => 0,
            _ => 1,
        }
    }

    /// Decode the type at the start of `descriptor`, returning it with the
    /// number of characters it spans.
    pub fn decode(descriptor: &str) -> Result<(Type, usize)> {
        let invalid = || {
            RuntimeError::malformed(format!("invalid type descriptor {descriptor:?}"))
        };
        let first = descriptor.chars().next().ok_or_else(invalid)?;
        let t = match first {
            'Z' => BaseTypeKind::Boolean,
            'B' => BaseTypeKind::Byte,
            'C' => BaseTypeKind::Char,
            'S' => BaseTypeKind::Short,
            'I' => BaseTypeKind::Int,
            'J' => BaseTypeKind::Long,
            'F' => BaseTypeKind::Float,
            'D' => BaseTypeKind::Double,
            'V' => BaseTypeKind::Void,
            'L' => {
                let end = descriptor.find(';').ok_or_else(invalid)?;
                let t = Type {
                    t: BaseTypeKind::Object,
                    sub_t: None,
                    class_name: Some(descriptor[1..end].to_string()),
                };
                return Ok((t, end + 1));
            }
            '[' => {
                let (element, len) = Self::decode(&descriptor[1..])?;
                if element.t == BaseTypeKind::Void {
                    return Err(invalid());
                }
                let t = Type {
                    t: BaseTypeKind::Array,
                    sub_t: Some(Box::new(element)),
                    class_name: None,
                };
                return Ok((t, len + 1));
            }
            _ => return Err(invalid()),
        };
        Ok((Type::base(t), 1))
    }

    /// Decode a complete field descriptor.
    pub fn parse(descriptor: &str) -> Result<Type> {
        let (t, len) = Self::decode(descriptor)?;
        if len != descriptor.len() {
            return Err(RuntimeError::malformed(format!(
                "trailing characters in descriptor {descriptor:?}"
            )));
        }
        Ok(t)
    }
}

/// Parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub arg_types: Vec<Type>,
    pub return_type: Type,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let caps = METHOD_DESCRIPTOR.captures(descriptor).ok_or_else(|| {
            RuntimeError::malformed(format!("invalid method descriptor {descriptor:?}"))
        })?;
        let mut args = caps.get(1).map_or("", |m| m.as_str());
        let return_type = Type::parse(caps.get(2).map_or("", |m| m.as_str()))?;

        let mut arg_types = Vec::new();
        while !args.is_empty() {
            let (t, len) = Type::decode(args)?;
            if t.t == BaseTypeKind::Void {
                return Err(RuntimeError::malformed(format!(
                    "void parameter in {descriptor:?}"
                )));
            }
            arg_types.push(t);
            args = &args[len..];
        }
        Ok(Self {
            arg_types,
            return_type,
        })
    }

    /// Operand slots taken by the declared parameters, receiver excluded.
    pub fn arg_slots(&self) -> usize {
        self.arg_types.iter().map(Type::size).sum()
    }

    pub fn return_slots(&self) -> usize {
        self.return_type.size()
    }
}

/// Slots taken by a field of the given descriptor.
pub fn field_slot_count(descriptor: &str) -> usize {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// Element layout of an array class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArrayKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl ArrayKind {
    /// Array kind for an array class name such as `[I` or `[[Ljava/lang/String;`.
    pub fn from_class_name(name: &str) -> Option<ArrayKind> {
        let element = name.strip_prefix('[')?;
        Some(match element.as_bytes().first()? {
            b'Z' => ArrayKind::Boolean,
            b'B' => ArrayKind::Byte,
            b'C' => ArrayKind::Char,
            b'S' => ArrayKind::Short,
            b'I' => ArrayKind::Int,
            b'J' => ArrayKind::Long,
            b'F' => ArrayKind::Float,
            b'D' => ArrayKind::Double,
            b'L' | b'[' => ArrayKind::Reference,
            _ => return None,
        })
    }

    /// Array class name for a `newarray` type code.
    pub fn class_name_for_atype(atype: u8) -> Option<&'static str> {
        Some(match atype {
            4 => "[Z",
            5 => "[C",
            6 => "[F",
            7 => "[D",
            8 => "[B",
            9 => "[S",
            10 => "[I",
            11 => "[J",
            _ => return None,
        })
    }

    /// Number of data slots needed for `count` elements.
    pub const fn data_slots(self, count: usize) -> usize {
        match self {
            ArrayKind::Boolean | ArrayKind::Byte => count.div_ceil(4),
            ArrayKind::Char | ArrayKind::Short => count.div_ceil(2),
            ArrayKind::Long | ArrayKind::Double => count * 2,
            ArrayKind::Int | ArrayKind::Float | ArrayKind::Reference => count,
        }
    }
}
