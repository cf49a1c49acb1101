//! Data type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Supported element types
///
/// Serialized by their numpy name (`"int64"`, `"float32"`, ...) so a record
/// stays readable from other tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float16,
    Float32,
    Float64,
}

impl DType {
    /// Size in bytes
    pub const fn size(&self) -> usize {
        match self {
            DType::UInt8 | DType::Int8 => 1,
            DType::UInt16 | DType::Int16 | DType::Float16 => 2,
            DType::UInt32 | DType::Int32 | DType::Float32 => 4,
            DType::UInt64 | DType::Int64 | DType::Float64 => 8,
        }
    }

    /// numpy name of the type
    pub const fn name(&self) -> &'static str {
        match self {
            DType::UInt8 => "uint8",
            DType::Int8 => "int8",
            DType::UInt16 => "uint16",
            DType::Int16 => "int16",
            DType::UInt32 => "uint32",
            DType::Int32 => "int32",
            DType::UInt64 => "uint64",
            DType::Int64 => "int64",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    /// Parse a numpy `descr` string such as `<f4` or `|u1`.
    ///
    /// Only native little-endian (or byte-order agnostic) descriptors are
    /// accepted, since segment bytes are reinterpreted in place.
    pub fn from_numpy_descr(descr: &str) -> Option<Self> {
        let (order, code) = match (descr.get(..1), descr.get(1..)) {
            (Some(order), Some(code)) => (order, code),
            _ => return None,
        };
        match order {
            "<" | "|" | "=" => {}
            ">" if code.ends_with('1') => {}
            _ => return None,
        }
        match code {
            "u1" | "b1" => Some(DType::UInt8),
            "i1" => Some(DType::Int8),
            "u2" => Some(DType::UInt16),
            "i2" => Some(DType::Int16),
            "u4" => Some(DType::UInt32),
            "i4" => Some(DType::Int32),
            "u8" => Some(DType::UInt64),
            "i8" => Some(DType::Int64),
            "f2" => Some(DType::Float16),
            "f4" => Some(DType::Float32),
            "f8" => Some(DType::Float64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint8" => Ok(DType::UInt8),
            "int8" => Ok(DType::Int8),
            "uint16" => Ok(DType::UInt16),
            "int16" => Ok(DType::Int16),
            "uint32" => Ok(DType::UInt32),
            "int32" => Ok(DType::Int32),
            "uint64" => Ok(DType::UInt64),
            "int64" => Ok(DType::Int64),
            "float16" => Ok(DType::Float16),
            "float32" => Ok(DType::Float32),
            "float64" => Ok(DType::Float64),
            other => Err(Error::TypeMismatch {
                expected: "numeric dtype".to_string(),
                actual: other.to_string(),
            }),
        }
    }
}

/// Rust element types that can be viewed in place over segment bytes.
///
/// # Safety
///
/// Implementors must be plain old data: every bit pattern of
/// `size_of::<Self>()` bytes is a valid value and the type has no padding.
pub unsafe trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(unsafe impl Element for $ty {
            const DTYPE: DType = DType::$dtype;
        })*
    };
}

impl_element! {
    u8 => UInt8,
    i8 => Int8,
    u16 => UInt16,
    i16 => Int16,
    u32 => UInt32,
    i32 => Int32,
    u64 => UInt64,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
}
