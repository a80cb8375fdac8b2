//! Scalar and array codec
//!
//! Decodes the bytes a transform wrote into a typed [`Value`]. All
//! multi-byte values are little-endian, matching WASM linear memory.

use super::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed-width element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ScalarKind {
    /// Width in bytes
    pub const fn width(self) -> u32 {
        match self {
            ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::F64 => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ScalarKind::I8 => "i8",
            ScalarKind::U8 => "u8",
            ScalarKind::I16 => "i16",
            ScalarKind::U16 => "u16",
            ScalarKind::I32 => "i32",
            ScalarKind::U32 => "u32",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "i8" => ScalarKind::I8,
            "u8" => ScalarKind::U8,
            "i16" => ScalarKind::I16,
            "u16" => ScalarKind::U16,
            "i32" => ScalarKind::I32,
            "u32" => ScalarKind::U32,
            "f32" => ScalarKind::F32,
            "f64" => ScalarKind::F64,
            _ => return None,
        })
    }

    fn from_typed_array(name: &str) -> Option<Self> {
        Some(match name {
            "Int8Array" => ScalarKind::I8,
            "Uint8Array" => ScalarKind::U8,
            "Int16Array" => ScalarKind::I16,
            "Uint16Array" => ScalarKind::U16,
            "Int32Array" => ScalarKind::I32,
            "Uint32Array" => ScalarKind::U32,
            "Float32Array" => ScalarKind::F32,
            "Float64Array" => ScalarKind::F64,
            _ => return None,
        })
    }
}

/// Declared return shape of a wrapped function.
///
/// Written as `"bytes"`, a scalar name (`"u16"`, `"f64"`, ...), or an
/// array as `"f32[]"` / `"Float32Array"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReturnKind {
    #[default]
    Bytes,
    Scalar(ScalarKind),
    Array(ScalarKind),
}

impl ReturnKind {
    /// Output width fixed by the type, for scalar kinds
    pub fn fixed_width(&self) -> Option<u32> {
        match self {
            ReturnKind::Scalar(kind) => Some(kind.width()),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ReturnKind::Array(_))
    }
}

impl FromStr for ReturnKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if name == "bytes" {
            return Ok(ReturnKind::Bytes);
        }
        if let Some(elem) = name.strip_suffix("[]") {
            if let Some(kind) = ScalarKind::from_name(elem) {
                return Ok(ReturnKind::Array(kind));
            }
        }
        if let Some(kind) = ScalarKind::from_typed_array(name) {
            return Ok(ReturnKind::Array(kind));
        }
        ScalarKind::from_name(name)
            .map(ReturnKind::Scalar)
            .ok_or_else(|| BridgeError::UnsupportedReturnType {
                kind: s.to_string(),
            })
    }
}

impl TryFrom<String> for ReturnKind {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReturnKind> for String {
    fn from(kind: ReturnKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnKind::Bytes => f.write_str("bytes"),
            ReturnKind::Scalar(kind) => f.write_str(kind.as_str()),
            ReturnKind::Array(kind) => write!(f, "{}[]", kind.as_str()),
        }
    }
}

/// A decoded return value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    F32(f32),
    F64(f64),
    I8Array(Vec<i8>),
    U8Array(Vec<u8>),
    I16Array(Vec<i16>),
    U16Array(Vec<u16>),
    I32Array(Vec<i32>),
    U32Array(Vec<u32>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
}

impl Value {
    /// Raw bytes, for `Bytes` values
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Numeric value of a scalar, widened to f64
    pub fn as_f64(&self) -> Option<f64> {
        Some(match *self {
            Value::I8(v) => v as f64,
            Value::U8(v) => v as f64,
            Value::I16(v) => v as f64,
            Value::U16(v) => v as f64,
            Value::I32(v) => v as f64,
            Value::U32(v) => v as f64,
            Value::F32(v) => v as f64,
            Value::F64(v) => v,
            _ => return None,
        })
    }

    /// Number of elements for arrays, bytes for `Bytes`, 1 for scalars
    pub fn len(&self) -> usize {
        match self {
            Value::Bytes(v) | Value::U8Array(v) => v.len(),
            Value::I8Array(v) => v.len(),
            Value::I16Array(v) => v.len(),
            Value::U16Array(v) => v.len(),
            Value::I32Array(v) => v.len(),
            Value::U32Array(v) => v.len(),
            Value::F32Array(v) => v.len(),
            Value::F64Array(v) => v.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode `width`-byte little-endian elements
macro_rules! le_elements {
    ($bytes:expr, $ty:ty) => {{
        const W: usize = std::mem::size_of::<$ty>();
        $bytes
            .chunks_exact(W)
            .map(|chunk| {
                let mut raw = [0u8; W];
                raw.copy_from_slice(chunk);
                <$ty>::from_le_bytes(raw)
            })
            .collect::<Vec<$ty>>()
    }};
}

/// Decode the bytes written by a call as `kind`.
///
/// Scalars read the first `width` bytes. Arrays cover exactly the bytes
/// written, which must be a whole number of elements.
pub fn decode(bytes: &[u8], kind: ReturnKind) -> BridgeResult<Value> {
    match kind {
        ReturnKind::Bytes => Ok(Value::Bytes(bytes.to_vec())),
        ReturnKind::Scalar(scalar) => decode_scalar(bytes, scalar),
        ReturnKind::Array(elem) => decode_array(bytes, elem),
    }
}

/// Decode with a kind given by name; unknown names fail with
/// `UnsupportedReturnType`.
pub fn decode_named(bytes: &[u8], kind: &str) -> BridgeResult<Value> {
    decode(bytes, kind.parse()?)
}

fn decode_scalar(bytes: &[u8], kind: ScalarKind) -> BridgeResult<Value> {
    let width = kind.width() as usize;
    let raw = bytes.get(..width).ok_or_else(|| BridgeError::MalformedOutput {
        reason: format!(
            "{} needs {} bytes, {} written",
            kind.as_str(),
            width,
            bytes.len()
        ),
    })?;

    let value = match kind {
        ScalarKind::I8 => Value::I8(le_elements!(raw, i8)[0]),
        ScalarKind::U8 => Value::U8(raw[0]),
        ScalarKind::I16 => Value::I16(le_elements!(raw, i16)[0]),
        ScalarKind::U16 => Value::U16(le_elements!(raw, u16)[0]),
        ScalarKind::I32 => Value::I32(le_elements!(raw, i32)[0]),
        ScalarKind::U32 => Value::U32(le_elements!(raw, u32)[0]),
        ScalarKind::F32 => Value::F32(le_elements!(raw, f32)[0]),
        ScalarKind::F64 => Value::F64(le_elements!(raw, f64)[0]),
    };
    Ok(value)
}

fn decode_array(bytes: &[u8], elem: ScalarKind) -> BridgeResult<Value> {
    let width = elem.width() as usize;
    if bytes.len() % width != 0 {
        return Err(BridgeError::MalformedOutput {
            reason: format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                elem.as_str()
            ),
        });
    }

    let value = match elem {
        ScalarKind::I8 => Value::I8Array(le_elements!(bytes, i8)),
        ScalarKind::U8 => Value::U8Array(bytes.to_vec()),
        ScalarKind::I16 => Value::I16Array(le_elements!(bytes, i16)),
        ScalarKind::U16 => Value::U16Array(le_elements!(bytes, u16)),
        ScalarKind::I32 => Value::I32Array(le_elements!(bytes, i32)),
        ScalarKind::U32 => Value::U32Array(le_elements!(bytes, u32)),
        ScalarKind::F32 => Value::F32Array(le_elements!(bytes, f32)),
        ScalarKind::F64 => Value::F64Array(le_elements!(bytes, f64)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        assert_eq!("bytes".parse::<ReturnKind>().unwrap(), ReturnKind::Bytes);
        assert_eq!(
            "f32".parse::<ReturnKind>().unwrap(),
            ReturnKind::Scalar(ScalarKind::F32)
        );
        assert_eq!(
            "u32[]".parse::<ReturnKind>().unwrap(),
            ReturnKind::Array(ScalarKind::U32)
        );
        assert_eq!(
            "Float64Array".parse::<ReturnKind>().unwrap(),
            ReturnKind::Array(ScalarKind::F64)
        );
    }

    #[test]
    fn test_unknown_kind() {
        for name in ["u64", "string", "f32[][]", ""] {
            assert!(matches!(
                name.parse::<ReturnKind>(),
                Err(BridgeError::UnsupportedReturnType { .. })
            ));
        }
        assert!(matches!(
            decode_named(&[0; 8], "i64"),
            Err(BridgeError::UnsupportedReturnType { kind }) if kind == "i64"
        ));
    }

    #[test]
    fn test_kind_display_round_trips() {
        for name in ["bytes", "i8", "u16", "f64", "i32[]", "f32[]"] {
            let kind: ReturnKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
    }

    #[test]
    fn test_fixed_widths() {
        assert_eq!("f64".parse::<ReturnKind>().unwrap().fixed_width(), Some(8));
        assert_eq!("f32".parse::<ReturnKind>().unwrap().fixed_width(), Some(4));
        assert_eq!("i32".parse::<ReturnKind>().unwrap().fixed_width(), Some(4));
        assert_eq!("u16".parse::<ReturnKind>().unwrap().fixed_width(), Some(2));
        assert_eq!("i8".parse::<ReturnKind>().unwrap().fixed_width(), Some(1));
        assert_eq!(ReturnKind::Bytes.fixed_width(), None);
        assert_eq!("u8[]".parse::<ReturnKind>().unwrap().fixed_width(), None);
    }

    #[test]
    fn test_decode_scalars_little_endian() {
        assert_eq!(
            decode(&[0xFF], ReturnKind::Scalar(ScalarKind::I8)).unwrap(),
            Value::I8(-1)
        );
        assert_eq!(
            decode(&[0x34, 0x12], ReturnKind::Scalar(ScalarKind::U16)).unwrap(),
            Value::U16(0x1234)
        );
        assert_eq!(
            decode(&(-5i32).to_le_bytes(), ReturnKind::Scalar(ScalarKind::I32)).unwrap(),
            Value::I32(-5)
        );
        assert_eq!(
            decode(&1.5f32.to_le_bytes(), ReturnKind::Scalar(ScalarKind::F32)).unwrap(),
            Value::F32(1.5)
        );
        assert_eq!(
            decode(&2.25f64.to_le_bytes(), ReturnKind::Scalar(ScalarKind::F64)).unwrap(),
            Value::F64(2.25)
        );
    }

    #[test]
    fn test_decode_scalar_too_short() {
        assert!(matches!(
            decode(&[1, 2], ReturnKind::Scalar(ScalarKind::F32)),
            Err(BridgeError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_decode_arrays() {
        let mut bytes = Vec::new();
        for v in [1u32, 7, 42] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            decode(&bytes, ReturnKind::Array(ScalarKind::U32)).unwrap(),
            Value::U32Array(vec![1, 7, 42])
        );
        assert_eq!(
            decode(&[], ReturnKind::Array(ScalarKind::F64)).unwrap(),
            Value::F64Array(vec![])
        );
        assert!(matches!(
            decode(&[0; 6], ReturnKind::Array(ScalarKind::F32)),
            Err(BridgeError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::U16(9).as_f64(), Some(9.0));
        assert_eq!(Value::Bytes(vec![1, 2]).as_bytes(), Some(&[1u8, 2][..]));
        assert_eq!(Value::F32Array(vec![1.0, 2.0]).len(), 2);
        assert_eq!(Value::F32Array(vec![]).as_f64(), None);
    }

    #[test]
    fn test_serde_kind() {
        let kind: ReturnKind = serde_json::from_str("\"i16[]\"").unwrap();
        assert_eq!(kind, ReturnKind::Array(ScalarKind::I16));
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"i16[]\"");
        assert!(serde_json::from_str::<ReturnKind>("\"u128\"").is_err());
    }
}
