//! Socket option values and their native encodings

use crate::error::{Error, Result};
use byteorder::{ByteOrder, NativeEndian};
use bytes::Bytes;
use std::fmt;

/// Decoding the caller expects for an option value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Int,
    Int64,
    Bytes,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(kind_name(*self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Empty value, sent as a zero-length buffer
    Null,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Bytes(Bytes),
}

impl OptionValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Null => "null",
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "int",
            OptionValue::Int64(_) => "int64",
            OptionValue::Bytes(_) => "bytes",
        }
    }

    /// Native encoding: bool and int as native-endian i32, int64 as i64, bytes verbatim
    pub fn encode(&self) -> Vec<u8> {
        match self {
            OptionValue::Null => Vec::new(),
            OptionValue::Bool(b) => {
                let mut buf = vec![0u8; 4];
                NativeEndian::write_i32(&mut buf, *b as i32);
                buf
            }
            OptionValue::Int(v) => {
                let mut buf = vec![0u8; 4];
                NativeEndian::write_i32(&mut buf, *v);
                buf
            }
            OptionValue::Int64(v) => {
                let mut buf = vec![0u8; 8];
                NativeEndian::write_i64(&mut buf, *v);
                buf
            }
            OptionValue::Bytes(b) => b.to_vec(),
        }
    }

    pub fn decode(kind: OptionKind, raw: &[u8]) -> Result<Self> {
        let expect = |len: usize| {
            if raw.len() == len {
                Ok(())
            } else {
                Err(Error::Type {
                    expected: kind_name(kind),
                    actual: format!("{} bytes", raw.len()),
                })
            }
        };
        match kind {
            OptionKind::Bool => {
                expect(4)?;
                Ok(OptionValue::Bool(NativeEndian::read_i32(raw) != 0))
            }
            OptionKind::Int => {
                expect(4)?;
                Ok(OptionValue::Int(NativeEndian::read_i32(raw)))
            }
            OptionKind::Int64 => {
                expect(8)?;
                Ok(OptionValue::Int64(NativeEndian::read_i64(raw)))
            }
            OptionKind::Bytes => Ok(OptionValue::Bytes(Bytes::copy_from_slice(raw))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            OptionValue::Bool(b) => Ok(*b),
            other => Err(mismatch("bool", other)),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            OptionValue::Int(v) => Ok(*v),
            other => Err(mismatch("int", other)),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            OptionValue::Int64(v) => Ok(*v),
            OptionValue::Int(v) => Ok(*v as i64),
            other => Err(mismatch("int64", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&Bytes> {
        match self {
            OptionValue::Bytes(b) => Ok(b),
            other => Err(mismatch("bytes", other)),
        }
    }

    /// Byte value as text, without the trailing NUL string options carry
    pub fn as_str(&self) -> Result<String> {
        let bytes = self.as_bytes()?;
        let trimmed = bytes.strip_suffix(&[0u8]).unwrap_or(&bytes[..]);
        String::from_utf8(trimmed.to_vec()).map_err(|e| Error::Type {
            expected: "utf-8 string",
            actual: e.to_string(),
        })
    }
}

fn kind_name(kind: OptionKind) -> &'static str {
    match kind {
        OptionKind::Bool => "bool",
        OptionKind::Int => "int",
        OptionKind::Int64 => "int64",
        OptionKind::Bytes => "bytes",
    }
}

fn mismatch(expected: &'static str, actual: &OptionValue) -> Error {
    Error::Type {
        expected,
        actual: actual.type_name().to_string(),
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int64(v)
    }
}

impl From<&[u8]> for OptionValue {
    fn from(v: &[u8]) -> Self {
        OptionValue::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Bytes(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<Vec<u8>> for OptionValue {
    fn from(v: Vec<u8>) -> Self {
        OptionValue::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for OptionValue {
    fn from(v: Bytes) -> Self {
        OptionValue::Bytes(v)
    }
}
