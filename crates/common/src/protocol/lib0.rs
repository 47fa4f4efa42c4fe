//! lib0 helpers for the envelope fields, on top of the yrs encoders.
//!
//! yrs reads strings without checking UTF-8, so every string that comes off
//! the wire goes through [`read_str`].

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;
use yrs::Any;

const ANY_STRING: u8 = 119;
const ANY_MAP: u8 = 118;
const ANY_ARRAY: u8 = 117;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer: needed {0} more bytes")]
    UnexpectedEof(usize),
    #[error("invalid variable length integer")]
    InvalidVarInt,
    #[error("unexpected value in frame")]
    UnexpectedValue,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("document name must be a string or null, got {0}")]
    InvalidDocName(String),
    #[error("{0}")]
    Other(String),
}

impl From<read::Error> for CodecError {
    fn from(err: read::Error) -> Self {
        match err {
            read::Error::EndOfBuffer(needed) => Self::UnexpectedEof(needed),
            read::Error::InvalidVarInt => Self::InvalidVarInt,
            read::Error::UnexpectedValue => Self::UnexpectedValue,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_str(cursor: &mut Cursor<'_>) -> Result<String, CodecError> {
    let bytes = cursor.read_buf()?;
    std::str::from_utf8(bytes).map(str::to_owned).map_err(|_| CodecError::InvalidUtf8)
}

/// Reads the `any`-encoded document name: a string, `null` or `undefined`.
pub fn read_doc_name(cursor: &mut Cursor<'_>) -> Result<Option<String>, CodecError> {
    match cursor.buf.get(cursor.next).copied() {
        Some(ANY_STRING) => {
            cursor.read_u8()?;
            read_str(cursor).map(Some)
        }
        // Containers are refused before decoding so nested input cannot recurse.
        Some(tag @ (ANY_MAP | ANY_ARRAY)) => Err(CodecError::InvalidDocName(format!("container tag {tag}"))),
        _ => match Any::decode(cursor)? {
            Any::Null | Any::Undefined => Ok(None),
            other => Err(CodecError::InvalidDocName(other.to_string())),
        },
    }
}

pub fn write_doc_name(buf: &mut Vec<u8>, name: Option<&str>) {
    match name {
        None => Any::Null.encode(buf),
        Some(name) => Any::String(name.into()).encode(buf),
    }
}
