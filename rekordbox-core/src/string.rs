//! DeviceSQL string encoding for Pioneer databases
//!
//! Every text field in export.pdb starts with a flag byte:
//! - 0x40: long ASCII, u16 LE byte length, then the bytes
//! - 0x90: long UTF-16LE, u16 LE code-unit count, then 2 bytes per unit
//! - any other flag with bit 0x40 clear: short ASCII, length = flag & 0x7F
//!
//! 0x90 has bit 0x40 clear as well, so it is matched before the short form.
//!
//! Reference: https://djl-analysis.deepsymmetry.org/rekordbox-export-analysis/exports.html

use serde::Serialize;
use thiserror::Error;

/// Flag byte values
pub const FLAG_LONG_ASCII: u8 = 0x40;
pub const FLAG_UTF16LE: u8 = 0x90;

/// Longest ASCII string the short form can carry without setting bit 0x40
pub const MAX_SHORT_ASCII_LEN: usize = 0x3F;

/// Longest string either long form can carry
pub const MAX_LONG_LEN: usize = u16::MAX as usize;

/// A decoded string, tagged with the form it was stored in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceString {
    ShortAscii(String),
    LongAscii(String),
    LongUtf16Le(String),
}

impl DeviceString {
    pub fn text(&self) -> &str {
        match self {
            DeviceString::ShortAscii(s) | DeviceString::LongAscii(s) | DeviceString::LongUtf16Le(s) => s,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            DeviceString::ShortAscii(s) | DeviceString::LongAscii(s) | DeviceString::LongUtf16Le(s) => s,
        }
    }

    /// Pick the smallest form able to hold `s`
    pub fn for_text(s: &str) -> Self {
        if s.is_ascii() && s.len() <= MAX_SHORT_ASCII_LEN {
            DeviceString::ShortAscii(s.to_string())
        } else if s.is_ascii() {
            DeviceString::LongAscii(s.to_string())
        } else {
            DeviceString::LongUtf16Le(s.to_string())
        }
    }
}

/// Why a string could not be decoded
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StringError {
    #[error("string offset {offset} is outside the {available}-byte buffer")]
    OutOfBuffer { offset: usize, available: usize },

    #[error("unknown string flag 0x{flag:02x}")]
    UnknownFlag { flag: u8 },

    #[error("string declares {declared} bytes but only {available} remain")]
    Truncated { declared: usize, available: usize },
}

/// Decode the string at `offset`, returning the text and the offset just
/// past it. On any failure the text is empty and the offset is returned
/// unchanged, so a caller looping over strings cannot spin in place
/// without noticing.
pub fn decode(buffer: &[u8], offset: usize) -> (String, usize) {
    match decode_checked(buffer, offset) {
        Ok((s, next)) => (s.into_string(), next),
        Err(_) => (String::new(), offset),
    }
}

/// Decode the string at `offset`, reporting why it failed
pub fn decode_checked(buffer: &[u8], offset: usize) -> Result<(DeviceString, usize), StringError> {
    let flag = *buffer.get(offset).ok_or(StringError::OutOfBuffer {
        offset,
        available: buffer.len(),
    })?;

    match flag {
        FLAG_LONG_ASCII => {
            let (len, body) = long_length(buffer, offset)?;
            let bytes = take(buffer, body, len)?;
            Ok((DeviceString::LongAscii(ascii_lossy(bytes)), body + len))
        }
        FLAG_UTF16LE => {
            let (units, body) = long_length(buffer, offset)?;
            let bytes = take(buffer, body, units * 2)?;
            let text = char::decode_utf16(bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])))
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect();
            Ok((DeviceString::LongUtf16Le(text), body + units * 2))
        }
        f if f & FLAG_LONG_ASCII == 0 => {
            let len = (f & 0x7F) as usize;
            let bytes = take(buffer, offset + 1, len)?;
            Ok((DeviceString::ShortAscii(ascii_lossy(bytes)), offset + 1 + len))
        }
        f => Err(StringError::UnknownFlag { flag: f }),
    }
}

/// Read the u16 length that follows a long-form flag byte
fn long_length(buffer: &[u8], offset: usize) -> Result<(usize, usize), StringError> {
    let b = take(buffer, offset + 1, 2)?;
    Ok((u16::from_le_bytes([b[0], b[1]]) as usize, offset + 3))
}

fn take(buffer: &[u8], offset: usize, len: usize) -> Result<&[u8], StringError> {
    crate::source::slice(buffer, offset, len).map_err(|_| StringError::Truncated {
        declared: len,
        available: buffer.len().saturating_sub(offset),
    })
}

fn ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
        .collect()
}

/// Encode a string in the given form. Text longer than the form allows is
/// cut at the form's limit.
pub fn encode(s: &DeviceString) -> Vec<u8> {
    match s {
        DeviceString::ShortAscii(text) => {
            let bytes = &text.as_bytes()[..text.len().min(MAX_SHORT_ASCII_LEN)];
            let mut result = Vec::with_capacity(1 + bytes.len());
            result.push(bytes.len() as u8);
            result.extend_from_slice(bytes);
            result
        }
        DeviceString::LongAscii(text) => {
            let bytes = &text.as_bytes()[..text.len().min(MAX_LONG_LEN)];
            let mut result = Vec::with_capacity(3 + bytes.len());
            result.push(FLAG_LONG_ASCII);
            result.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            result.extend_from_slice(bytes);
            result
        }
        DeviceString::LongUtf16Le(text) => {
            let units: Vec<u16> = text.encode_utf16().take(MAX_LONG_LEN).collect();
            let mut result = Vec::with_capacity(3 + units.len() * 2);
            result.push(FLAG_UTF16LE);
            result.extend_from_slice(&(units.len() as u16).to_le_bytes());
            for unit in units {
                result.extend_from_slice(&unit.to_le_bytes());
            }
            result
        }
    }
}

/// Encode a string in the smallest form able to hold it
pub fn encode_string(s: &str) -> Vec<u8> {
    encode(&DeviceString::for_text(s))
}

/// Get the encoded length of a string without actually encoding it
pub fn encoded_length(s: &str) -> usize {
    match DeviceString::for_text(s) {
        DeviceString::ShortAscii(t) => 1 + t.len(),
        DeviceString::LongAscii(t) => 3 + t.len(),
        DeviceString::LongUtf16Le(t) => 3 + t.encode_utf16().count() * 2,
    }
}
