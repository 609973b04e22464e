//! Field-level readers for the space separated ASCII bodies of KACO frames.

use types::{CosPhi, CosPhiKind};

use crate::CodecError;

/// Reads consecutive `' '`-prefixed fields out of a frame.
pub(crate) struct Cursor<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(frame: &'a [u8], pos: usize) -> Self {
        Self { frame, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    /// A fixed-width field: one separator space followed by `width` bytes.
    pub(crate) fn fixed(&mut self, width: usize) -> Result<&'a [u8], CodecError> {
        if self.frame.len() < self.pos + width + 1 {
            return Err(CodecError::FrameTooShort);
        }
        self.expect_space()?;
        let start = self.pos + 1;
        let end = start + width;
        self.pos = end;
        Ok(&self.frame[start..end])
    }

    /// A variable-width field: separator space, optional padding, then
    /// everything up to the next space.
    pub(crate) fn token(&mut self) -> Result<&'a [u8], CodecError> {
        if self.frame.len() < self.pos + 2 {
            return Err(CodecError::FrameTooShort);
        }
        self.expect_space()?;
        let start = self.pos + 1;
        let mut found_value = false;
        for end in start..self.frame.len() {
            if self.frame[end] == b' ' {
                if found_value {
                    self.pos = end;
                    return Ok(&self.frame[start..end]);
                }
            } else {
                found_value = true;
            }
        }
        Err(CodecError::FrameTooShort)
    }

    fn expect_space(&self) -> Result<(), CodecError> {
        match self.frame.get(self.pos) {
            Some(b' ') => Ok(()),
            Some(other) => Err(CodecError::Malformed(format!(
                "expected ' ' at offset {}, got {:?}",
                self.pos,
                char::from(*other)
            ))),
            None => Err(CodecError::FrameTooShort),
        }
    }
}

fn ascii(raw: &[u8]) -> Result<&str, CodecError> {
    std::str::from_utf8(raw)
        .ok()
        .filter(|text| text.is_ascii())
        .ok_or_else(|| CodecError::Malformed(format!("expected ASCII characters, got {raw:?}")))
}

pub(crate) fn parse_int(raw: &[u8]) -> Result<i64, CodecError> {
    let text = ascii(raw)?.trim_start();
    text.parse()
        .map_err(|_| CodecError::Malformed(format!("expected integer, got {text:?}")))
}

pub(crate) fn parse_status(raw: &[u8]) -> Result<u16, CodecError> {
    let value = parse_int(raw)?;
    u16::try_from(value).map_err(|_| CodecError::Malformed(format!("status {value} out of range")))
}

/// Parses a fixed-point decimal such as `486.8` as a scaled integer and
/// returns it in physical units. With `decimals` set, the field must carry
/// exactly that many decimal places.
pub(crate) fn parse_decimal(
    raw: &[u8],
    decimals: Option<u32>,
    name: &str,
) -> Result<f64, CodecError> {
    let text = ascii(raw)?.trim_start();
    let (integer, fraction) = match text.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (text, ""),
    };
    if let Some(expected) = decimals {
        if fraction.len() != expected as usize {
            return Err(CodecError::Malformed(format!(
                "expected {expected} decimal places in field {name}, got {text:?}"
            )));
        }
    }

    let (negative, digits) = match integer.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, integer),
    };
    let well_formed = (!digits.is_empty() || !fraction.is_empty())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && fraction.bytes().all(|b| b.is_ascii_digit());
    if !well_formed {
        return Err(CodecError::Malformed(format!("expected decimal, got {text:?}")));
    }

    let scaled: i64 = format!("{digits}{fraction}")
        .parse()
        .map_err(|_| CodecError::Malformed(format!("decimal out of range: {text:?}")))?;
    let scale = 10f64.powi(fraction.len() as i32);
    let value = scaled as f64 / scale;
    Ok(if negative { -value } else { value })
}

pub(crate) fn parse_text(raw: &[u8]) -> Result<String, CodecError> {
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    Ok(ascii(&raw[start..])?.trim_start().to_string())
}

/// cos φ is a decimal with a trailing `c`, `i` or `o`.
pub(crate) fn parse_cos_phi(raw: &[u8]) -> Result<CosPhi, CodecError> {
    let (suffix, number) = raw
        .split_last()
        .ok_or_else(|| CodecError::Malformed("empty cos phi field".to_string()))?;
    let kind = match suffix {
        b'c' => CosPhiKind::Capacitive,
        b'i' => CosPhiKind::Inductive,
        b'o' => CosPhiKind::Ohmic,
        other => {
            return Err(CodecError::Malformed(format!(
                "expected c, i or o, got {:?}",
                char::from(*other)
            )))
        }
    };
    Ok(CosPhi {
        value: parse_decimal(number, None, "cos_phi")?,
        kind,
    })
}
