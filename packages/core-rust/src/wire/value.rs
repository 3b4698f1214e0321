//! Tagged encoding of payload values.
//!
//! Change payloads are values of four logical kinds -- strings, numbers,
//! null, and binary -- encoded before encryption. The encoder inspects each
//! string and picks the most compact representation that reproduces the
//! exact input on decode: a 21-character url-safe base64 id shrinks to 16
//! bytes, an ISO date to a varint of epoch millis, and so on. Decoding maps
//! every tag back to the logical kind, so `decode(encode(v)) == v` for every
//! encodable value.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::owner::OwnerId;

use super::{varint, Reader, WireError};

// Value tags.
const TAG_STRING: u8 = 20;
const TAG_NUMBER: u8 = 21;
const TAG_NULL: u8 = 22;
const TAG_BINARY: u8 = 23;
const TAG_NON_NEGATIVE_INT: u8 = 30;
const TAG_EMPTY_STRING: u8 = 31;
const TAG_BASE64_URL: u8 = 32;
const TAG_ID: u8 = 33;
const TAG_JSON: u8 = 34;
const TAG_DATE_ISO_NON_NEGATIVE: u8 = 35;
const TAG_DATE_ISO_NEGATIVE: u8 = 36;

// Sub-tags of the number scheme. Bytes 0..=19 carry the value inline.
const NUM_SMALL_MAX: u8 = 19;
const NUM_VARINT: u8 = 20;
const NUM_F64: u8 = 21;

/// A payload value.
///
/// Strings with special structure (ids, dates, canonical JSON, url-safe
/// base64) are still plain `String` here; the compact representation is an
/// encoding concern only.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value.
    Null,
    /// UTF-8 text.
    String(String),
    /// IEEE-754 double. Integral non-negative doubles encode as varints.
    Number(f64),
    /// A non-negative integer known to be at most 2^53−1.
    NonNegativeInt(u64),
    /// Opaque bytes.
    Binary(Vec<u8>),
}

impl Value {
    /// Appends the tagged encoding of this value to `out`.
    ///
    /// # Panics
    ///
    /// Panics if a [`Value::NonNegativeInt`] exceeds 2^53−1.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => out.push(TAG_NULL),
            Self::NonNegativeInt(v) => {
                out.push(TAG_NON_NEGATIVE_INT);
                varint::encode(*v, out);
            }
            Self::Number(v) => {
                out.push(TAG_NUMBER);
                encode_number(*v, out);
            }
            Self::Binary(bytes) => {
                out.push(TAG_BINARY);
                varint::encode(bytes.len() as u64, out);
                out.extend_from_slice(bytes);
            }
            Self::String(s) => encode_string(s, out),
        }
    }

    /// Reads one tagged value from `r`.
    ///
    /// # Errors
    ///
    /// `InvalidData` on unknown tags or malformed payloads.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let tag = r.read_u8()?;
        match tag {
            TAG_NULL => Ok(Self::Null),
            TAG_NON_NEGATIVE_INT => Ok(Self::NonNegativeInt(varint::decode(r)?)),
            TAG_NUMBER => Ok(Self::Number(decode_number(r)?)),
            TAG_BINARY => {
                let len = usize::try_from(varint::decode(r)?)
                    .map_err(|_| WireError::InvalidData("binary length"))?;
                Ok(Self::Binary(r.read_slice(len)?.to_vec()))
            }
            TAG_EMPTY_STRING => Ok(Self::String(String::new())),
            TAG_STRING | TAG_JSON => {
                let len = usize::try_from(varint::decode(r)?)
                    .map_err(|_| WireError::InvalidData("string length"))?;
                let text = std::str::from_utf8(r.read_slice(len)?)
                    .map_err(|_| WireError::InvalidData("string is not utf-8"))?;
                Ok(Self::String(text.to_string()))
            }
            TAG_ID => {
                let id = OwnerId::from_bytes(r.read_array()?);
                Ok(Self::String(id.to_string()))
            }
            TAG_BASE64_URL => {
                let len = usize::try_from(varint::decode(r)?)
                    .map_err(|_| WireError::InvalidData("base64 length"))?;
                Ok(Self::String(URL_SAFE_NO_PAD.encode(r.read_slice(len)?)))
            }
            TAG_DATE_ISO_NON_NEGATIVE => {
                let millis = i64::try_from(varint::decode(r)?)
                    .map_err(|_| WireError::InvalidData("date millis"))?;
                render_date_iso(millis)
                    .map(Self::String)
                    .ok_or(WireError::InvalidData("date out of range"))
            }
            TAG_DATE_ISO_NEGATIVE => {
                let millis = i64::try_from(varint::decode(r)?)
                    .map_err(|_| WireError::InvalidData("date millis"))?;
                render_date_iso(-millis)
                    .map(Self::String)
                    .ok_or(WireError::InvalidData("date out of range"))
            }
            _ => Err(WireError::InvalidData("unknown value tag")),
        }
    }
}

/// Picks the most compact string representation that reproduces the input.
///
/// Predicate order is fixed; each predicate guarantees the decoder rebuilds
/// the exact original string.
fn encode_string(s: &str, out: &mut Vec<u8>) {
    if s.is_empty() {
        out.push(TAG_EMPTY_STRING);
        return;
    }
    if let Ok(id) = OwnerId::parse(s) {
        out.push(TAG_ID);
        out.extend_from_slice(id.as_bytes());
        return;
    }
    if let Some(millis) = parse_date_iso(s) {
        if millis >= 0 {
            out.push(TAG_DATE_ISO_NON_NEGATIVE);
            varint::encode(millis as u64, out);
        } else {
            out.push(TAG_DATE_ISO_NEGATIVE);
            varint::encode(millis.unsigned_abs(), out);
        }
        return;
    }
    if is_canonical_json(s) {
        out.push(TAG_JSON);
        varint::encode(s.len() as u64, out);
        out.extend_from_slice(s.as_bytes());
        return;
    }
    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(s) {
        if URL_SAFE_NO_PAD.encode(&bytes) == s {
            out.push(TAG_BASE64_URL);
            varint::encode(bytes.len() as u64, out);
            out.extend_from_slice(&bytes);
            return;
        }
    }
    out.push(TAG_STRING);
    varint::encode(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

fn encode_number(v: f64, out: &mut Vec<u8>) {
    // Integral doubles in the varint range get the compact path; everything
    // else carries its full bit pattern.
    if v.fract() == 0.0 && v >= 0.0 && v <= varint::MAX_VARINT as f64 && !v.is_sign_negative() {
        let int = v as u64;
        if int <= u64::from(NUM_SMALL_MAX) {
            out.push(int as u8);
        } else {
            out.push(NUM_VARINT);
            varint::encode(int, out);
        }
    } else {
        out.push(NUM_F64);
        out.extend_from_slice(&v.to_bits().to_le_bytes());
    }
}

fn decode_number(r: &mut Reader<'_>) -> Result<f64, WireError> {
    let tag = r.read_u8()?;
    match tag {
        0..=NUM_SMALL_MAX => Ok(f64::from(tag)),
        NUM_VARINT => {
            let v = varint::decode(r)?;
            Ok(v as f64)
        }
        NUM_F64 => Ok(f64::from_bits(u64::from_le_bytes(r.read_array()?))),
        _ => Err(WireError::InvalidData("unknown number tag")),
    }
}

/// True when `s` is the canonical compact serialization of a JSON value, so
/// parse-then-reserialize reproduces it byte for byte.
fn is_canonical_json(s: &str) -> bool {
    // Only structured values are interesting; bare scalars already have
    // compact encodings of their own.
    if !s.starts_with('{') && !s.starts_with('[') {
        return false;
    }
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(v) => serde_json::to_string(&v).is_ok_and(|canon| canon == s),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// ISO-8601 dates ("YYYY-MM-DDTHH:MM:SS.mmmZ", years 0000-9999)
// ---------------------------------------------------------------------------

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Days from civil date, epoch 1970-01-01 (Howard Hinnant's algorithm).
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = y - i64::from(m <= 2);
    let era = y.div_euclid(400);
    let yoe = (y - era * 400) as u64;
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = u64::from((153 * mp + 2) / 5 + d - 1);
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

/// Civil date from days since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (y + i64::from(m <= 2), m, d)
}

/// Renders epoch millis as `YYYY-MM-DDTHH:MM:SS.mmmZ`, or `None` when the
/// year leaves 0000-9999.
fn render_date_iso(millis: i64) -> Option<String> {
    let days = millis.div_euclid(MILLIS_PER_DAY);
    let in_day = millis.rem_euclid(MILLIS_PER_DAY);
    let (y, m, d) = civil_from_days(days);
    if !(0..=9999).contains(&y) {
        return None;
    }
    let ms = in_day % 1000;
    let secs = in_day / 1000;
    let (h, min, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    Some(format!("{y:04}-{m:02}-{d:02}T{h:02}:{min:02}:{s:02}.{ms:03}Z"))
}

/// Parses `YYYY-MM-DDTHH:MM:SS.mmmZ` into epoch millis, strictly: the input
/// must re-render to itself (so 2021-02-31 and the like are rejected).
fn parse_date_iso(s: &str) -> Option<i64> {
    let b = s.as_bytes();
    if b.len() != 24 || b[4] != b'-' || b[7] != b'-' || b[10] != b'T' {
        return None;
    }
    if b[13] != b':' || b[16] != b':' || b[19] != b'.' || b[23] != b'Z' {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<i64> {
        let part = &s[range];
        if !part.bytes().all(|c| c.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    };
    let y = digits(0..4)?;
    let m = digits(5..7)?;
    let d = digits(8..10)?;
    let h = digits(11..13)?;
    let min = digits(14..16)?;
    let sec = digits(17..19)?;
    let ms = digits(20..23)?;
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) || h > 23 || min > 59 || sec > 59 {
        return None;
    }
    let millis = days_from_civil(y, m as u32, d as u32) * MILLIS_PER_DAY
        + (h * 3600 + min * 60 + sec) * 1000
        + ms;
    // Round-trip check catches impossible calendar dates.
    (render_date_iso(millis)? == s).then_some(millis)
}
