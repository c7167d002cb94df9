//! Binary entity codec for cached payloads.
//!
//! Fixed-object values and feed-item members are stored as one opaque
//! binary record:
//!
//! ```text
//! [item key, null-terminated UTF-8]   feed members only
//! flags: u8
//! [expiry: i64 LE milliseconds]       present iff flags contains INVALID
//! [etag, null-terminated UTF-8]       present iff flags lacks NO_ETAG
//! (field name NUL, type tag u8, payload)*   ascending field-name order
//! ```
//!
//! Field order is the entity's `BTreeMap` order, which is what lets decode
//! invert encode without a schema descriptor. When a record is flagged
//! NO_ETAG its ETag is reconstructed as a deterministic transform (FNV-1a
//! 64, hex) of the raw record bytes. This layout is persisted state and
//! must not change shape.

use chrono::{DateTime, TimeZone, Utc};
use ctstore_core::{CacheFlags, EntityCore, FieldValue, StoreError, StoreResult};

/// Reserved hash-field names for object/count values. Custom fields must
/// not use the `__` prefix.
pub const ETAG_FIELD: &str = "__etag";
pub const FLAGS_FIELD: &str = "__flags";
pub const EXPIRY_FIELD: &str = "__expiry";
pub const VALUE_FIELD: &str = "__value";

const TAG_STR: u8 = 1;
const TAG_I32: u8 = 2;
const TAG_I64: u8 = 3;
const TAG_F64: u8 = 4;
const TAG_BOOL: u8 = 5;
const TAG_DATETIME: u8 = 6;
const TAG_ENUM: u8 = 7;
const TAG_BYTES: u8 = 8;

fn truncated() -> StoreError {
    StoreError::unexpected("truncated cache record")
}

fn bad_utf8() -> StoreError {
    StoreError::unexpected("cache record contains invalid UTF-8")
}

/// FNV-1a 64 over the raw record bytes, rendered as 16 hex chars. Used as
/// the derived ETag for NO_ETAG records.
pub fn derived_etag(bytes: &[u8]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}

/// Feed-member prefix for an item key: the UTF-8 bytes plus the NUL
/// terminator that separates key from payload.
pub fn member_prefix(item_key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(item_key.len() + 1);
    out.extend_from_slice(item_key.as_bytes());
    out.push(0);
    out
}

/// Extract the item key from a feed member.
pub fn item_key_of_member(member: &[u8]) -> StoreResult<&str> {
    let end = member
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(truncated)?;
    std::str::from_utf8(&member[..end]).map_err(|_| bad_utf8())
}

/// Encode one field value (type tag plus payload, no name).
pub fn encode_field(value: &FieldValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_field(&mut out, value);
    out
}

/// Decode one field value produced by [`encode_field`].
pub fn decode_field(bytes: &[u8]) -> StoreResult<FieldValue> {
    let mut reader = Reader::new(bytes);
    let value = read_field(&mut reader)?;
    if !reader.is_empty() {
        return Err(StoreError::unexpected("trailing bytes after cache field"));
    }
    Ok(value)
}

/// Encode an entity into one binary record. `item_key` is present for feed
/// members only.
pub fn encode_entity(core: &EntityCore, item_key: Option<&str>) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(item_key) = item_key {
        out.extend_from_slice(item_key.as_bytes());
        out.push(0);
    }
    out.push(core.cache_flags.bits());
    if core.cache_flags.contains(CacheFlags::INVALID) {
        let millis = core.cache_expiry.map(|t| t.timestamp_millis()).unwrap_or(0);
        out.extend_from_slice(&millis.to_le_bytes());
    }
    if !core.cache_flags.contains(CacheFlags::NO_ETAG) {
        out.extend_from_slice(core.effective_etag().unwrap_or("").as_bytes());
        out.push(0);
    }
    for (name, value) in &core.fields {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        write_field(&mut out, value);
    }
    out
}

/// Decode a record produced by [`encode_entity`]. Returns the item key (for
/// feed members) and the entity bookkeeping. NO_ETAG records come back with
/// the derived ETag filled in.
pub fn decode_entity(bytes: &[u8], has_item_key: bool) -> StoreResult<(Option<String>, EntityCore)> {
    let mut reader = Reader::new(bytes);
    let item_key = if has_item_key {
        Some(reader.read_cstr()?)
    } else {
        None
    };

    let flags = CacheFlags::from_bits(reader.read_u8()?);
    let cache_expiry = if flags.contains(CacheFlags::INVALID) {
        let millis = reader.read_i64()?;
        Utc.timestamp_millis_opt(millis).single()
    } else {
        None
    };
    let etag = if flags.contains(CacheFlags::NO_ETAG) {
        derived_etag(bytes)
    } else {
        reader.read_cstr()?
    };

    let mut core = EntityCore {
        etag: Some(etag),
        cache_flags: flags,
        cache_expiry,
        ..Default::default()
    };
    while !reader.is_empty() {
        let name = reader.read_cstr()?;
        let value = read_field(&mut reader)?;
        core.fields.insert(name, value);
    }
    Ok((item_key, core))
}

/// Read just the ETag of a record without decoding its fields.
pub fn peek_etag(bytes: &[u8], has_item_key: bool) -> StoreResult<String> {
    let mut reader = Reader::new(bytes);
    if has_item_key {
        reader.read_cstr()?;
    }
    let flags = CacheFlags::from_bits(reader.read_u8()?);
    if flags.contains(CacheFlags::INVALID) {
        reader.read_i64()?;
    }
    if flags.contains(CacheFlags::NO_ETAG) {
        Ok(derived_etag(bytes))
    } else {
        reader.read_cstr()
    }
}

fn write_field(out: &mut Vec<u8>, value: &FieldValue) {
    match value {
        FieldValue::Str(v) => {
            out.push(TAG_STR);
            match v {
                Some(s) => {
                    out.push(1);
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                None => out.push(0),
            }
        }
        FieldValue::I32(v) => {
            out.push(TAG_I32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::I64(v) => {
            out.push(TAG_I64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::F64(v) => {
            out.push(TAG_F64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*v));
        }
        FieldValue::DateTime(v) => {
            out.push(TAG_DATETIME);
            out.extend_from_slice(&v.timestamp_millis().to_le_bytes());
        }
        FieldValue::EnumStr(v) => {
            out.push(TAG_ENUM);
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v.as_bytes());
        }
        FieldValue::Bytes(v) => {
            out.push(TAG_BYTES);
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
    }
}

fn read_field(reader: &mut Reader<'_>) -> StoreResult<FieldValue> {
    let tag = reader.read_u8()?;
    match tag {
        TAG_STR => {
            if reader.read_u8()? == 0 {
                Ok(FieldValue::Str(None))
            } else {
                Ok(FieldValue::Str(Some(reader.read_len_prefixed_str()?)))
            }
        }
        TAG_I32 => Ok(FieldValue::I32(i32::from_le_bytes(reader.read_array()?))),
        TAG_I64 => Ok(FieldValue::I64(reader.read_i64()?)),
        TAG_F64 => Ok(FieldValue::F64(f64::from_le_bytes(reader.read_array()?))),
        TAG_BOOL => Ok(FieldValue::Bool(reader.read_u8()? != 0)),
        TAG_DATETIME => {
            let millis = reader.read_i64()?;
            let when = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| StoreError::unexpected("cache record datetime out of range"))?;
            Ok(FieldValue::DateTime(when))
        }
        TAG_ENUM => Ok(FieldValue::EnumStr(reader.read_len_prefixed_str()?)),
        TAG_BYTES => {
            let len = reader.read_u32()? as usize;
            Ok(FieldValue::Bytes(reader.read_bytes(len)?.to_vec()))
        }
        other => Err(StoreError::unexpected(format!(
            "unknown cache field tag {other}"
        ))),
    }
}

/// Encode an expiry timestamp for the hash representation.
pub fn encode_expiry(when: DateTime<Utc>) -> [u8; 8] {
    when.timestamp_millis().to_le_bytes()
}

/// Decode an expiry timestamp from the hash representation.
pub fn decode_expiry(bytes: &[u8]) -> StoreResult<DateTime<Utc>> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::unexpected("malformed cache expiry"))?;
    Utc.timestamp_millis_opt(i64::from_le_bytes(arr))
        .single()
        .ok_or_else(|| StoreError::unexpected("cache expiry out of range"))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_bytes(&mut self, len: usize) -> StoreResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(truncated)?;
        if end > self.bytes.len() {
            return Err(truncated());
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> StoreResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_array<const N: usize>(&mut self) -> StoreResult<[u8; N]> {
        self.read_bytes(N)?
            .try_into()
            .map_err(|_| truncated())
    }

    fn read_u32(&mut self) -> StoreResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> StoreResult<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    fn read_cstr(&mut self) -> StoreResult<String> {
        let rest = &self.bytes[self.pos..];
        let end = rest.iter().position(|b| *b == 0).ok_or_else(truncated)?;
        let s = std::str::from_utf8(&rest[..end]).map_err(|_| bad_utf8())?;
        self.pos += end + 1;
        Ok(s.to_string())
    }

    fn read_len_prefixed_str(&mut self) -> StoreResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| bad_utf8())
    }
}
