//! Stored cache entry and its wire format.
//!
//! Entries are written to the shared KV store and must be readable by peer
//! gateway instances, so the encoding is an explicit, versioned binary
//! layout rather than whatever the process happens to serialize:
//!
//! ```text
//! u8   format version (currently 1)
//! u16  status
//! i64  stored_at     (unix ms)
//! i64  fresh_until   (unix ms)
//! i64  stale_until   (unix ms)
//! u16  origin length      + bytes (utf-8)
//! u16  header count
//!      per header: u16 name length + bytes (lowercase, utf-8)
//!                  u32 value length + bytes (latin-1 safe)
//! u32  body length       + bytes
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const FORMAT_VERSION: u8 = 1;

/// Freshness of an entry relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now <= fresh_until`: serve as-is.
    Fresh,
    /// `fresh_until < now <= stale_until`: serve and revalidate.
    Stale,
    /// Past the stale window: treat as absent.
    Expired,
}

#[derive(Debug, Error)]
pub enum EntryCodecError {
    #[error("cache entry truncated")]
    Truncated,

    #[error("unsupported cache entry version {0}")]
    UnsupportedVersion(u8),

    #[error("cache entry field is not valid utf-8")]
    InvalidUtf8,
}

/// A serialized upstream response held in the cache.
///
/// Invariant: `stored_at <= fresh_until <= stale_until`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub status: u16,
    /// Lowercase names, response order preserved.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stored_at: i64,
    pub fresh_until: i64,
    pub stale_until: i64,
    /// Upstream host the entry came from, for diagnostics.
    pub origin: String,
}

impl CacheEntry {
    #[must_use]
    pub fn freshness(&self, now_ms: i64) -> Freshness {
        if now_ms <= self.fresh_until {
            Freshness::Fresh
        } else if now_ms <= self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Seconds since the entry was stored, for the `Age` response header.
    #[must_use]
    pub fn age_seconds(&self, now_ms: i64) -> u64 {
        ((now_ms - self.stored_at).max(0) / 1000) as u64
    }

    /// Seconds the whole record stays useful, from `stored_at` to
    /// `stale_until`. The KV TTL adds a safety margin on top.
    #[must_use]
    pub fn lifetime_seconds(&self) -> u64 {
        ((self.stale_until - self.stored_at).max(0) / 1000) as u64
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        buf.put_u8(FORMAT_VERSION);
        buf.put_u16(self.status);
        buf.put_i64(self.stored_at);
        buf.put_i64(self.fresh_until);
        buf.put_i64(self.stale_until);

        buf.put_u16(self.origin.len().min(u16::MAX as usize) as u16);
        buf.put_slice(&self.origin.as_bytes()[..self.origin.len().min(u16::MAX as usize)]);

        buf.put_u16(self.headers.len().min(u16::MAX as usize) as u16);
        for (name, value) in self.headers.iter().take(u16::MAX as usize) {
            let name = name.to_ascii_lowercase();
            buf.put_u16(name.len().min(u16::MAX as usize) as u16);
            buf.put_slice(&name.as_bytes()[..name.len().min(u16::MAX as usize)]);
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }

        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// # Errors
    /// Returns [`EntryCodecError`] for truncated buffers, unknown versions,
    /// or malformed text fields.
    pub fn decode(raw: &[u8]) -> Result<Self, EntryCodecError> {
        let mut buf = raw;

        let version = take_u8(&mut buf)?;
        if version != FORMAT_VERSION {
            return Err(EntryCodecError::UnsupportedVersion(version));
        }

        let status = take_u16(&mut buf)?;
        let stored_at = take_i64(&mut buf)?;
        let fresh_until = take_i64(&mut buf)?;
        let stale_until = take_i64(&mut buf)?;

        let origin_len = take_u16(&mut buf)? as usize;
        let origin = take_string(&mut buf, origin_len)?;

        let header_count = take_u16(&mut buf)? as usize;
        let mut headers = Vec::with_capacity(header_count);
        for _ in 0..header_count {
            let name_len = take_u16(&mut buf)? as usize;
            let name = take_string(&mut buf, name_len)?;
            let value_len = take_u32(&mut buf)? as usize;
            let value = take_string(&mut buf, value_len)?;
            headers.push((name, value));
        }

        let body_len = take_u32(&mut buf)? as usize;
        if buf.remaining() < body_len {
            return Err(EntryCodecError::Truncated);
        }
        let body = Bytes::copy_from_slice(&buf[..body_len]);

        Ok(Self { status, headers, body, stored_at, fresh_until, stale_until, origin })
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, EntryCodecError> {
    if buf.remaining() < 1 {
        return Err(EntryCodecError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, EntryCodecError> {
    if buf.remaining() < 2 {
        return Err(EntryCodecError::Truncated);
    }
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, EntryCodecError> {
    if buf.remaining() < 4 {
        return Err(EntryCodecError::Truncated);
    }
    Ok(buf.get_u32())
}

fn take_i64(buf: &mut &[u8]) -> Result<i64, EntryCodecError> {
    if buf.remaining() < 8 {
        return Err(EntryCodecError::Truncated);
    }
    Ok(buf.get_i64())
}

fn take_string(buf: &mut &[u8], len: usize) -> Result<String, EntryCodecError> {
    if buf.remaining() < len {
        return Err(EntryCodecError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| EntryCodecError::InvalidUtf8)?
        .to_string();
    buf.advance(len);
    Ok(s)
}
