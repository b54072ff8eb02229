//! GridDB wire building blocks.
//!
//! The byte-level framing and challenge/response digests a GridDB-compatible
//! adapter needs. The full client loop (socket management, result decoding)
//! belongs to the adapter crate that consumes these; what lives here is the
//! normative request layout:
//!
//! - every integer is big-endian on the wire;
//! - the fixed header is the magic `0x03E0AA98`, 16 bytes of zero padding
//!   with IPv6 enabled (4 otherwise), a 4-byte length placeholder, a 4-byte
//!   `-1`, and a 4-byte body length that is back-patched on
//!   [`RequestFrame::finish`];
//! - the body opens with the statement type (offset by 100 from protocol
//!   version 2 on), the partition id, and the statement id — 8 bytes from
//!   protocol 3 on unless this is the connection's first statement;
//! - strings carry a 4-byte length prefix;
//! - the optional-request section is a 4-byte body length plus repeated
//!   `(2-byte type, value)` entries.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest as _, Md5};
use sha2::Sha256;

use crate::{Error, Result};

/// Fixed request-header magic.
pub const REQUEST_MAGIC: u32 = 0x03E0_AA98;

// ============================================================================
// Request frames
// ============================================================================

/// Connection-level knobs that shape the header.
#[derive(Debug, Clone, Copy)]
pub struct FrameOpts {
    pub ipv6: bool,
    pub protocol_version: u32,
}

impl Default for FrameOpts {
    fn default() -> Self {
        Self {
            ipv6: false,
            protocol_version: 3,
        }
    }
}

/// A request under construction. Header fields are laid down by
/// [`RequestFrame::new`]; payload writers append; [`RequestFrame::finish`]
/// back-patches the body length.
pub struct RequestFrame {
    buf: BytesMut,
    body_len_at: usize,
}

impl RequestFrame {
    pub fn new(
        opts: &FrameOpts,
        statement_type: u32,
        partition_id: u32,
        statement_id: u64,
        first_statement: bool,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(64);

        buf.put_u32(REQUEST_MAGIC);
        buf.put_bytes(0, if opts.ipv6 { 16 } else { 4 });
        // Length placeholder, the fixed -1, then the body length patched at
        // finish time.
        buf.put_u32(0);
        buf.put_i32(-1);
        let body_len_at = buf.len();
        buf.put_u32(0);

        let wire_type = if opts.protocol_version >= 2 {
            statement_type + 100
        } else {
            statement_type
        };
        buf.put_u32(wire_type);
        buf.put_u32(partition_id);
        if opts.protocol_version >= 3 && !first_statement {
            buf.put_u64(statement_id);
        } else {
            buf.put_u32(statement_id as u32);
        }

        Self { buf, body_len_at }
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Length-prefixed string.
    pub fn put_string(&mut self, value: &str) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Append the optional-request section.
    pub fn put_optional(&mut self, optional: OptionalRequest) {
        optional.encode_into(&mut self.buf);
    }

    /// Back-patch the body length (everything after the body-length field)
    /// and freeze the frame.
    pub fn finish(mut self) -> Bytes {
        let body_len = (self.buf.len() - self.body_len_at - 4) as u32;
        self.buf[self.body_len_at..self.body_len_at + 4]
            .copy_from_slice(&body_len.to_be_bytes());
        self.buf.freeze()
    }
}

// ============================================================================
// Optional request section
// ============================================================================

/// Typed entries of the optional-request section.
#[derive(Default)]
pub struct OptionalRequest {
    entries: BytesMut,
}

impl OptionalRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bool(&mut self, entry_type: u16, value: bool) {
        self.entries.put_u16(entry_type);
        self.entries.put_u8(value as u8);
    }

    pub fn put_i32(&mut self, entry_type: u16, value: i32) {
        self.entries.put_u16(entry_type);
        self.entries.put_i32(value);
    }

    pub fn put_string(&mut self, entry_type: u16, value: &str) {
        self.entries.put_u16(entry_type);
        self.entries.put_u32(value.len() as u32);
        self.entries.put_slice(value.as_bytes());
    }

    fn encode_into(self, buf: &mut BytesMut) {
        buf.put_u32(self.entries.len() as u32);
        buf.put_slice(&self.entries);
    }
}

// ============================================================================
// Challenge/response authentication
// ============================================================================

/// Inputs to one authentication round.
#[derive(Debug, Clone)]
pub struct Challenge<'a> {
    pub challenge_base: &'a str,
    pub nonce: &'a str,
    pub nc: &'a str,
    pub cnonce: &'a str,
    pub base_salt: &'a str,
    pub crypt_base: &'a str,
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex(&hasher.finalize())
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Compute the authentication response:
///
/// ```text
/// HA1      = MD5(challengeBase ":" nonce ":" cnonce)
/// HA2      = MD5("POST:/")
/// HA3      = MD5(HA1 ":" nonce ":" nc ":" cnonce ":" "auth" ":" HA2)
/// secret   = SHA256(baseSalt ":" cryptBase)
/// response = "#1#" base64(HA3) "#" hex(secret)
/// ```
///
/// Digest intermediates travel as lowercase hex, as in HTTP digest auth.
pub fn challenge_response(challenge: &Challenge<'_>) -> String {
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        challenge.challenge_base, challenge.nonce, challenge.cnonce
    ));
    let ha2 = md5_hex("POST:/");
    let ha3 = md5_hex(&format!(
        "{ha1}:{}:{}:{}:auth:{ha2}",
        challenge.nonce, challenge.nc, challenge.cnonce
    ));
    let secret = sha256_hex(&format!(
        "{}:{}",
        challenge.base_salt, challenge.crypt_base
    ));
    format!("#1#{}#{}", BASE64.encode(ha3.as_bytes()), secret)
}

// ============================================================================
// Response inspection helpers
// ============================================================================

/// Validate the fixed prefix of a peer frame and return the offset past the
/// padding.
pub fn check_magic(frame: &[u8], ipv6: bool) -> Result<usize> {
    if frame.len() < 4 {
        return Err(Error::BackendIo {
            retryable: false,
            detail: "frame shorter than the magic".into(),
        });
    }
    let magic = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if magic != REQUEST_MAGIC {
        return Err(Error::BackendIo {
            retryable: false,
            detail: format!("bad frame magic {magic:#010x}"),
        });
    }
    Ok(4 + if ipv6 { 16 } else { 4 })
}

// ============================================================================
// Tests
// ============================================================================
