//! Builtin scalar types and the array wrapper.
//!
//! Canonical engine form per type:
//!
//! | Type | Bytes | Form |
//! |------|-------|------|
//! | bool | 1 | 0 or 1 |
//! | int16/32/64 | 2/4/8 | little-endian two's complement |
//! | float32/64 | 4/8 | little-endian IEEE 754 |
//! | string | varlen | raw UTF-8 |
//! | date | 4 | days from the common era, little-endian i32 |
//! | timestamp | 8 | microseconds from the Unix epoch, little-endian i64 |
//! | array | varlen | element count u32 + packed elements |
//!
//! Builtins are process-wide singletons so typed slots can be constructed
//! without a registry in hand; [`register_builtins`] publishes the same
//! descriptors into a registry.

use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use super::tam::{
    BinOut, BinaryOpts, Formatter, TamView, TypeAccess, apply_literal, bin_get_apply,
    bin_get_mode, strip_literal,
};
use super::ops::TypeOps;
use super::stack::VARLEN_SLOT_SIZE;
use super::{InnerPolicy, Type, TypeRef, TypeRegistry, TypeTag};
use crate::{Error, Result};

// ============================================================================
// Tags
// ============================================================================

pub const TAG_BOOL: TypeTag = TypeTag(1);
pub const TAG_INT16: TypeTag = TypeTag(2);
pub const TAG_INT32: TypeTag = TypeTag(3);
pub const TAG_INT64: TypeTag = TypeTag(4);
pub const TAG_FLOAT32: TypeTag = TypeTag(5);
pub const TAG_FLOAT64: TypeTag = TypeTag(6);
pub const TAG_STRING: TypeTag = TypeTag(7);
pub const TAG_DATE: TypeTag = TypeTag(8);
pub const TAG_TIMESTAMP: TypeTag = TypeTag(9);
pub const TAG_ARRAY: TypeTag = TypeTag(10);

// ============================================================================
// Shared scalar plumbing
// ============================================================================

fn expect_len(name: &str, source: &[u8], size: usize) -> Result<()> {
    if source.len() != size {
        return Err(Error::SchemaMismatch(format!(
            "{name}: payload of {} bytes, expected {size}",
            source.len()
        )));
    }
    Ok(())
}

/// Reverse byte order when the two sides disagree on endianness.
fn endian_convert(opts: &BinaryOpts, bytes: &[u8], to_wire: bool) -> Vec<u8> {
    let flip = if to_wire {
        opts.dst_big_endian
    } else {
        opts.src_big_endian
    };
    if flip {
        bytes.iter().rev().copied().collect()
    } else {
        bytes.to_vec()
    }
}

fn scalar_bin_get(
    name: &str,
    size: usize,
    opts: &BinaryOpts,
    source: &[u8],
    target: Option<&mut [u8]>,
    length: Option<&mut usize>,
    cursor: Option<&mut usize>,
) -> Result<BinOut> {
    expect_len(name, source, size)?;
    let mode = bin_get_mode(opts, length.as_ref().map(|l| **l), cursor.as_ref().map(|c| **c))?;
    let rendered = endian_convert(opts, source, true);
    bin_get_apply(mode, &rendered, target, length, cursor)
}

fn scalar_bin_set(
    name: &str,
    size: usize,
    opts: &BinaryOpts,
    source: &[u8],
    target: &mut Vec<u8>,
    cursor: usize,
) -> Result<()> {
    if cursor != 0 {
        return Err(Error::UserInput(format!(
            "{name}: fixed-width set does not take a cursor"
        )));
    }
    expect_len(name, source, size)?;
    *target = endian_convert(opts, source, false);
    Ok(())
}

// ============================================================================
// Numeric scalars
// ============================================================================

macro_rules! numeric_scalar {
    ($access:ident, $ops:ident, $rust:ty, $name:literal, $size:expr, $cmp:expr) => {
        struct $access;

        impl TypeAccess for $access {
            fn bin_length(&self, _rest: TamView<'_>, _source: &[u8]) -> usize {
                $size
            }

            fn bin_get(
                &self,
                _rest: TamView<'_>,
                opts: &BinaryOpts,
                source: &[u8],
                target: Option<&mut [u8]>,
                length: Option<&mut usize>,
                cursor: Option<&mut usize>,
            ) -> Result<BinOut> {
                scalar_bin_get($name, $size, opts, source, target, length, cursor)
            }

            fn bin_set(
                &self,
                _rest: TamView<'_>,
                opts: &BinaryOpts,
                source: &[u8],
                target: &mut Vec<u8>,
                cursor: usize,
            ) -> Result<()> {
                scalar_bin_set($name, $size, opts, source, target, cursor)
            }

            fn text_get(
                &self,
                _rest: TamView<'_>,
                source: &[u8],
                fmt: Option<&Formatter>,
            ) -> Result<String> {
                expect_len($name, source, $size)?;
                let mut raw = [0u8; $size];
                raw.copy_from_slice(source);
                let value = <$rust>::from_le_bytes(raw);
                Ok(apply_literal(fmt, value.to_string()))
            }

            fn text_set(
                &self,
                _rest: TamView<'_>,
                text: &str,
                fmt: Option<&Formatter>,
            ) -> Result<Vec<u8>> {
                let text = strip_literal(fmt, text);
                let value: $rust = text.trim().parse().map_err(|_| {
                    Error::UserInput(format!("{}: cannot parse '{text}'", $name))
                })?;
                Ok(value.to_le_bytes().to_vec())
            }
        }

        struct $ops;

        impl TypeOps for $ops {
            fn compare(&self, _rest: TamView<'_>, lhs: &[u8], rhs: &[u8]) -> Result<Ordering> {
                expect_len($name, lhs, $size)?;
                expect_len($name, rhs, $size)?;
                let mut a = [0u8; $size];
                let mut b = [0u8; $size];
                a.copy_from_slice(lhs);
                b.copy_from_slice(rhs);
                let cmp: fn($rust, $rust) -> Ordering = $cmp;
                Ok(cmp(<$rust>::from_le_bytes(a), <$rust>::from_le_bytes(b)))
            }
        }
    };
}

numeric_scalar!(Int16Access, Int16Ops, i16, "int16", 2, |a, b| a.cmp(&b));
numeric_scalar!(Int32Access, Int32Ops, i32, "int32", 4, |a, b| a.cmp(&b));
numeric_scalar!(Int64Access, Int64Ops, i64, "int64", 8, |a, b| a.cmp(&b));
numeric_scalar!(Float32Access, Float32Ops, f32, "float32", 4, |a, b| a
    .total_cmp(&b));
numeric_scalar!(Float64Access, Float64Ops, f64, "float64", 8, |a, b| a
    .total_cmp(&b));

// ============================================================================
// Bool
// ============================================================================

struct BoolAccess;

impl TypeAccess for BoolAccess {
    fn bin_length(&self, _rest: TamView<'_>, _source: &[u8]) -> usize {
        1
    }

    fn bin_get(
        &self,
        _rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: Option<&mut [u8]>,
        length: Option<&mut usize>,
        cursor: Option<&mut usize>,
    ) -> Result<BinOut> {
        scalar_bin_get("bool", 1, opts, source, target, length, cursor)
    }

    fn bin_set(
        &self,
        _rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: &mut Vec<u8>,
        cursor: usize,
    ) -> Result<()> {
        scalar_bin_set("bool", 1, opts, source, target, cursor)?;
        target[0] = (target[0] != 0) as u8;
        Ok(())
    }

    fn text_get(
        &self,
        _rest: TamView<'_>,
        source: &[u8],
        fmt: Option<&Formatter>,
    ) -> Result<String> {
        expect_len("bool", source, 1)?;
        Ok(apply_literal(fmt, (source[0] != 0).to_string()))
    }

    fn text_set(
        &self,
        _rest: TamView<'_>,
        text: &str,
        fmt: Option<&Formatter>,
    ) -> Result<Vec<u8>> {
        let text = strip_literal(fmt, text);
        match text.trim() {
            "true" | "t" | "1" => Ok(vec![1]),
            "false" | "f" | "0" => Ok(vec![0]),
            other => Err(Error::UserInput(format!("bool: cannot parse '{other}'"))),
        }
    }
}

struct BoolOps;

impl TypeOps for BoolOps {
    fn compare(&self, _rest: TamView<'_>, lhs: &[u8], rhs: &[u8]) -> Result<Ordering> {
        expect_len("bool", lhs, 1)?;
        expect_len("bool", rhs, 1)?;
        Ok((lhs[0] != 0).cmp(&(rhs[0] != 0)))
    }
}

// ============================================================================
// String
// ============================================================================

struct StringAccess;

impl TypeAccess for StringAccess {
    fn bin_get(
        &self,
        _rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: Option<&mut [u8]>,
        length: Option<&mut usize>,
        cursor: Option<&mut usize>,
    ) -> Result<BinOut> {
        let mode =
            bin_get_mode(opts, length.as_ref().map(|l| **l), cursor.as_ref().map(|c| **c))?;
        bin_get_apply(mode, source, target, length, cursor)
    }

    fn bin_set(
        &self,
        _rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: &mut Vec<u8>,
        cursor: usize,
    ) -> Result<()> {
        if opts.malloc {
            *target = source.to_vec();
        } else {
            target.truncate(cursor);
            target.extend_from_slice(source);
        }
        Ok(())
    }

    fn text_get(
        &self,
        _rest: TamView<'_>,
        source: &[u8],
        fmt: Option<&Formatter>,
    ) -> Result<String> {
        let text = std::str::from_utf8(source)
            .map_err(|_| Error::SchemaMismatch("string payload is not UTF-8".into()))?;
        Ok(apply_literal(fmt, text.to_string()))
    }

    fn text_set(
        &self,
        _rest: TamView<'_>,
        text: &str,
        fmt: Option<&Formatter>,
    ) -> Result<Vec<u8>> {
        Ok(strip_literal(fmt, text).into_owned().into_bytes())
    }
}

struct StringOps;

impl TypeOps for StringOps {
    fn compare(&self, _rest: TamView<'_>, lhs: &[u8], rhs: &[u8]) -> Result<Ordering> {
        Ok(lhs.cmp(rhs))
    }

    fn needs_destruct(&self) -> bool {
        true
    }
}

// ============================================================================
// Date / Timestamp
// ============================================================================

const DATE_PATTERN: &str = "%Y-%m-%d";
const TIMESTAMP_PATTERN: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn date_from_payload(source: &[u8]) -> Result<NaiveDate> {
    expect_len("date", source, 4)?;
    let days = i32::from_le_bytes([source[0], source[1], source[2], source[3]]);
    NaiveDate::from_num_days_from_ce_opt(days)
        .ok_or_else(|| Error::SchemaMismatch(format!("date: {days} days out of range")))
}

pub fn date_to_payload(date: NaiveDate) -> [u8; 4] {
    date.num_days_from_ce().to_le_bytes()
}

struct DateAccess;

impl TypeAccess for DateAccess {
    fn bin_length(&self, _rest: TamView<'_>, _source: &[u8]) -> usize {
        4
    }

    fn bin_get(
        &self,
        _rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: Option<&mut [u8]>,
        length: Option<&mut usize>,
        cursor: Option<&mut usize>,
    ) -> Result<BinOut> {
        scalar_bin_get("date", 4, opts, source, target, length, cursor)
    }

    fn bin_set(
        &self,
        _rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: &mut Vec<u8>,
        cursor: usize,
    ) -> Result<()> {
        scalar_bin_set("date", 4, opts, source, target, cursor)
    }

    fn text_get(
        &self,
        _rest: TamView<'_>,
        source: &[u8],
        fmt: Option<&Formatter>,
    ) -> Result<String> {
        let date = date_from_payload(source)?;
        let pattern = fmt.and_then(|f| f.pattern()).unwrap_or(DATE_PATTERN);
        Ok(apply_literal(fmt, date.format(pattern).to_string()))
    }

    fn text_set(
        &self,
        _rest: TamView<'_>,
        text: &str,
        fmt: Option<&Formatter>,
    ) -> Result<Vec<u8>> {
        let text = strip_literal(fmt, text);
        let pattern = fmt.and_then(|f| f.pattern()).unwrap_or(DATE_PATTERN);
        let date = NaiveDate::parse_from_str(text.trim(), pattern)
            .map_err(|e| Error::UserInput(format!("date: cannot parse '{text}': {e}")))?;
        Ok(date_to_payload(date).to_vec())
    }

    fn make_formatter(&self, pattern: &str) -> Result<Formatter> {
        if pattern == super::tam::LITERAL {
            Ok(Formatter::Literal)
        } else {
            // Any chrono strftime pattern is accepted as-is; parse failures
            // surface at conversion time with the offending text.
            Ok(Formatter::Pattern(pattern.to_string()))
        }
    }
}

struct DateOps;

impl TypeOps for DateOps {
    fn compare(&self, _rest: TamView<'_>, lhs: &[u8], rhs: &[u8]) -> Result<Ordering> {
        Ok(date_from_payload(lhs)?.cmp(&date_from_payload(rhs)?))
    }
}

fn timestamp_from_payload(source: &[u8]) -> Result<NaiveDateTime> {
    expect_len("timestamp", source, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(source);
    let micros = i64::from_le_bytes(raw);
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| Error::SchemaMismatch(format!("timestamp: {micros}us out of range")))
}

pub fn timestamp_to_payload(ts: NaiveDateTime) -> [u8; 8] {
    ts.and_utc().timestamp_micros().to_le_bytes()
}

struct TimestampAccess;

impl TypeAccess for TimestampAccess {
    fn bin_length(&self, _rest: TamView<'_>, _source: &[u8]) -> usize {
        8
    }

    fn bin_get(
        &self,
        _rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: Option<&mut [u8]>,
        length: Option<&mut usize>,
        cursor: Option<&mut usize>,
    ) -> Result<BinOut> {
        scalar_bin_get("timestamp", 8, opts, source, target, length, cursor)
    }

    fn bin_set(
        &self,
        _rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: &mut Vec<u8>,
        cursor: usize,
    ) -> Result<()> {
        scalar_bin_set("timestamp", 8, opts, source, target, cursor)
    }

    fn text_get(
        &self,
        _rest: TamView<'_>,
        source: &[u8],
        fmt: Option<&Formatter>,
    ) -> Result<String> {
        let ts = timestamp_from_payload(source)?;
        let pattern = fmt.and_then(|f| f.pattern()).unwrap_or(TIMESTAMP_PATTERN);
        Ok(apply_literal(fmt, ts.format(pattern).to_string()))
    }

    fn text_set(
        &self,
        _rest: TamView<'_>,
        text: &str,
        fmt: Option<&Formatter>,
    ) -> Result<Vec<u8>> {
        let text = strip_literal(fmt, text);
        let pattern = fmt.and_then(|f| f.pattern()).unwrap_or(TIMESTAMP_PATTERN);
        let ts = NaiveDateTime::parse_from_str(text.trim(), pattern)
            .map_err(|e| Error::UserInput(format!("timestamp: cannot parse '{text}': {e}")))?;
        Ok(timestamp_to_payload(ts).to_vec())
    }

    fn make_formatter(&self, pattern: &str) -> Result<Formatter> {
        if pattern == super::tam::LITERAL {
            Ok(Formatter::Literal)
        } else {
            Ok(Formatter::Pattern(pattern.to_string()))
        }
    }
}

struct TimestampOps;

impl TypeOps for TimestampOps {
    fn compare(&self, _rest: TamView<'_>, lhs: &[u8], rhs: &[u8]) -> Result<Ordering> {
        Ok(timestamp_from_payload(lhs)?.cmp(&timestamp_from_payload(rhs)?))
    }
}

// ============================================================================
// Array
// ============================================================================

/// Canonical array form: `count: u32 LE`, then per element either the inner
/// type's fixed width or, for varlen inner types, `len: u32 LE` + bytes.
pub fn array_pack(inner_varlen: bool, inner_width: usize, elements: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + elements.len() * inner_width.max(4));
    out.extend_from_slice(&(elements.len() as u32).to_le_bytes());
    for element in elements {
        if inner_varlen {
            out.extend_from_slice(&(element.len() as u32).to_le_bytes());
        }
        out.extend_from_slice(element);
    }
    out
}

/// Inverse of [`array_pack`].
pub fn array_unpack(
    inner_varlen: bool,
    inner_width: usize,
    source: &[u8],
) -> Result<Vec<Vec<u8>>> {
    if source.len() < 4 {
        return Err(Error::SchemaMismatch("array payload truncated".into()));
    }
    let count = u32::from_le_bytes([source[0], source[1], source[2], source[3]]) as usize;
    let mut at = 4usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let width = if inner_varlen {
            if at + 4 > source.len() {
                return Err(Error::SchemaMismatch("array element header truncated".into()));
            }
            let len =
                u32::from_le_bytes([source[at], source[at + 1], source[at + 2], source[at + 3]])
                    as usize;
            at += 4;
            len
        } else {
            inner_width
        };
        if at + width > source.len() {
            return Err(Error::SchemaMismatch("array element truncated".into()));
        }
        out.push(source[at..at + width].to_vec());
        at += width;
    }
    Ok(out)
}

struct ArrayAccess;

impl ArrayAccess {
    fn inner<'a>(rest: &TamView<'a>) -> Result<(&'a TypeRef, TamView<'a>)> {
        rest.next().ok_or_else(|| {
            Error::SchemaMismatch("array frame requires an inner type".into())
        })
    }
}

impl TypeAccess for ArrayAccess {
    fn bin_get(
        &self,
        rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: Option<&mut [u8]>,
        length: Option<&mut usize>,
        cursor: Option<&mut usize>,
    ) -> Result<BinOut> {
        let (inner, below) = Self::inner(&rest)?;
        let mode =
            bin_get_mode(opts, length.as_ref().map(|l| **l), cursor.as_ref().map(|c| **c))?;

        // Re-encode each element through the inner frame so wire endianness
        // applies per element, then apply the matrix to the whole rendering.
        let elements = array_unpack(inner.varlen, inner.size, source)?;
        let mut rendered = Vec::new();
        for element in &elements {
            let mut len = 0usize;
            let out = inner.tam.bin_get(
                below,
                &BinaryOpts { malloc: true, ..*opts },
                element,
                None,
                Some(&mut len),
                None,
            )?;
            match out {
                BinOut::Owned(bytes) => rendered.push(bytes),
                _ => {
                    return Err(Error::Invariant(
                        "array element get did not allocate".into(),
                    ));
                }
            }
        }
        let packed = array_pack(inner.varlen, inner.size, &rendered);
        bin_get_apply(mode, &packed, target, length, cursor)
    }

    fn bin_set(
        &self,
        rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: &mut Vec<u8>,
        _cursor: usize,
    ) -> Result<()> {
        let (inner, below) = Self::inner(&rest)?;
        let elements = array_unpack(inner.varlen, inner.size, source)?;
        let mut decoded = Vec::with_capacity(elements.len());
        for element in &elements {
            let mut slot = Vec::new();
            inner.tam.bin_set(below, opts, element, &mut slot, 0)?;
            decoded.push(slot);
        }
        *target = array_pack(inner.varlen, inner.size, &decoded);
        Ok(())
    }

    fn text_get(
        &self,
        rest: TamView<'_>,
        source: &[u8],
        fmt: Option<&Formatter>,
    ) -> Result<String> {
        let (inner, below) = Self::inner(&rest)?;
        let elements = array_unpack(inner.varlen, inner.size, source)?;
        let mut parts = Vec::with_capacity(elements.len());
        for element in &elements {
            parts.push(inner.tam.text_get(below, element, None)?);
        }
        Ok(apply_literal(fmt, format!("{{{}}}", parts.join(","))))
    }

    fn text_set(
        &self,
        rest: TamView<'_>,
        text: &str,
        fmt: Option<&Formatter>,
    ) -> Result<Vec<u8>> {
        let (inner, below) = Self::inner(&rest)?;
        let text = strip_literal(fmt, text);
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
            .ok_or_else(|| Error::UserInput(format!("array: cannot parse '{trimmed}'")))?;
        let mut elements = Vec::new();
        if !body.trim().is_empty() {
            for part in body.split(',') {
                elements.push(inner.tam.text_set(below, part.trim(), None)?);
            }
        }
        Ok(array_pack(inner.varlen, inner.size, &elements))
    }
}

struct ArrayOps;

impl TypeOps for ArrayOps {
    fn compare(&self, rest: TamView<'_>, lhs: &[u8], rhs: &[u8]) -> Result<Ordering> {
        let (inner, below) = rest.next().ok_or_else(|| {
            Error::SchemaMismatch("array frame requires an inner type".into())
        })?;
        let a = array_unpack(inner.varlen, inner.size, lhs)?;
        let b = array_unpack(inner.varlen, inner.size, rhs)?;
        for (ea, eb) in a.iter().zip(b.iter()) {
            match inner.tom.compare(below, ea, eb)? {
                Ordering::Equal => continue,
                other => return Ok(other),
            }
        }
        Ok(a.len().cmp(&b.len()))
    }

    fn needs_destruct(&self) -> bool {
        true
    }
}

// ============================================================================
// Singletons + registration
// ============================================================================

macro_rules! builtin_singleton {
    ($fn_name:ident, $tag:expr, $name:literal, $size:expr, $align:expr, $varlen:expr,
     $inner:expr, $access:expr, $ops:expr) => {
        pub fn $fn_name() -> TypeRef {
            static CELL: OnceLock<TypeRef> = OnceLock::new();
            Arc::clone(CELL.get_or_init(|| {
                Arc::new(Type {
                    tag: $tag,
                    name: $name,
                    size: $size,
                    align: $align,
                    varlen: $varlen,
                    inner: $inner,
                    tam: Arc::new($access),
                    tom: Arc::new($ops),
                })
            }))
        }
    };
}

builtin_singleton!(bool_, TAG_BOOL, "bool", 1, 1, false, InnerPolicy::Deny, BoolAccess, BoolOps);
builtin_singleton!(int16, TAG_INT16, "int16", 2, 2, false, InnerPolicy::Deny, Int16Access, Int16Ops);
builtin_singleton!(int32, TAG_INT32, "int32", 4, 4, false, InnerPolicy::Deny, Int32Access, Int32Ops);
builtin_singleton!(int64, TAG_INT64, "int64", 8, 8, false, InnerPolicy::Deny, Int64Access, Int64Ops);
builtin_singleton!(float32, TAG_FLOAT32, "float32", 4, 4, false, InnerPolicy::Deny, Float32Access, Float32Ops);
builtin_singleton!(float64, TAG_FLOAT64, "float64", 8, 8, false, InnerPolicy::Deny, Float64Access, Float64Ops);
builtin_singleton!(string, TAG_STRING, "string", VARLEN_SLOT_SIZE, 8, true, InnerPolicy::Deny, StringAccess, StringOps);
builtin_singleton!(date, TAG_DATE, "date", 4, 4, false, InnerPolicy::Deny, DateAccess, DateOps);
builtin_singleton!(timestamp, TAG_TIMESTAMP, "timestamp", 8, 8, false, InnerPolicy::Deny, TimestampAccess, TimestampOps);
builtin_singleton!(
    array,
    TAG_ARRAY,
    "array",
    VARLEN_SLOT_SIZE,
    8,
    true,
    InnerPolicy::Require { multiplier: 1 },
    ArrayAccess,
    ArrayOps
);

/// Publish every builtin into `registry`, along with the arithmetic
/// operators the planner's qual machinery relies on.
pub fn register_builtins(registry: &TypeRegistry) -> Result<()> {
    for ty in [
        bool_(),
        int16(),
        int32(),
        int64(),
        float32(),
        float64(),
        string(),
        date(),
        timestamp(),
        array(),
    ] {
        registry.register_ref(ty)?;
    }

    let operators = registry.operators();
    operators.register(
        TAG_INT64,
        "+",
        TAG_INT64,
        true,
        Arc::new(|a, b| {
            let mut ab = [0u8; 8];
            let mut bb = [0u8; 8];
            ab.copy_from_slice(a);
            bb.copy_from_slice(b);
            let sum = i64::from_le_bytes(ab).wrapping_add(i64::from_le_bytes(bb));
            Ok(sum.to_le_bytes().to_vec())
        }),
    );
    operators.register(
        TAG_FLOAT64,
        "+",
        TAG_FLOAT64,
        true,
        Arc::new(|a, b| {
            let mut ab = [0u8; 8];
            let mut bb = [0u8; 8];
            ab.copy_from_slice(a);
            bb.copy_from_slice(b);
            let sum = f64::from_le_bytes(ab) + f64::from_le_bytes(bb);
            Ok(sum.to_le_bytes().to_vec())
        }),
    );
    operators.register(
        TAG_STRING,
        "||",
        TAG_STRING,
        false,
        Arc::new(|a, b| Ok(a.iter().chain(b.iter()).copied().collect())),
    );

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::stack::TypeStack;
    use super::super::tam::split_stack;
    use super::*;

    fn roundtrip_binary(ty: &TypeRef, payload: &[u8]) {
        let stack = TypeStack::scalar(Arc::clone(ty));
        let (outer, rest) = split_stack(&stack);
        let opts = BinaryOpts::wire_big_endian().with_malloc();

        let mut len = 0usize;
        let wire = match outer
            .tam
            .bin_get(rest, &opts, payload, None, Some(&mut len), None)
            .unwrap()
        {
            BinOut::Owned(bytes) => bytes,
            other => panic!("expected owned bytes, got {other:?}"),
        };

        let mut back = Vec::new();
        outer.tam.bin_set(rest, &opts, &wire, &mut back, 0).unwrap();
        assert_eq!(back, payload, "binary round-trip for {}", ty.name);
    }

    #[test]
    fn test_binary_roundtrip_every_scalar() {
        roundtrip_binary(&bool_(), &[1]);
        roundtrip_binary(&int16(), &(-123i16).to_le_bytes());
        roundtrip_binary(&int32(), &7_000_000i32.to_le_bytes());
        roundtrip_binary(&int64(), &(-9_000_000_000i64).to_le_bytes());
        roundtrip_binary(&float32(), &1.5f32.to_le_bytes());
        roundtrip_binary(&float64(), &(-2.25f64).to_le_bytes());
        roundtrip_binary(&string(), b"varlen payload");
        roundtrip_binary(
            &date(),
            &date_to_payload(NaiveDate::from_ymd_opt(2017, 3, 14).unwrap()),
        );
        roundtrip_binary(
            &timestamp(),
            &timestamp_to_payload(
                NaiveDate::from_ymd_opt(2017, 3, 14)
                    .unwrap()
                    .and_hms_micro_opt(9, 26, 53, 589_793)
                    .unwrap(),
            ),
        );
    }

    fn roundtrip_text(ty: &TypeRef, payload: &[u8]) {
        let stack = TypeStack::scalar(Arc::clone(ty));
        let (outer, rest) = split_stack(&stack);

        let text = outer.tam.text_get(rest, payload, None).unwrap();
        let back = outer.tam.text_set(rest, &text, None).unwrap();
        let cmp = outer.tom.compare(rest, payload, &back).unwrap();
        assert_eq!(cmp, Ordering::Equal, "text round-trip for {}", ty.name);
    }

    #[test]
    fn test_text_roundtrip_every_scalar() {
        roundtrip_text(&bool_(), &[0]);
        roundtrip_text(&int16(), &321i16.to_le_bytes());
        roundtrip_text(&int32(), &(-44i32).to_le_bytes());
        roundtrip_text(&int64(), &1i64.to_le_bytes());
        roundtrip_text(&float64(), &0.5f64.to_le_bytes());
        roundtrip_text(&string(), b"hello");
        roundtrip_text(
            &date(),
            &date_to_payload(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
        );
    }

    #[test]
    fn test_date_pattern_formatter() {
        let date_ty = date();
        let fmt = date_ty.tam.make_formatter("%d.%m.%Y").unwrap();
        let payload = date_to_payload(NaiveDate::from_ymd_opt(2017, 3, 14).unwrap());
        let stack = TypeStack::scalar(Arc::clone(&date_ty));
        let (outer, rest) = split_stack(&stack);

        let text = outer.tam.text_get(rest, &payload, Some(&fmt)).unwrap();
        assert_eq!(text, "14.03.2017");
        let back = outer.tam.text_set(rest, &text, Some(&fmt)).unwrap();
        assert_eq!(back, payload.to_vec());
    }

    #[test]
    fn test_literal_formatter_quotes() {
        let string_ty = string();
        let stack = TypeStack::scalar(Arc::clone(&string_ty));
        let (outer, rest) = split_stack(&stack);
        let fmt = Formatter::Literal;

        let text = outer.tam.text_get(rest, b"o'brien", Some(&fmt)).unwrap();
        assert_eq!(text, "\"o'brien\"");
    }

    #[test]
    fn test_array_of_int32_roundtrip() {
        let stack = TypeStack::scalar(int32()).wrap(array()).unwrap();
        let (outer, rest) = split_stack(&stack);

        let payload = array_pack(
            false,
            4,
            &[
                5i32.to_le_bytes().to_vec(),
                (-6i32).to_le_bytes().to_vec(),
                7i32.to_le_bytes().to_vec(),
            ],
        );

        let opts = BinaryOpts::wire_big_endian().with_malloc();
        let mut len = 0usize;
        let wire = match outer
            .tam
            .bin_get(rest, &opts, &payload, None, Some(&mut len), None)
            .unwrap()
        {
            BinOut::Owned(bytes) => bytes,
            other => panic!("expected owned, got {other:?}"),
        };

        let mut back = Vec::new();
        outer.tam.bin_set(rest, &opts, &wire, &mut back, 0).unwrap();
        assert_eq!(back, payload);

        let text = outer.tam.text_get(rest, &payload, None).unwrap();
        assert_eq!(text, "{5,-6,7}");
    }

    #[test]
    fn test_array_compare_elementwise() {
        let stack = TypeStack::scalar(int32()).wrap(array()).unwrap();
        let (outer, rest) = split_stack(&stack);

        let a = array_pack(false, 4, &[1i32.to_le_bytes().to_vec(), 2i32.to_le_bytes().to_vec()]);
        let b = array_pack(false, 4, &[1i32.to_le_bytes().to_vec(), 3i32.to_le_bytes().to_vec()]);
        let short = array_pack(false, 4, &[1i32.to_le_bytes().to_vec()]);

        assert_eq!(outer.tom.compare(rest, &a, &b).unwrap(), Ordering::Less);
        assert_eq!(outer.tom.compare(rest, &a, &a).unwrap(), Ordering::Equal);
        assert_eq!(outer.tom.compare(rest, &short, &a).unwrap(), Ordering::Less);
    }
}
