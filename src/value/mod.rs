//! Runtime-typed values.
//!
//! Two representations share the same canonical payload bytes:
//!
//! - [`TypedSlot`]: a stack-friendly value holder (tag vector + inline
//!   payload for small scalars, owned buffer otherwise). The parameter and
//!   qual currency of the engine.
//! - [`TypedVar`]: the heap form whose byte encoding is the tag header
//!   followed by the payload, so a payload pointer alone is enough to
//!   reconstruct the type stack. Also carries the array form.

pub mod exec;

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

use crate::types::builtin;
use crate::types::stack::TypeStack;
use crate::types::tam::{Formatter, split_stack};
use crate::{Error, Result};

// ============================================================================
// TypedSlot
// ============================================================================

const INLINE_MAX: usize = 16;

#[derive(Clone)]
enum SlotData {
    Null,
    Inline { len: u8, buf: [u8; INLINE_MAX] },
    Owned(Vec<u8>),
}

/// A compact runtime-typed value. Small scalars live inline; anything larger
/// owns a buffer. Copy, move, reset and is-null are cheap and explicit.
#[derive(Clone)]
pub struct TypedSlot {
    stack: TypeStack,
    data: SlotData,
}

impl TypedSlot {
    pub fn null(stack: TypeStack) -> Self {
        Self {
            stack,
            data: SlotData::Null,
        }
    }

    pub fn from_payload(stack: TypeStack, payload: &[u8]) -> Self {
        let data = if payload.len() <= INLINE_MAX {
            let mut buf = [0u8; INLINE_MAX];
            buf[..payload.len()].copy_from_slice(payload);
            SlotData::Inline {
                len: payload.len() as u8,
                buf,
            }
        } else {
            SlotData::Owned(payload.to_vec())
        };
        Self { stack, data }
    }

    // ========================================================================
    // Constructors over builtins
    // ========================================================================

    pub fn bool_(v: bool) -> Self {
        Self::from_payload(TypeStack::scalar(builtin::bool_()), &[v as u8])
    }

    pub fn int16(v: i16) -> Self {
        Self::from_payload(TypeStack::scalar(builtin::int16()), &v.to_le_bytes())
    }

    pub fn int32(v: i32) -> Self {
        Self::from_payload(TypeStack::scalar(builtin::int32()), &v.to_le_bytes())
    }

    pub fn int64(v: i64) -> Self {
        Self::from_payload(TypeStack::scalar(builtin::int64()), &v.to_le_bytes())
    }

    pub fn float32(v: f32) -> Self {
        Self::from_payload(TypeStack::scalar(builtin::float32()), &v.to_le_bytes())
    }

    pub fn float64(v: f64) -> Self {
        Self::from_payload(TypeStack::scalar(builtin::float64()), &v.to_le_bytes())
    }

    pub fn string(v: impl AsRef<str>) -> Self {
        Self::from_payload(
            TypeStack::scalar(builtin::string()),
            v.as_ref().as_bytes(),
        )
    }

    pub fn date(v: NaiveDate) -> Self {
        Self::from_payload(
            TypeStack::scalar(builtin::date()),
            &builtin::date_to_payload(v),
        )
    }

    pub fn timestamp(v: NaiveDateTime) -> Self {
        Self::from_payload(
            TypeStack::scalar(builtin::timestamp()),
            &builtin::timestamp_to_payload(v),
        )
    }

    // ========================================================================
    // Shape
    // ========================================================================

    pub fn stack(&self) -> &TypeStack {
        &self.stack
    }

    pub fn is_null(&self) -> bool {
        matches!(self.data, SlotData::Null)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match &self.data {
            SlotData::Null => None,
            SlotData::Inline { len, buf } => Some(&buf[..*len as usize]),
            SlotData::Owned(bytes) => Some(bytes),
        }
    }

    /// Clear to null, keeping the type stack.
    pub fn reset(&mut self) {
        self.data = SlotData::Null;
    }

    /// Move the value out, leaving this slot null.
    pub fn take(&mut self) -> TypedSlot {
        let data = std::mem::replace(&mut self.data, SlotData::Null);
        TypedSlot {
            stack: self.stack.clone(),
            data,
        }
    }

    // ========================================================================
    // Extraction
    // ========================================================================

    pub fn as_bool(&self) -> Option<bool> {
        match (self.stack.innermost().tag, self.payload()) {
            (builtin::TAG_BOOL, Some(p)) if p.len() == 1 => Some(p[0] != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        let payload = self.payload()?;
        match self.stack.innermost().tag {
            builtin::TAG_INT64 => Some(i64::from_le_bytes(payload.try_into().ok()?)),
            builtin::TAG_INT32 => Some(i32::from_le_bytes(payload.try_into().ok()?) as i64),
            builtin::TAG_INT16 => Some(i16::from_le_bytes(payload.try_into().ok()?) as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        let payload = self.payload()?;
        match self.stack.innermost().tag {
            builtin::TAG_FLOAT64 => Some(f64::from_le_bytes(payload.try_into().ok()?)),
            builtin::TAG_FLOAT32 => Some(f32::from_le_bytes(payload.try_into().ok()?) as f64),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match (self.stack.innermost().tag, self.payload()) {
            (builtin::TAG_STRING, Some(p)) => std::str::from_utf8(p).ok(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match (self.stack.innermost().tag, self.payload()) {
            (builtin::TAG_DATE, Some(p)) if p.len() == 4 => {
                let days = i32::from_le_bytes(p.try_into().ok()?);
                NaiveDate::from_num_days_from_ce_opt(days)
            }
            _ => None,
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Compare through the type's operator method. Nulls order before
    /// values; two nulls compare equal.
    pub fn compare(&self, other: &TypedSlot) -> Result<Ordering> {
        if !self.stack.matches(&other.stack) {
            return Err(Error::SchemaMismatch(format!(
                "cannot compare {} with {}",
                self.stack.describe(),
                other.stack.describe()
            )));
        }
        match (self.payload(), other.payload()) {
            (None, None) => Ok(Ordering::Equal),
            (None, Some(_)) => Ok(Ordering::Less),
            (Some(_), None) => Ok(Ordering::Greater),
            (Some(lhs), Some(rhs)) => {
                let (outer, rest) = split_stack(&self.stack);
                outer.tom.compare(rest, lhs, rhs)
            }
        }
    }

    /// Render through the text access method.
    pub fn to_text(&self, fmt: Option<&Formatter>) -> Result<String> {
        match self.payload() {
            None => Ok("null".to_string()),
            Some(payload) => {
                let (outer, rest) = split_stack(&self.stack);
                outer.tam.text_get(rest, payload, fmt)
            }
        }
    }

    /// Parse text through the text access method.
    pub fn from_text(stack: TypeStack, text: &str, fmt: Option<&Formatter>) -> Result<Self> {
        let payload = {
            let (outer, rest) = split_stack(&stack);
            outer.tam.text_set(rest, text, fmt)?
        };
        Ok(Self::from_payload(stack, &payload))
    }
}

impl PartialEq for TypedSlot {
    fn eq(&self, other: &Self) -> bool {
        self.stack.matches(&other.stack) && self.payload() == other.payload()
    }
}

impl std::fmt::Debug for TypedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_text(None) {
            Ok(text) => write!(f, "TypedSlot({}: {text})", self.stack.describe()),
            Err(_) => write!(f, "TypedSlot({}: <opaque>)", self.stack.describe()),
        }
    }
}

// ============================================================================
// TypedVar
// ============================================================================

/// Array bookkeeping for the heap form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayMeta {
    /// Bytes between consecutive element payloads, padded to the element
    /// alignment.
    pub stride: usize,
    pub capacity: usize,
    pub count: usize,
    /// Optional table of contents: byte offset of each element from the
    /// start of the element buffer. Each element's back-link to the array
    /// header is its own entry.
    pub toc: Option<Vec<u32>>,
}

/// The heap representation: encoded tag header + payload in one allocation.
/// Given only a payload pointer, walking backwards over the header recovers
/// the stack (see [`crate::types::stack::walk_back`]).
#[derive(Clone)]
pub struct TypedVar {
    stack: TypeStack,
    payload: Vec<u8>,
    array: Option<ArrayMeta>,
}

impl TypedVar {
    pub fn scalar(stack: TypeStack, payload: Vec<u8>) -> Self {
        Self {
            stack,
            payload,
            array: None,
        }
    }

    /// Allocate the array form with room for `capacity` elements of the
    /// inner stack.
    pub fn array(stack: TypeStack, capacity: usize) -> Result<Self> {
        if !stack.outermost().inner.requires_inner() {
            return Err(Error::UserInput(format!(
                "'{}' is not an array-forming type",
                stack.outermost().name
            )));
        }
        let inner_width = stack.frames()[1..]
            .iter()
            .map(|t| t.size)
            .next()
            .unwrap_or(0);
        let align = stack.max_align().max(1);
        let stride = inner_width.div_ceil(align) * align;
        Ok(Self {
            stack,
            payload: vec![0u8; stride * capacity],
            array: Some(ArrayMeta {
                stride,
                capacity,
                count: 0,
                toc: Some(Vec::with_capacity(capacity)),
            }),
        })
    }

    pub fn stack(&self) -> &TypeStack {
        &self.stack
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn array_meta(&self) -> Option<&ArrayMeta> {
        self.array.as_ref()
    }

    /// Append one element payload to the array form.
    pub fn push_element(&mut self, element: &[u8]) -> Result<()> {
        let meta = self
            .array
            .as_mut()
            .ok_or_else(|| Error::UserInput("not an array var".into()))?;
        if meta.count == meta.capacity {
            meta.capacity = (meta.capacity * 2).max(4);
            self.payload.resize(meta.stride * meta.capacity, 0);
        }
        let offset = meta.count * meta.stride;
        let take = element.len().min(meta.stride);
        self.payload[offset..offset + take].copy_from_slice(&element[..take]);
        if let Some(toc) = meta.toc.as_mut() {
            toc.push(offset as u32);
        }
        meta.count += 1;
        Ok(())
    }

    pub fn element(&self, index: usize) -> Option<&[u8]> {
        let meta = self.array.as_ref()?;
        if index >= meta.count {
            return None;
        }
        let offset = index * meta.stride;
        Some(&self.payload[offset..offset + meta.stride])
    }

    /// Encode as header + payload. The payload starts right after the
    /// header, so the terminator word is payload-adjacent.
    pub fn encode(&self) -> Vec<u8> {
        let header = self.stack.encode_header();
        let mut out = Vec::with_capacity(header.len() + self.payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Offset of the payload within [`TypedVar::encode`]'s output.
    pub fn payload_offset(&self) -> usize {
        self.stack.encode_header().len()
    }

    /// Decode an encoded var: skip leading padding words, collect tag words
    /// through the terminator, treat the rest as payload.
    pub fn decode(bytes: &[u8], registry: &crate::types::TypeRegistry) -> Result<Self> {
        let mut at = 0usize;
        while at + 2 <= bytes.len() && bytes[at] == 0 && bytes[at + 1] == 0 {
            at += 2;
        }
        let mut header_end = None;
        let mut scan = at;
        while scan + 2 <= bytes.len() {
            let word = u16::from_le_bytes([bytes[scan], bytes[scan + 1]]);
            scan += 2;
            if word & crate::types::TypeTag::TERMINATOR != 0 {
                header_end = Some(scan);
                break;
            }
        }
        let header_end = header_end
            .ok_or_else(|| Error::SchemaMismatch("encoded var lacks a terminator".into()))?;
        let stack = TypeStack::decode_header(&bytes[..header_end], registry)?;
        Ok(Self {
            stack,
            payload: bytes[header_end..].to_vec(),
            array: None,
        })
    }
}

impl std::fmt::Debug for TypedVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TypedVar({}, {} payload bytes{})",
            self.stack.describe(),
            self.payload.len(),
            match &self.array {
                Some(meta) => format!(", array {}/{}", meta.count, meta.capacity),
                None => String::new(),
            }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
