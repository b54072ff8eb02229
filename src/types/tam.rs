//! Type access methods: binary, text, and memory-copy movement of values.
//!
//! Access methods compose through a rest-of-stack view: the outermost
//! frame's method receives a [`TamView`] of the remaining frames and may
//! fire into the next one, which is how an array-of-date gets its binary
//! form for free.
//!
//! The binary get contract is governed by a small decision matrix over the
//! `malloc` authorization, the `length` argument, and the `cursor` argument.
//! [`bin_get_mode`] classifies a call into a [`BinMode`] and refuses the
//! invalid mixes; every access method routes through it.

use std::fmt;

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{TypeRef, TypeTag, stack::TypeStack};
use crate::{Error, Result};

// ============================================================================
// Binary options + decision matrix
// ============================================================================

/// Options governing a binary access: wire endianness on each side and
/// whether the method is authorized to allocate.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryOpts {
    pub src_big_endian: bool,
    pub dst_big_endian: bool,
    pub malloc: bool,
}

impl BinaryOpts {
    pub fn engine() -> Self {
        Self::default()
    }

    pub fn wire_big_endian() -> Self {
        Self {
            src_big_endian: true,
            dst_big_endian: true,
            malloc: false,
        }
    }

    pub fn with_malloc(mut self) -> Self {
        self.malloc = true;
        self
    }
}

/// Classified behavior of one binary get call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinMode {
    /// Allocate up to the given byte limit; report the real size back
    /// through `length`.
    AllocCapped(usize),
    /// Allocate the full source size.
    AllocAll,
    /// No copy: report the full length only.
    LengthOnly,
    /// Copy up to `limit` bytes starting at the cursor; advance the cursor
    /// and report the full length.
    CursorCopy { at: usize, limit: usize },
    /// Copy into a caller buffer of `limit` bytes; fails when the source is
    /// larger.
    FitCopy { limit: usize },
}

/// Classify a binary get by the malloc/length/cursor matrix, refusing the
/// invalid combinations.
pub fn bin_get_mode(
    opts: &BinaryOpts,
    length: Option<usize>,
    cursor: Option<usize>,
) -> Result<BinMode> {
    match (opts.malloc, length, cursor) {
        // malloc without a length pointer is never valid.
        (true, None, _) => Err(Error::UserInput(
            "binary get: malloc requires a length".into(),
        )),
        // malloc never mixes with a cursor.
        (true, Some(_), Some(_)) => Err(Error::UserInput(
            "binary get: malloc cannot take a cursor".into(),
        )),
        (true, Some(0), None) => Ok(BinMode::AllocAll),
        (true, Some(limit), None) => Ok(BinMode::AllocCapped(limit)),
        (false, None, _) => Err(Error::UserInput(
            "binary get: a length is required without malloc".into(),
        )),
        (false, Some(0), _) => Ok(BinMode::LengthOnly),
        (false, Some(limit), Some(at)) => Ok(BinMode::CursorCopy { at, limit }),
        (false, Some(limit), None) => Ok(BinMode::FitCopy { limit }),
    }
}

/// Outcome of a binary get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinOut {
    /// Allocated by the method (malloc modes).
    Owned(Vec<u8>),
    /// Bytes copied into the caller's buffer.
    Copied(usize),
    /// Length report only; nothing moved.
    Length(usize),
}

/// Apply a classified [`BinMode`] to a fully materialized byte form.
/// Shared by every access method that can render its value contiguously.
pub fn bin_get_apply(
    mode: BinMode,
    rendered: &[u8],
    target: Option<&mut [u8]>,
    length: Option<&mut usize>,
    cursor: Option<&mut usize>,
) -> Result<BinOut> {
    match mode {
        BinMode::AllocAll => {
            if let Some(len) = length {
                *len = rendered.len();
            }
            Ok(BinOut::Owned(rendered.to_vec()))
        }
        BinMode::AllocCapped(limit) => {
            let take = rendered.len().min(limit);
            if let Some(len) = length {
                *len = take;
            }
            Ok(BinOut::Owned(rendered[..take].to_vec()))
        }
        BinMode::LengthOnly => {
            if let Some(len) = length {
                *len = rendered.len();
            }
            Ok(BinOut::Length(rendered.len()))
        }
        BinMode::CursorCopy { at, limit } => {
            let target = target.ok_or_else(|| {
                Error::UserInput("binary get: cursor copy requires a target buffer".into())
            })?;
            let start = at.min(rendered.len());
            let take = (rendered.len() - start).min(limit).min(target.len());
            target[..take].copy_from_slice(&rendered[start..start + take]);
            if let Some(cur) = cursor {
                *cur = start + take;
            }
            if let Some(len) = length {
                *len = rendered.len();
            }
            Ok(BinOut::Copied(take))
        }
        BinMode::FitCopy { limit } => {
            if rendered.len() > limit {
                return Err(Error::UserInput(format!(
                    "binary get: source of {} bytes exceeds the {limit}-byte buffer and no cursor was supplied",
                    rendered.len()
                )));
            }
            let target = target.ok_or_else(|| {
                Error::UserInput("binary get: copy requires a target buffer".into())
            })?;
            target[..rendered.len()].copy_from_slice(rendered);
            if let Some(len) = length {
                *len = rendered.len();
            }
            Ok(BinOut::Copied(rendered.len()))
        }
    }
}

// ============================================================================
// Rest-of-stack view
// ============================================================================

/// The frames below the one currently executing, outermost first.
#[derive(Clone, Copy)]
pub struct TamView<'a> {
    rest: &'a [TypeRef],
}

impl<'a> TamView<'a> {
    pub fn empty() -> Self {
        Self { rest: &[] }
    }

    pub fn over(rest: &'a [TypeRef]) -> Self {
        Self { rest }
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    /// The next frame down and the view below it.
    pub fn next(&self) -> Option<(&'a TypeRef, TamView<'a>)> {
        self.rest.split_first().map(|(ty, rest)| (ty, TamView { rest }))
    }

    pub fn depth(&self) -> usize {
        self.rest.len()
    }
}

/// Split a stack into its outermost frame and the view of the rest, the
/// calling convention for firing an access method.
pub fn split_stack(stack: &TypeStack) -> (&TypeRef, TamView<'_>) {
    let frames = stack.frames();
    (&frames[0], TamView::over(&frames[1..]))
}

// ============================================================================
// Formatters
// ============================================================================

/// Pattern name that selects [`Formatter::Literal`].
pub const LITERAL: &str = "LITERAL";

/// A text conversion policy produced by a formatter factory and cached per
/// pattern. `Literal` wraps the textual form in double quotes for SQL
/// embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formatter {
    Literal,
    Pattern(String),
}

impl Formatter {
    pub fn pattern(&self) -> Option<&str> {
        match self {
            Formatter::Literal => None,
            Formatter::Pattern(p) => Some(p),
        }
    }
}

/// Wrap `text` per the formatter: double quotes (with embedded quotes
/// doubled) under `Literal`, unchanged otherwise.
pub fn apply_literal(fmt: Option<&Formatter>, text: String) -> String {
    match fmt {
        Some(Formatter::Literal) => format!("\"{}\"", text.replace('"', "\"\"")),
        _ => text,
    }
}

/// Strip `Literal` quoting before parsing, when present.
pub fn strip_literal<'t>(fmt: Option<&Formatter>, text: &'t str) -> std::borrow::Cow<'t, str> {
    match fmt {
        Some(Formatter::Literal)
            if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') =>
        {
            std::borrow::Cow::Owned(text[1..text.len() - 1].replace("\"\"", "\""))
        }
        _ => std::borrow::Cow::Borrowed(text),
    }
}

/// Per-(type, pattern) formatter cache, so pattern parsing happens once.
pub struct FormatterCache {
    cache: Mutex<HashMap<(TypeTag, String), Formatter>>,
}

impl FormatterCache {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, ty: &TypeRef, pattern: &str) -> Result<Formatter> {
        let key = (ty.tag, pattern.to_string());
        if let Some(found) = self.cache.lock().get(&key) {
            return Ok(found.clone());
        }
        let made = ty.tam.make_formatter(pattern)?;
        self.cache.lock().insert(key, made.clone());
        Ok(made)
    }
}

impl Default for FormatterCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TypeAccess
// ============================================================================

/// The access-method vector registered with each type.
///
/// `source` and the returned bytes are the type's canonical engine form:
/// little-endian fixed-width bytes for scalars, raw content bytes for
/// variable-length types. Endianness conversion to and from the wire happens
/// inside the method per [`BinaryOpts`].
pub trait TypeAccess: Send + Sync {
    /// Length, in bytes, of the wire form of `source`.
    fn bin_length(&self, _rest: TamView<'_>, source: &[u8]) -> usize {
        source.len()
    }

    /// Serialize `source` per the decision matrix.
    fn bin_get(
        &self,
        rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: Option<&mut [u8]>,
        length: Option<&mut usize>,
        cursor: Option<&mut usize>,
    ) -> Result<BinOut>;

    /// Deserialize wire bytes into the canonical form. With `malloc` the
    /// target is constructed from scratch; without it, a non-zero `cursor`
    /// appends starting at that byte.
    fn bin_set(
        &self,
        rest: TamView<'_>,
        opts: &BinaryOpts,
        source: &[u8],
        target: &mut Vec<u8>,
        cursor: usize,
    ) -> Result<()>;

    /// Render the canonical form as text.
    fn text_get(
        &self,
        rest: TamView<'_>,
        source: &[u8],
        fmt: Option<&Formatter>,
    ) -> Result<String>;

    /// Parse text into the canonical form.
    fn text_set(&self, rest: TamView<'_>, text: &str, fmt: Option<&Formatter>)
    -> Result<Vec<u8>>;

    /// Build a formatter for `pattern`. The default recognizes only the
    /// [`LITERAL`] sentinel.
    fn make_formatter(&self, pattern: &str) -> Result<Formatter> {
        if pattern == LITERAL {
            Ok(Formatter::Literal)
        } else {
            Err(Error::Unsupported(format!(
                "no formatter for pattern '{pattern}'"
            )))
        }
    }

    /// Fast varlen-aware copy of the canonical form. `transfer_owner`
    /// carries the owning-buffer identity with the bytes when set; the
    /// default canonical form has no owner, so it copies either way.
    fn memcopy(&self, _rest: TamView<'_>, source: &[u8], _transfer_owner: bool) -> Vec<u8> {
        source.to_vec()
    }
}

impl fmt::Debug for dyn TypeAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn TypeAccess")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(malloc: bool) -> BinaryOpts {
        BinaryOpts {
            malloc,
            ..BinaryOpts::default()
        }
    }

    #[test]
    fn test_matrix_malloc_rows() {
        // Y / non-null non-zero / null → allocate capped.
        assert_eq!(
            bin_get_mode(&opts(true), Some(4), None).unwrap(),
            BinMode::AllocCapped(4)
        );
        // Y / non-null zero / null → allocate all.
        assert_eq!(
            bin_get_mode(&opts(true), Some(0), None).unwrap(),
            BinMode::AllocAll
        );
        // Y / null → invalid.
        assert!(bin_get_mode(&opts(true), None, None).is_err());
        // Y with a cursor → invalid.
        assert!(bin_get_mode(&opts(true), Some(0), Some(2)).is_err());
        assert!(bin_get_mode(&opts(true), Some(8), Some(0)).is_err());
    }

    #[test]
    fn test_matrix_copy_rows() {
        // N / non-null non-zero / non-null → cursor copy.
        assert_eq!(
            bin_get_mode(&opts(false), Some(8), Some(3)).unwrap(),
            BinMode::CursorCopy { at: 3, limit: 8 }
        );
        // N / non-null zero → length only.
        assert_eq!(
            bin_get_mode(&opts(false), Some(0), None).unwrap(),
            BinMode::LengthOnly
        );
        // N / non-null non-zero / null → fit copy (fails later if too big).
        assert_eq!(
            bin_get_mode(&opts(false), Some(8), None).unwrap(),
            BinMode::FitCopy { limit: 8 }
        );
        // N / null → invalid.
        assert!(bin_get_mode(&opts(false), None, None).is_err());
    }

    #[test]
    fn test_apply_fit_copy_overflow() {
        let rendered = [1u8, 2, 3, 4, 5];
        let mut buf = [0u8; 4];
        let err = bin_get_apply(
            BinMode::FitCopy { limit: 4 },
            &rendered,
            Some(&mut buf),
            None,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_apply_cursor_copy_advances() {
        let rendered = [10u8, 11, 12, 13, 14, 15];
        let mut buf = [0u8; 4];
        let mut cursor = 0usize;
        let mut length = 0usize;

        let out = bin_get_apply(
            BinMode::CursorCopy { at: cursor, limit: 4 },
            &rendered,
            Some(&mut buf),
            Some(&mut length),
            Some(&mut cursor),
        )
        .unwrap();
        assert_eq!(out, BinOut::Copied(4));
        assert_eq!(buf, [10, 11, 12, 13]);
        assert_eq!(cursor, 4);
        assert_eq!(length, 6);

        let out = bin_get_apply(
            BinMode::CursorCopy { at: cursor, limit: 4 },
            &rendered,
            Some(&mut buf),
            Some(&mut length),
            Some(&mut cursor),
        )
        .unwrap();
        assert_eq!(out, BinOut::Copied(2));
        assert_eq!(&buf[..2], &[14, 15]);
        assert_eq!(cursor, 6);
    }

    #[test]
    fn test_literal_quoting() {
        let quoted = apply_literal(Some(&Formatter::Literal), "o\"k".into());
        assert_eq!(quoted, "\"o\"\"k\"");
        assert_eq!(strip_literal(Some(&Formatter::Literal), &quoted), "o\"k");
        assert_eq!(apply_literal(None, "plain".into()), "plain");
    }
}
