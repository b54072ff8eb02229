//! Bounded type stacks and their encoded tag headers.
//!
//! A stack is ordered outermost-first: `[array, date]` is an array of dates.
//! Depth is capped at [`MAX_DEPTH`]. The encoded header form writes one tag
//! word per frame, innermost first, with the terminator bit set on the
//! outermost word — the word adjacent to the payload — so walking backwards
//! from a payload always reconstructs the stack without extra bookkeeping.

use smallvec::SmallVec;

use super::{TypeRef, TypeRegistry, TypeTag};
use crate::{Error, Result};

/// Maximum nesting depth of a type stack.
pub const MAX_DEPTH: usize = 8;

/// Width of the fixed payload slot used by variable-length stacks.
pub const VARLEN_SLOT_SIZE: usize = 16;

// ============================================================================
// TypeStack
// ============================================================================

/// An ordered, bounded stack of type frames, outermost first.
#[derive(Clone)]
pub struct TypeStack {
    frames: SmallVec<[TypeRef; MAX_DEPTH]>,
}

impl TypeStack {
    /// Single-frame stack over a scalar type.
    pub fn scalar(ty: TypeRef) -> Self {
        Self {
            frames: smallvec::smallvec![ty],
        }
    }

    /// Build from frames ordered outermost-first, applying the same policy
    /// and depth checks as [`TypeStack::wrap`].
    pub fn from_frames(frames: impl IntoIterator<Item = TypeRef>) -> Result<Self> {
        let mut iter = frames.into_iter().collect::<Vec<_>>().into_iter().rev();
        let innermost = iter
            .next()
            .ok_or_else(|| Error::UserInput("empty type stack".into()))?;
        let mut built = TypeStack::scalar(innermost);
        for ty in iter {
            built = built.wrap(ty)?;
        }
        Ok(built)
    }

    /// Wrap the stack in an additional outer frame.
    ///
    /// Fails when the stack is already at [`MAX_DEPTH`] or the outer type
    /// does not accept an inner type.
    pub fn wrap(&self, outer: TypeRef) -> Result<Self> {
        if self.frames.len() >= MAX_DEPTH {
            return Err(Error::UserInput(format!(
                "type stack depth limit {MAX_DEPTH} reached; cannot push '{}'",
                outer.name
            )));
        }
        if !outer.inner.accepts_inner() {
            return Err(Error::UserInput(format!(
                "type '{}' cannot wrap an inner type",
                outer.name
            )));
        }
        let mut frames = SmallVec::with_capacity(self.frames.len() + 1);
        frames.push(outer);
        frames.extend(self.frames.iter().cloned());
        Ok(Self { frames })
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn outermost(&self) -> &TypeRef {
        &self.frames[0]
    }

    pub fn innermost(&self) -> &TypeRef {
        &self.frames[self.frames.len() - 1]
    }

    /// Frames ordered outermost-first.
    pub fn frames(&self) -> &[TypeRef] {
        &self.frames
    }

    /// True when any frame is variable-length.
    pub fn is_varlen(&self) -> bool {
        self.frames.iter().any(|t| t.varlen)
    }

    /// True when any frame registers a constructor.
    pub fn has_construct(&self) -> bool {
        self.frames.iter().any(|t| t.needs_construct())
    }

    /// True when any frame registers a destructor.
    pub fn has_destruct(&self) -> bool {
        self.frames.iter().any(|t| t.needs_destruct())
    }

    /// Width of the fixed payload slot for one value of this stack.
    /// Variable-length stacks use the out-of-line slot; fixed stacks fold
    /// the innermost width through each wrapping frame's multiplier.
    pub fn slot_width(&self) -> usize {
        if self.is_varlen() {
            return VARLEN_SLOT_SIZE;
        }
        let mut width = self.innermost().size;
        for frame in self.frames.iter().rev().skip(1) {
            match frame.inner {
                super::InnerPolicy::Allow { multiplier }
                | super::InnerPolicy::Require { multiplier } => width *= multiplier,
                super::InnerPolicy::Deny => {}
            }
        }
        width
    }

    /// Strictest alignment requirement across frames.
    pub fn max_align(&self) -> usize {
        self.frames.iter().map(|t| t.align).max().unwrap_or(1)
    }

    /// Tag-for-tag equality.
    pub fn matches(&self, other: &TypeStack) -> bool {
        self.frames.len() == other.frames.len()
            && self
                .frames
                .iter()
                .zip(other.frames.iter())
                .all(|(a, b)| a.tag == b.tag)
    }

    /// Fixed-width key for hashing a whole stack: tags left-filled, the rest
    /// zero.
    pub fn key(&self) -> TypeStackKey {
        let mut tags = [0u16; MAX_DEPTH];
        for (slot, frame) in tags.iter_mut().zip(self.frames.iter()) {
            *slot = frame.tag.0;
        }
        TypeStackKey(tags)
    }

    pub fn tags(&self) -> SmallVec<[TypeTag; MAX_DEPTH]> {
        self.frames.iter().map(|t| t.tag).collect()
    }

    pub fn describe(&self) -> String {
        self.frames
            .iter()
            .map(|t| t.name)
            .collect::<Vec<_>>()
            .join(" of ")
    }

    // ========================================================================
    // Encoded header form
    // ========================================================================

    /// Encode the tag header: one little-endian word per frame, innermost
    /// first, terminator bit on the outermost (final, payload-adjacent)
    /// word. Zero padding words are prepended so the header length is a
    /// multiple of the stack's max alignment.
    pub fn encode_header(&self) -> Vec<u8> {
        let words = self.frames.len();
        let align = self.max_align().max(2);
        let raw = words * 2;
        let padded = raw.div_ceil(align) * align;
        let mut out = vec![0u8; padded];

        let mut at = padded - raw;
        for (i, frame) in self.frames.iter().rev().enumerate() {
            let mut word = frame.tag.0;
            if i == words - 1 {
                word |= TypeTag::TERMINATOR;
            }
            out[at..at + 2].copy_from_slice(&word.to_le_bytes());
            at += 2;
        }
        out
    }

    /// Reconstruct a stack by walking backwards from the end of `header`
    /// (the byte immediately before the payload).
    ///
    /// The final word must carry the terminator bit; earlier words are inner
    /// frames until a zero padding word, the start of the buffer, or
    /// [`MAX_DEPTH`] words.
    pub fn decode_header(header: &[u8], registry: &TypeRegistry) -> Result<Self> {
        if header.len() < 2 {
            return Err(Error::SchemaMismatch("tag header shorter than one word".into()));
        }
        let words = walk_back(header)?;

        // Walk order is outermost-first, which is stack order.
        let mut frames = SmallVec::new();
        for word in words {
            frames.push(registry.by_tag(TypeTag(word & !TypeTag::TERMINATOR))?);
        }
        Ok(Self { frames })
    }
}

impl std::fmt::Debug for TypeStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeStack[{}]", self.describe())
    }
}

impl From<TypeRef> for TypeStack {
    fn from(ty: TypeRef) -> Self {
        TypeStack::scalar(ty)
    }
}

impl From<&TypeRef> for TypeStack {
    fn from(ty: &TypeRef) -> Self {
        TypeStack::scalar(std::sync::Arc::clone(ty))
    }
}

/// Raw tag words recovered by walking backwards from the payload edge of a
/// header, outermost first. Errors when the terminator bit is missing from
/// the final word or appears more than once within [`MAX_DEPTH`] words.
pub fn walk_back(header: &[u8]) -> Result<SmallVec<[u16; MAX_DEPTH]>> {
    let mut words: SmallVec<[u16; MAX_DEPTH]> = SmallVec::new();
    let mut at = header.len();
    let mut terminators = 0usize;

    while at >= 2 && words.len() < MAX_DEPTH {
        let word = u16::from_le_bytes([header[at - 2], header[at - 1]]);
        if word == 0 {
            break;
        }
        if word & TypeTag::TERMINATOR != 0 {
            terminators += 1;
            if terminators > 1 {
                return Err(Error::SchemaMismatch(
                    "tag header carries more than one terminator".into(),
                ));
            }
        }
        words.push(word);
        at -= 2;
    }

    if words.is_empty() {
        return Err(Error::SchemaMismatch("empty tag header".into()));
    }
    if words[0] & TypeTag::TERMINATOR == 0 {
        return Err(Error::SchemaMismatch(
            "payload-adjacent tag word lacks the terminator".into(),
        ));
    }
    Ok(words)
}

// ============================================================================
// TypeStackKey
// ============================================================================

/// A whole type stack packed into a fixed, hashable key. Tags fill from the
/// left; unused slots are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeStackKey(pub [u16; MAX_DEPTH]);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::builtin;
    use super::*;

    #[test]
    fn test_scalar_stack_layout() {
        let stack = TypeStack::scalar(builtin::int64());
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.slot_width(), 8);
        assert_eq!(stack.max_align(), 8);
        assert!(!stack.is_varlen());
    }

    #[test]
    fn test_varlen_stack_uses_slot() {
        let stack = TypeStack::scalar(builtin::string());
        assert_eq!(stack.slot_width(), VARLEN_SLOT_SIZE);
        assert!(stack.is_varlen());
    }

    #[test]
    fn test_wrap_depth_limit() {
        let array = builtin::array();
        let mut stack = TypeStack::scalar(builtin::int32());
        for _ in 0..MAX_DEPTH - 1 {
            stack = stack.wrap(std::sync::Arc::clone(&array)).unwrap();
        }
        assert_eq!(stack.depth(), MAX_DEPTH);
        let err = stack.wrap(array).unwrap_err();
        assert!(err.to_string().contains("depth limit"));
    }

    #[test]
    fn test_scalar_refuses_inner() {
        let stack = TypeStack::scalar(builtin::int32());
        assert!(stack.wrap(builtin::int64()).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let registry = TypeRegistry::with_builtins().unwrap();
        let stack = TypeStack::scalar(builtin::date())
            .wrap(builtin::array())
            .unwrap();

        let header = stack.encode_header();
        let decoded = TypeStack::decode_header(&header, &registry).unwrap();
        assert!(decoded.matches(&stack));
        assert_eq!(decoded.describe(), "array of date");
    }

    #[test]
    fn test_walk_back_exactly_one_terminator() {
        let stack = TypeStack::scalar(builtin::int16())
            .wrap(builtin::array())
            .unwrap();
        let header = stack.encode_header();
        let words = walk_back(&header).unwrap();
        assert_eq!(words.len(), 2);
        let terminators = words
            .iter()
            .filter(|w| *w & TypeTag::TERMINATOR != 0)
            .count();
        assert_eq!(terminators, 1);

        // Corrupt an inner word with a second terminator.
        let mut bad = header.clone();
        let n = bad.len();
        let inner = u16::from_le_bytes([bad[n - 4], bad[n - 3]]) | TypeTag::TERMINATOR;
        bad[n - 4..n - 2].copy_from_slice(&inner.to_le_bytes());
        assert!(walk_back(&bad).is_err());
    }

    #[test]
    fn test_missing_terminator_rejected() {
        let stack = TypeStack::scalar(builtin::int64());
        let mut header = stack.encode_header();
        let n = header.len();
        let word = u16::from_le_bytes([header[n - 2], header[n - 1]]) & !TypeTag::TERMINATOR;
        header[n - 2..n].copy_from_slice(&word.to_le_bytes());
        assert!(walk_back(&header).is_err());
    }

    #[test]
    fn test_stack_key() {
        let a = TypeStack::scalar(builtin::int64());
        let b = TypeStack::scalar(builtin::int64());
        let c = TypeStack::scalar(builtin::int32());
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }
}
