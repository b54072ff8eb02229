//! Dynamic type registry.
//!
//! Every value the engine moves is described by a [`Type`]: a stable numeric
//! tag, size/alignment, variable-length flag, a nesting policy, and two
//! method vectors — access methods ([`tam`]) for moving bytes and operator
//! methods ([`ops`]) for comparing and constructing values. Types compose
//! into bounded [`stack::TypeStack`]s so an array-of-date is one value with
//! two frames.
//!
//! Registration is one-shot and happens at process start, before worker
//! threads fork; lookups afterwards are lock-free in practice (read locks on
//! maps that never change).

pub mod builtin;
pub mod ops;
pub mod stack;
pub mod tam;

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::{Error, Result};

// ============================================================================
// Tags
// ============================================================================

/// Stable numeric identifier for a registered type. Tags live in the low 15
/// bits; the high bit is the terminator marker in encoded tag headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TypeTag(pub u16);

impl TypeTag {
    /// High bit set on the outermost (payload-adjacent) word of an encoded
    /// tag header.
    pub const TERMINATOR: u16 = 0x8000;

    pub const MAX: u16 = 0x7fff;

    pub fn is_valid(self) -> bool {
        self.0 != 0 && self.0 <= Self::MAX
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Type descriptor
// ============================================================================

/// How a type treats nested inner types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerPolicy {
    /// Scalar: must be the innermost frame of a stack.
    Deny,
    /// May wrap an inner type; sizing multiplies the inner width.
    Allow { multiplier: usize },
    /// Must wrap an inner type (e.g. the array constructor).
    Require { multiplier: usize },
}

impl InnerPolicy {
    pub fn accepts_inner(self) -> bool {
        !matches!(self, InnerPolicy::Deny)
    }

    pub fn requires_inner(self) -> bool {
        matches!(self, InnerPolicy::Require { .. })
    }
}

/// A registered type: identity, layout, and its method vectors.
pub struct Type {
    pub tag: TypeTag,
    pub name: &'static str,
    /// Payload width of one value at this frame, in bytes. Variable-length
    /// types report the width of their fixed payload slot.
    pub size: usize,
    pub align: usize,
    pub varlen: bool,
    pub inner: InnerPolicy,
    pub tam: Arc<dyn tam::TypeAccess>,
    pub tom: Arc<dyn ops::TypeOps>,
}

pub type TypeRef = Arc<Type>;

impl Type {
    /// Whether tuple allocation must run this type's constructor.
    pub fn needs_construct(&self) -> bool {
        self.tom.needs_construct()
    }

    /// Whether buffer close must run this type's destructor.
    pub fn needs_destruct(&self) -> bool {
        self.tom.needs_destruct()
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Type")
            .field("tag", &self.tag)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("varlen", &self.varlen)
            .finish()
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}
impl Eq for Type {}

// ============================================================================
// Registry
// ============================================================================

/// Two lookup tables — by tag and by name — plus the operator registry.
/// Registration is one-shot: re-registering a tag or name fails.
pub struct TypeRegistry {
    by_tag: RwLock<HashMap<TypeTag, TypeRef>>,
    by_name: RwLock<HashMap<&'static str, TypeRef>>,
    operators: ops::OperatorRegistry,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            by_tag: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            operators: ops::OperatorRegistry::new(),
        }
    }

    /// Create a registry with every builtin type registered.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        builtin::register_builtins(&registry)?;
        Ok(registry)
    }

    /// Publish a type. Fails if the tag or name is already taken.
    pub fn register(&self, ty: Type) -> Result<TypeRef> {
        self.register_ref(Arc::new(ty))
    }

    /// Publish an already shared type descriptor (the builtin path).
    pub fn register_ref(&self, ty: TypeRef) -> Result<TypeRef> {
        if !ty.tag.is_valid() {
            return Err(Error::UserInput(format!(
                "type tag {} outside the valid range 1..={}",
                ty.tag,
                TypeTag::MAX
            )));
        }

        let mut by_tag = self.by_tag.write();
        let mut by_name = self.by_name.write();
        if by_tag.contains_key(&ty.tag) {
            return Err(Error::UserInput(format!(
                "type tag {} already registered",
                ty.tag
            )));
        }
        if by_name.contains_key(ty.name) {
            return Err(Error::UserInput(format!(
                "type name '{}' already registered",
                ty.name
            )));
        }
        by_tag.insert(ty.tag, Arc::clone(&ty));
        by_name.insert(ty.name, Arc::clone(&ty));
        Ok(ty)
    }

    pub fn by_tag(&self, tag: TypeTag) -> Result<TypeRef> {
        self.by_tag
            .read()
            .get(&tag)
            .cloned()
            .ok_or_else(|| Error::TypeNotFound(format!("tag {tag}")))
    }

    pub fn by_name(&self, name: &str) -> Result<TypeRef> {
        self.by_name
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TypeNotFound(name.to_string()))
    }

    pub fn operators(&self) -> &ops::OperatorRegistry {
        &self.operators
    }

    pub fn len(&self) -> usize {
        self.by_tag.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.read().is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_registration() {
        let registry = TypeRegistry::with_builtins().unwrap();
        let int64 = builtin::int64();
        assert_eq!(registry.by_name("int64").unwrap().tag, int64.tag);
        assert_eq!(registry.by_tag(int64.tag).unwrap().name, "int64");

        // Same tag again must fail.
        let dup = Type {
            tag: int64.tag,
            name: "int64_again",
            size: 8,
            align: 8,
            varlen: false,
            inner: InnerPolicy::Deny,
            tam: Arc::clone(&int64.tam),
            tom: Arc::clone(&int64.tom),
        };
        assert!(registry.register(dup).is_err());
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = TypeRegistry::new();
        assert!(matches!(
            registry.by_name("nope"),
            Err(Error::TypeNotFound(_))
        ));
        assert!(matches!(
            registry.by_tag(TypeTag(999)),
            Err(Error::TypeNotFound(_))
        ));
    }
}
