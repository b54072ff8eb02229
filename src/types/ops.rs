//! Type operator methods: compare, construct, destruct, and the binary
//! operator registry.
//!
//! Comparison operators normalize their textual form (`<`, `<=`, `=`, `!=`,
//! `<>`, `>`, `>=`) through a 16-bit packing of the first two characters, so
//! qual evaluation never re-parses operator strings per row.

use std::cmp::Ordering;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use super::TypeTag;
use super::tam::TamView;
use crate::{Error, Result};

// ============================================================================
// TypeOps
// ============================================================================

/// The operator-method vector registered with each type.
pub trait TypeOps: Send + Sync {
    /// Total order over two canonical payloads of this type.
    fn compare(&self, rest: TamView<'_>, lhs: &[u8], rhs: &[u8]) -> Result<Ordering>;

    /// Initialize a freshly allocated payload slot. The slot arrives
    /// zero-filled; only types with a non-zero resting state override.
    fn construct(&self, _rest: TamView<'_>, _payload: &mut [u8]) {}

    /// Whether tuple allocation must call [`TypeOps::construct`].
    fn needs_construct(&self) -> bool {
        false
    }

    /// Whether buffer close must release per-value resources.
    fn needs_destruct(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn TypeOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TypeOps")
    }
}

// ============================================================================
// Comparison operators
// ============================================================================

/// A normalized comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

/// Pack the first two bytes of an operator text into one word. One-character
/// operators pack with a zero low byte.
const fn pack_op(text: &str) -> u16 {
    let bytes = text.as_bytes();
    let hi = bytes[0] as u16;
    let lo = if bytes.len() > 1 { bytes[1] as u16 } else { 0 };
    (hi << 8) | lo
}

impl CmpOp {
    /// Normalize an operator text. Fast-pathed on the two-character packing.
    pub fn from_text(text: &str) -> Result<CmpOp> {
        if text.is_empty() || text.len() > 2 {
            return Err(Error::UserInput(format!("unknown operator '{text}'")));
        }
        match pack_op(text) {
            x if x == pack_op("<") => Ok(CmpOp::Lt),
            x if x == pack_op("<=") => Ok(CmpOp::Le),
            x if x == pack_op("=") || x == pack_op("==") => Ok(CmpOp::Eq),
            x if x == pack_op("!=") || x == pack_op("<>") => Ok(CmpOp::Ne),
            x if x == pack_op(">") => Ok(CmpOp::Gt),
            x if x == pack_op(">=") => Ok(CmpOp::Ge),
            _ => Err(Error::UserInput(format!("unknown operator '{text}'"))),
        }
    }

    /// Whether an [`Ordering`] satisfies this operator.
    pub fn matches(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }

    /// The operator with its sides swapped (`a < b` ⇔ `b > a`).
    pub fn swapped(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            CmpOp::Eq | CmpOp::Ne => self,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

// ============================================================================
// Binary operator registry
// ============================================================================

/// A registered binary operator over canonical payloads, producing a result
/// payload.
pub type OperatorFn = Arc<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync>;

struct OperatorEntry {
    func: OperatorFn,
    commutative: bool,
}

/// Binary operators keyed by `(lhs type, op text, rhs type)`. Lookup is
/// exact first; commutative operators also match with sides swapped.
pub struct OperatorRegistry {
    map: RwLock<HashMap<(TypeTag, String, TypeTag), OperatorEntry>>,
}

/// A resolved operator, remembering whether the match swapped its sides.
#[derive(Clone)]
pub struct ResolvedOperator {
    pub func: OperatorFn,
    pub swapped: bool,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        lhs: TypeTag,
        op: &str,
        rhs: TypeTag,
        commutative: bool,
        func: OperatorFn,
    ) {
        self.map
            .write()
            .insert((lhs, op.to_string(), rhs), OperatorEntry { func, commutative });
    }

    pub fn lookup(&self, lhs: TypeTag, op: &str, rhs: TypeTag) -> Result<ResolvedOperator> {
        let map = self.map.read();
        if let Some(entry) = map.get(&(lhs, op.to_string(), rhs)) {
            return Ok(ResolvedOperator {
                func: Arc::clone(&entry.func),
                swapped: false,
            });
        }
        if let Some(entry) = map.get(&(rhs, op.to_string(), lhs)) {
            if entry.commutative {
                return Ok(ResolvedOperator {
                    func: Arc::clone(&entry.func),
                    swapped: true,
                });
            }
        }
        Err(Error::OperatorNotFound {
            op: op.to_string(),
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
        })
    }
}

impl Default for OperatorRegistry {
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
    fn test_cmp_normalization() {
        assert_eq!(CmpOp::from_text("<").unwrap(), CmpOp::Lt);
        assert_eq!(CmpOp::from_text("<=").unwrap(), CmpOp::Le);
        assert_eq!(CmpOp::from_text("=").unwrap(), CmpOp::Eq);
        assert_eq!(CmpOp::from_text("==").unwrap(), CmpOp::Eq);
        assert_eq!(CmpOp::from_text("!=").unwrap(), CmpOp::Ne);
        assert_eq!(CmpOp::from_text("<>").unwrap(), CmpOp::Ne);
        assert_eq!(CmpOp::from_text(">").unwrap(), CmpOp::Gt);
        assert_eq!(CmpOp::from_text(">=").unwrap(), CmpOp::Ge);
        assert!(CmpOp::from_text("~~").is_err());
        assert!(CmpOp::from_text("").is_err());
    }

    #[test]
    fn test_cmp_matches() {
        assert!(CmpOp::Le.matches(Ordering::Equal));
        assert!(CmpOp::Le.matches(Ordering::Less));
        assert!(!CmpOp::Le.matches(Ordering::Greater));
        assert!(CmpOp::Ne.matches(Ordering::Less));
        assert!(!CmpOp::Ne.matches(Ordering::Equal));
    }

    #[test]
    fn test_swapped() {
        assert_eq!(CmpOp::Lt.swapped(), CmpOp::Gt);
        assert_eq!(CmpOp::Ge.swapped(), CmpOp::Le);
        assert_eq!(CmpOp::Eq.swapped(), CmpOp::Eq);
    }

    #[test]
    fn test_operator_registry_commutative_swap() {
        let registry = OperatorRegistry::new();
        let lhs = TypeTag(3);
        let rhs = TypeTag(4);

        registry.register(
            lhs,
            "+",
            rhs,
            true,
            Arc::new(|a, b| Ok(a.iter().chain(b.iter()).copied().collect())),
        );

        let exact = registry.lookup(lhs, "+", rhs).unwrap();
        assert!(!exact.swapped);

        let swapped = registry.lookup(rhs, "+", lhs).unwrap();
        assert!(swapped.swapped);

        assert!(registry.lookup(lhs, "-", rhs).is_err());
    }
}
