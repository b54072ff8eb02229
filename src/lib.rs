//! # relata-rs — Polyglot Relational-Data Access Middleware
//!
//! An embeddable engine that plans, shards, dispatches and reassembles
//! structured queries across one or more backend databases.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `BackendAdapter` is the contract between the engine
//!    core and any database driver
//! 2. **Typed tuples**: a dynamic type registry with per-type access methods
//!    feeds a compact, versioned tuple representation
//! 3. **Stable handles**: heap buffers vend opaque tuple pointers that stay
//!    valid across transaction boundaries
//! 4. **Backend-agnostic planner**: plans fan out to shards via beacons and
//!    never know how a driver moves bytes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relata::{Context, XactMode, nodes};
//!
//! # async fn example() -> relata::Result<()> {
//! let ctx = Context::start()?;
//! // ... register a backend, a shard, and a table ...
//!
//! let table = ctx.tables().by_name("orders")?;
//! let mut xact = relata::xact::Xact::begin(ctx.clone(), XactMode::Immediate)?;
//! let htp = xact.create_tuple(&table)?;
//!
//! let mut arena = nodes::NodeArena::new();
//! let insert = nodes::build::insert(&mut arena, "orders", vec![htp]);
//! xact.submit(&arena, insert).await?;
//! xact.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! | Stage | Module | Description |
//! |-------|--------|-------------|
//! | Build | `nodes` | Caller assembles a query node tree |
//! | Route | `shard` | Beacons map tables/tuples to shards |
//! | Plan | `plan` | Node tree becomes an `ExecStep` tree |
//! | Run | `exec` | Steps stream rows through collectors |
//! | Commit | `xact` | Savepoints, flush, multi-backend commit |

// ============================================================================
// Modules
// ============================================================================

pub mod mem;
pub mod diag;
pub mod types;
pub mod value;
pub mod schema;
pub mod heap;
pub mod nodes;
pub mod shard;
pub mod backend;
pub mod plan;
pub mod exec;
pub mod xact;
pub mod context;

// ============================================================================
// Re-exports: substrate
// ============================================================================

pub use mem::MemScope;
pub use types::{Type, TypeRef, TypeRegistry, TypeTag, stack::TypeStack};
pub use value::TypedSlot;

// ============================================================================
// Re-exports: storage
// ============================================================================

pub use heap::{HeapBufferNo, HeapTuplePtr};
pub use schema::{HeapField, TableCatalog, TableDef, TupleDefVersion};

// ============================================================================
// Re-exports: engine
// ============================================================================

pub use backend::{BackendAdapter, BackendConnection};
pub use context::Context;
pub use exec::ExecResult;
pub use shard::{Shard, ShardAccess, ShardId};
pub use xact::{Xact, XactMode};

// ============================================================================
// Error Types
// ============================================================================

/// Failure kinds surfaced by the engine core.
///
/// Recoverable conditions (`UserInput`, retryable `BackendIo`) are collected
/// on the diag queue and surfaced as values; scope-fatal conditions unwind to
/// the nearest boundary as `Err`. Partial commit/rollback is *not* an error —
/// it is reported through [`xact::CommitOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("allocation failure in scope '{scope}': {detail}")]
    Allocation { scope: String, detail: String },

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("type not found: {0}")]
    TypeNotFound(String),

    #[error("operator '{op}' not found for types {lhs}/{rhs}")]
    OperatorNotFound { op: String, lhs: String, rhs: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("backend i/o (retryable: {retryable}): {detail}")]
    BackendIo { retryable: bool, detail: String },

    #[error("transaction failure: {0}")]
    TxFailure(String),

    #[error("invalid input: {0}")]
    UserInput(String),

    #[error("planning error: {0}")]
    PlanError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Raised(Box<diag::DiagRecord>),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the failure may succeed on retry (connection dropped before
    /// the first byte, transient backend refusal).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendIo { retryable: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
