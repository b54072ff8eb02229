//! Structured, scoped failure propagation.
//!
//! Every thread carries a diag queue. [`raise!`] appends a record with file,
//! line, pid and timestamp; recoverable levels keep executing while
//! scope-fatal levels convert to an [`Error`](crate::Error) that unwinds to
//! the nearest [`boundary`]. The boundary snapshots the thread's scope stack
//! when installed and restores it when an error crosses it, so a failing
//! callee cannot leave the caller running in the callee's scope.
//!
//! Flush sinks drain the queue at configured level masks. The console sink
//! routes through `tracing`; custom sinks take a closure.

use std::cell::RefCell;
use std::fmt;
use std::time::SystemTime;

use crate::{Error, Result, mem};

// ============================================================================
// Levels
// ============================================================================

/// Severity of a diag record. `Error1` is recoverable; `Error2` unwinds to
/// the nearest boundary; `Fatal`/`Panic` flush the queue and abort the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum DiagLevel {
    Debug1,
    Debug2,
    Info,
    Warning,
    Error1,
    Error2,
    Fatal,
    Panic,
}

impl DiagLevel {
    /// Bit used in sink level masks.
    pub const fn mask(self) -> u32 {
        1 << (self as u32)
    }

    /// Mask matching this level and everything above it.
    pub const fn mask_at_least(self) -> u32 {
        !(self.mask() - 1)
    }

    pub fn is_scope_fatal(self) -> bool {
        self >= DiagLevel::Error2
    }
}

impl fmt::Display for DiagLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DiagLevel::Debug1 => "DEBUG1",
            DiagLevel::Debug2 => "DEBUG2",
            DiagLevel::Info => "INFO",
            DiagLevel::Warning => "WARNING",
            DiagLevel::Error1 => "ERROR1",
            DiagLevel::Error2 => "ERROR2",
            DiagLevel::Fatal => "FATAL",
            DiagLevel::Panic => "PANIC",
        };
        f.write_str(text)
    }
}

// ============================================================================
// Records
// ============================================================================

/// One entry on the diag queue.
#[derive(Debug, Clone)]
pub struct DiagRecord {
    pub level: DiagLevel,
    pub file: &'static str,
    pub line: u32,
    pub pid: u32,
    pub message: String,
    pub at: SystemTime,
}

impl fmt::Display for DiagRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} (pid {}) {}",
            self.level, self.file, self.line, self.pid, self.message
        )
    }
}

// ============================================================================
// Sinks
// ============================================================================

type SinkFn = Box<dyn Fn(&DiagRecord) + Send>;

struct Sink {
    levels: u32,
    func: SinkFn,
}

struct QueueState {
    records: Vec<DiagRecord>,
    sinks: Vec<Sink>,
}

thread_local! {
    static QUEUE: RefCell<QueueState> = RefCell::new(QueueState {
        records: Vec::new(),
        sinks: Vec::new(),
    });
}

/// Install a custom flush sink for levels covered by `levels` (a mask built
/// from [`DiagLevel::mask`] / [`DiagLevel::mask_at_least`]).
pub fn install_sink(levels: u32, func: impl Fn(&DiagRecord) + Send + 'static) {
    QUEUE.with(|q| {
        q.borrow_mut().sinks.push(Sink {
            levels,
            func: Box::new(func),
        })
    });
}

/// Install the console sink: records route through `tracing` at the mapped
/// level.
pub fn install_console_sink(levels: u32) {
    install_sink(levels, |rec| match rec.level {
        DiagLevel::Debug1 | DiagLevel::Debug2 => {
            tracing::debug!(file = rec.file, line = rec.line, "{}", rec.message)
        }
        DiagLevel::Info => tracing::info!(file = rec.file, line = rec.line, "{}", rec.message),
        DiagLevel::Warning => tracing::warn!(file = rec.file, line = rec.line, "{}", rec.message),
        _ => tracing::error!(
            file = rec.file,
            line = rec.line,
            level = %rec.level,
            "{}", rec.message
        ),
    });
}

// ============================================================================
// Raising
// ============================================================================

/// Append a record. For scope-fatal levels, returns the error the caller
/// must propagate; below that, returns `None` and execution continues.
///
/// Prefer the [`raise!`] macro, which captures file and line.
pub fn raise_at(level: DiagLevel, file: &'static str, line: u32, message: String) -> Option<Error> {
    let record = DiagRecord {
        level,
        file,
        line,
        pid: std::process::id(),
        message,
        at: SystemTime::now(),
    };

    QUEUE.with(|q| {
        let q = q.borrow();
        for sink in &q.sinks {
            if sink.levels & level.mask() != 0 {
                (sink.func)(&record);
            }
        }
    });

    if level.is_scope_fatal() {
        QUEUE.with(|q| q.borrow_mut().records.push(record.clone()));
        Some(Error::Raised(Box::new(record)))
    } else {
        QUEUE.with(|q| q.borrow_mut().records.push(record));
        None
    }
}

/// Append a diag record at `level`. Scope-fatal levels evaluate to an
/// `Error` the caller should return; lower levels evaluate to `Option::None`.
///
/// ```ignore
/// if let Some(err) = raise!(DiagLevel::Error2, "type {} not registered", name) {
///     return Err(err);
/// }
/// ```
#[macro_export]
macro_rules! raise {
    ($level:expr, $($arg:tt)*) => {
        $crate::diag::raise_at($level, file!(), line!(), format!($($arg)*))
    };
}

/// Re-enter unwinding with a previously caught record.
pub fn rethrow(record: DiagRecord) -> Error {
    Error::Raised(Box::new(record))
}

/// Drain and return every queued record.
pub fn drain() -> Vec<DiagRecord> {
    QUEUE.with(|q| std::mem::take(&mut q.borrow_mut().records))
}

/// Records currently queued at levels covered by `levels`, without draining.
pub fn pending(levels: u32) -> Vec<DiagRecord> {
    QUEUE.with(|q| {
        q.borrow()
            .records
            .iter()
            .filter(|r| r.levels_match(levels))
            .cloned()
            .collect()
    })
}

impl DiagRecord {
    fn levels_match(&self, levels: u32) -> bool {
        self.level.mask() & levels != 0
    }
}

// ============================================================================
// Boundaries
// ============================================================================

/// Run `f` with `scope` current. If `f` fails, the thread's scope stack is
/// restored to its depth at entry before the error continues outward — the
/// unwind contract of a handler region.
pub fn boundary<T>(scope: &mem::MemScope, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let depth = mem::stack_depth();
    let guard = mem::switch(scope);
    let out = f();
    drop(guard);
    if out.is_err() {
        mem::unwind_to(depth);
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
