//! Call-site metadata consumed by the translator
//!
//! Each call instruction carries indices into the body's call-info and
//! call-cache tables. The call info is fixed at compile (bytecode) time; the
//! cache is filled by the interpreter as call sites resolve and is read by
//! the translator as a snapshot. Generated code guards the snapshot against
//! the live global method state and receiver class serial, and cancels on
//! mismatch.

use std::sync::atomic::{AtomicU64, Ordering};

/// Caller passes positional arguments followed by a splat
pub const CALL_ARGS_SPLAT: u32 = 0x01;
/// Caller passes a block argument on the stack
pub const CALL_ARGS_BLOCKARG: u32 = 0x02;
/// Caller passes keyword arguments
pub const CALL_KWARG: u32 = 0x04;
/// Caller passes a keyword splat
pub const CALL_KW_SPLAT: u32 = 0x08;
/// Function-style call (no explicit receiver)
pub const CALL_FCALL: u32 = 0x10;

/// Per-call-site information fixed at bytecode compile time
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Interned method id
    pub mid: u64,
    /// Number of positional arguments on the stack
    pub argc: u32,
    /// `CALL_*` flag bits
    pub flags: u32,
}

impl CallInfo {
    /// A plain call: positional args only, explicit receiver
    pub fn simple(mid: u64, argc: u32) -> CallInfo {
        CallInfo { mid, argc, flags: 0 }
    }

    /// Does this site pass anything beyond plain positional arguments?
    pub fn plain_args_p(&self) -> bool {
        self.flags & (CALL_ARGS_SPLAT | CALL_ARGS_BLOCKARG | CALL_KWARG | CALL_KW_SPLAT) == 0
    }
}

/// Visibility of the resolved method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Callable from anywhere
    Public,
    /// Callable only function-style
    Private,
    /// Callable only from the defining class hierarchy
    Protected,
}

/// What the call cache resolved the method to
#[derive(Debug, Clone)]
pub enum CacheTarget {
    /// Cache not yet filled; only the generic dispatcher applies
    None,
    /// A native C method; generated code calls it directly
    Cfunc {
        /// Address of the C function
        func: usize,
        /// Declared arity, -1 for varargs
        argc: i32,
    },
    /// A bytecode method
    Iseq {
        /// Address of the callee body (baked into the inline frame push)
        body: usize,
        /// Parameter slot count
        param_size: u32,
        /// Local table size
        local_size: u32,
        /// Plain parameter layout (no opt/rest/keyword/block)
        simple: bool,
    },
}

/// Call-cache snapshot read by the translator
#[derive(Debug, Clone)]
pub struct CallCache {
    /// Global method-state serial captured when the cache was filled; 0 = empty
    pub method_state: u64,
    /// Serial of the receiver class the resolution is valid for
    pub class_serial: u64,
    /// Visibility of the resolved method
    pub visibility: Visibility,
    /// Resolution result
    pub target: CacheTarget,
}

impl CallCache {
    /// An unfilled cache
    pub fn empty() -> CallCache {
        CallCache {
            method_state: 0,
            class_serial: 0,
            visibility: Visibility::Public,
            target: CacheTarget::None,
        }
    }

    /// Has the interpreter resolved this site at least once?
    pub fn filled_p(&self) -> bool {
        self.method_state != 0
    }
}

static GLOBAL_METHOD_STATE: AtomicU64 = AtomicU64::new(1);

/// Current global method-state serial.
///
/// The translator bakes this into guards; the host bumps it on any method
/// definition change, which invalidates every compiled guard at once.
pub fn global_method_state() -> u64 {
    GLOBAL_METHOD_STATE.load(Ordering::Acquire)
}

/// Bump the global method-state serial (host side, on method redefinition)
pub fn bump_global_method_state() -> u64 {
    GLOBAL_METHOD_STATE.fetch_add(1, Ordering::AcqRel) + 1
}
