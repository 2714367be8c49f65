//! Corvid method JIT
//!
//! Accelerates the Corvid stack-based bytecode VM by translating hot method
//! bodies into C, driving an external C compiler to build shared objects,
//! and loading the results back as native entry points that replace
//! interpreter dispatch. Compilation is asynchronous: the interpreter hands
//! hot bodies to the engine and keeps running; a single background worker
//! builds a precompiled header once, then drains a call-count-ordered unit
//! queue, publishing each compiled function pointer atomically into its
//! body. Native code can bail out at any guard by writing its simulated
//! operand stack back into the control frame and returning the undefined
//! sentinel, after which the interpreter resumes where the native code
//! stopped.
//!
//! # Example
//!
//! ```rust,ignore
//! use corvid_jit::{JitEngine, JitOptions};
//!
//! let opts = JitOptions::parse(["on", "verbose=1"]).unwrap();
//! let engine = JitEngine::init(opts);
//!
//! // interpreter side, once a body turns hot:
//! if body.should_compile(engine.options()) {
//!     engine.add_iseq_to_process(&body);
//! }
//!
//! engine.finish();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(unix))]
compile_error!("corvid-jit drives a unix C toolchain; Windows is not supported");

/// Filesystem and process surface: temp paths, compiler spawn, dlopen
pub mod build;
/// Engine façade: lifecycle, hooks, shared state
pub mod engine;
/// Engine configuration
pub mod options;
/// Bytecode-to-C translation
pub mod translator;
/// Compilation units and the pending-unit queue
pub mod unit;
/// Host interpreter surface consumed by the engine
pub mod vm;

mod worker;

pub use engine::{jit_enabled, JitEngine};
pub use options::{CompilerKind, JitOptions, OptionError};
pub use translator::TranslateError;
