//! Host interpreter surface consumed by the engine
//!
//! The engine does not own the interpreter; these types mirror the parts of
//! it the JIT touches: tagged values, the instruction encoding, bytecode
//! bodies with their engine-updated fields, control frames, and call-site
//! caches. The generated C reaches the same data through the runtime header.

pub mod calling;
pub mod frame;
pub mod iseq;
pub mod opcode;
pub mod value;

pub use calling::{CallCache, CallInfo, CacheTarget, Visibility};
pub use frame::{ControlFrame, ExecContext, JitFuncPtr};
pub use iseq::{CaseDispatchTable, InlineCache, IseqBody, IseqBuilder, JitEntry, ParamDescriptor};
pub use opcode::OpCode;
pub use value::Value;
