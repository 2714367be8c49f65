//! Execution context and control frame layout
//!
//! These mirror the interpreter structures that generated C addresses
//! directly, so they are `repr(C)` and their field order is ABI: the runtime
//! header declares the same layouts as `cvm_exec_context_t` and
//! `cvm_control_frame_t`. Generated code reads and writes `pc`, `sp`, `self`
//! and `ep`, and reaches the frame's operand-stack bottom through
//! `cvm_base_ptr` (the `bp` field).

use super::value::Value;

/// One interpreter control frame.
///
/// `bp` points at the bottom of this frame's operand stack; a native
/// function writes its simulated stack back to `bp[0..top]` and sets `sp`
/// to `bp + top` before cancelling or calling back into the interpreter.
#[repr(C)]
#[derive(Debug)]
pub struct ControlFrame {
    /// Program counter into the body's encoded stream
    pub pc: *const u64,
    /// Operand stack pointer (one past the top of valid data)
    pub sp: *mut Value,
    /// The frame's receiver
    pub self_val: Value,
    /// Environment pointer (locals are addressed below it)
    pub ep: *const Value,
    /// Bottom of this frame's operand stack
    pub bp: *mut Value,
    /// The body being executed, opaque to generated code
    pub iseq: *const (),
}

/// Per-thread execution context
#[repr(C)]
#[derive(Debug)]
pub struct ExecContext {
    /// Current (innermost) control frame
    pub cfp: *mut ControlFrame,
    /// Pending-interrupt flag polled by `CVM_CHECK_INTS`
    pub interrupt_flag: u32,
}

/// Signature of a JIT-compiled method entry point.
///
/// Returns the frame's result on `leave`, or `Value::UNDEF` when the native
/// code cancelled and the interpreter must resume at `cfp->pc`.
pub type JitFuncPtr = unsafe extern "C" fn(*mut ExecContext, *mut ControlFrame) -> Value;

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    // The runtime header declares the same layouts; a silent field reorder
    // here would corrupt frames under compiled code.
    #[test]
    fn test_control_frame_abi_offsets() {
        assert_eq!(mem::offset_of!(ControlFrame, pc), 0);
        assert_eq!(mem::offset_of!(ControlFrame, sp), 8);
        assert_eq!(mem::offset_of!(ControlFrame, self_val), 16);
        assert_eq!(mem::offset_of!(ControlFrame, ep), 24);
        assert_eq!(mem::offset_of!(ControlFrame, bp), 32);
    }

    #[test]
    fn test_exec_context_abi_offsets() {
        assert_eq!(mem::offset_of!(ExecContext, cfp), 0);
        assert_eq!(mem::offset_of!(ExecContext, interrupt_flag), 8);
    }
}
