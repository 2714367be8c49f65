//! Bytecode bodies and the engine-facing fields on them
//!
//! An `IseqBody` is the immutable compiled form of one method. The engine
//! holds it behind `Arc` but never frees it; lifetime belongs to the host
//! GC, which announces collection through `JitEngine::free_iseq`. Two fields
//! are mutated by the engine: the atomic entry slot (published once by the
//! worker) and the unit-id link.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::options::JitOptions;

use super::calling::{CallCache, CallInfo};
use super::frame::JitFuncPtr;
use super::opcode::OpCode;
use super::value::Value;

/// Entry-slot value: compilation has never been attempted
pub const FUNC_NOT_ATTEMPTED: usize = 0;
/// Entry-slot value: the body is not compilable; never retried
pub const FUNC_NOT_COMPILABLE: usize = 1;

/// Decoded state of a body's entry slot
#[derive(Debug, Clone, Copy)]
pub enum JitEntry {
    /// No compile attempt has finished yet
    NotAttempted,
    /// Translation, compilation or loading failed; stays interpreted
    NotCompilable,
    /// Native code is available
    Ready(JitFuncPtr),
}

/// Parameter descriptor for a body
#[derive(Debug, Clone, Default)]
pub struct ParamDescriptor {
    /// Leading (required) parameter count
    pub lead_num: u32,
    /// Optional parameter count
    pub opt_num: u32,
    /// Entry positions for each optional-argument arity, `opt_num + 1`
    /// entries when `opt_num > 0` (the interpreter's opt-pc dispatch table)
    pub opt_table: Vec<usize>,
    /// Has a rest parameter
    pub has_rest: bool,
    /// Has keyword parameters
    pub has_kw: bool,
    /// Has a keyword splat parameter
    pub has_kw_rest: bool,
    /// Has a block parameter
    pub has_block: bool,
}

impl ParamDescriptor {
    /// Does this body dispatch on an optional-argument table?
    pub fn has_opt(&self) -> bool {
        self.opt_num > 0
    }

    /// Plain layout: leading parameters only
    pub fn simple(&self) -> bool {
        self.opt_num == 0 && !self.has_rest && !self.has_kw && !self.has_kw_rest && !self.has_block
    }
}

/// A case-dispatch table: literal keys mapped to branch destinations
#[derive(Debug, Clone, Default)]
pub struct CaseDispatchTable {
    /// `(key, destination position)` pairs
    pub entries: Vec<(Value, usize)>,
}

/// One inline-cache slot, shared between ivar caches and constant caches.
///
/// The interpreter fills and invalidates these at runtime; the translator
/// only bakes each slot's address into generated C, so the layout is ABI
/// (`cvm_inline_cache_t` in the runtime header).
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct InlineCache {
    /// Validity serial; 0 = empty
    pub serial: u64,
    /// Cached payload (ivar index or constant value)
    pub value: u64,
}

/// One decoded instruction
#[derive(Debug, Clone, Copy)]
pub struct DecodedInsn<'a> {
    /// The opcode
    pub op: OpCode,
    /// Operand words
    pub operands: &'a [u64],
}

/// The immutable compiled form of one method
#[derive(Debug)]
pub struct IseqBody {
    /// Human-readable label for diagnostics
    pub label: String,
    /// Instruction stream: opcode words followed by operand words
    pub encoded: Vec<u64>,
    /// Upper bound on operand-stack depth
    pub stack_max: usize,
    /// Number of local-table slots
    pub local_table_size: usize,
    /// Parameter descriptor
    pub param: ParamDescriptor,
    /// Call-site information, indexed by call operands
    pub call_infos: Vec<CallInfo>,
    /// Call-cache snapshots, indexed by call operands
    pub call_caches: Vec<CallCache>,
    /// Case-dispatch tables, indexed by `opt_case_dispatch` operands
    pub case_tables: Vec<CaseDispatchTable>,
    /// Inline-cache slots, indexed by ivar/constant cache operands
    pub inline_caches: Vec<InlineCache>,

    /// Calls observed by the interpreter; the queue orders units by this
    total_calls: AtomicUsize,
    /// Entry slot: 0 not attempted, 1 not compilable, else a callable address
    jit_entry: AtomicUsize,
    /// Id of the engine unit tracking this body, 0 = none
    jit_unit: AtomicU64,
}

impl IseqBody {
    /// Decode the instruction at `pos`, or None when `pos` is out of range
    /// or does not hold an opcode word
    pub fn decode(&self, pos: usize) -> Option<DecodedInsn<'_>> {
        let word = *self.encoded.get(pos)?;
        let op = OpCode::from_u64(word)?;
        let operands = self.encoded.get(pos + 1..pos + 1 + op.operand_len())?;
        Some(DecodedInsn { op, operands })
    }

    /// Encoded length in words
    pub fn size(&self) -> usize {
        self.encoded.len()
    }

    /// Record one interpreter call, returning the new count
    pub fn record_call(&self) -> usize {
        self.total_calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Calls observed so far
    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Should the host hand this body to the engine now?
    ///
    /// True once the call count reaches the configured threshold, as long
    /// as no attempt has been made and no unit is tracking the body.
    pub fn should_compile(&self, opts: &JitOptions) -> bool {
        opts.enabled
            && self.total_calls() >= opts.min_calls
            && self.jit_entry.load(Ordering::Acquire) == FUNC_NOT_ATTEMPTED
            && self.jit_unit.load(Ordering::Acquire) == 0
    }

    /// Read the entry slot
    pub fn jit_entry(&self) -> JitEntry {
        match self.jit_entry.load(Ordering::Acquire) {
            FUNC_NOT_ATTEMPTED => JitEntry::NotAttempted,
            FUNC_NOT_COMPILABLE => JitEntry::NotCompilable,
            addr => {
                // Safety: the only other values ever stored are function
                // addresses published by the worker.
                JitEntry::Ready(unsafe { std::mem::transmute::<usize, JitFuncPtr>(addr) })
            }
        }
    }

    /// Publish a compiled entry point. At most one publish per body; a slot
    /// already past "not attempted" is left untouched.
    pub(crate) fn publish_entry(&self, func: JitFuncPtr) -> bool {
        let addr = func as usize;
        self.jit_entry
            .compare_exchange(FUNC_NOT_ATTEMPTED, addr, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Mark the body as not compilable. Terminal: the body is never retried.
    pub(crate) fn mark_not_compilable(&self) {
        self.jit_entry.store(FUNC_NOT_COMPILABLE, Ordering::Release);
    }

    /// The engine unit tracking this body, 0 when untracked
    pub(crate) fn jit_unit(&self) -> u64 {
        self.jit_unit.load(Ordering::Acquire)
    }

    pub(crate) fn set_jit_unit(&self, id: u64) {
        self.jit_unit.store(id, Ordering::Release);
    }

    /// Address of the encoded stream, baked into generated C as
    /// `original_body_iseq`
    pub(crate) fn encoded_addr(&self) -> usize {
        self.encoded.as_ptr() as usize
    }

    /// Address of a call-info record, baked into generic dispatch calls
    pub(crate) fn call_info_addr(&self, idx: usize) -> Option<usize> {
        self.call_infos.get(idx).map(|ci| ci as *const CallInfo as usize)
    }

    /// Address of a call-cache record, baked into generic dispatch calls
    pub(crate) fn call_cache_addr(&self, idx: usize) -> Option<usize> {
        self.call_caches.get(idx).map(|cc| cc as *const CallCache as usize)
    }

    /// Address of an inline-cache slot
    pub(crate) fn inline_cache_addr(&self, idx: usize) -> Option<usize> {
        self.inline_caches.get(idx).map(|ic| ic as *const InlineCache as usize)
    }

    /// Address of a case-dispatch table
    pub(crate) fn case_table_addr(&self, idx: usize) -> Option<usize> {
        self.case_tables.get(idx).map(|t| t as *const CaseDispatchTable as usize)
    }
}

/// Builder for bodies, used by the bytecode compiler and by tests
#[derive(Debug, Default)]
pub struct IseqBuilder {
    label: String,
    encoded: Vec<u64>,
    stack_max: usize,
    local_table_size: usize,
    param: ParamDescriptor,
    call_infos: Vec<CallInfo>,
    call_caches: Vec<CallCache>,
    case_tables: Vec<CaseDispatchTable>,
    inline_caches: Vec<InlineCache>,
}

impl IseqBuilder {
    /// Start a body with the given label and stack bound
    pub fn new(label: &str, stack_max: usize) -> IseqBuilder {
        IseqBuilder {
            label: label.to_string(),
            stack_max,
            ..Default::default()
        }
    }

    /// Set the local-table size
    pub fn local_table_size(mut self, n: usize) -> IseqBuilder {
        self.local_table_size = n;
        self
    }

    /// Set the parameter descriptor
    pub fn param(mut self, param: ParamDescriptor) -> IseqBuilder {
        self.param = param;
        self
    }

    /// Current position (the next instruction lands here)
    pub fn pos(&self) -> usize {
        self.encoded.len()
    }

    /// Append an instruction with its operand words
    pub fn insn(&mut self, op: OpCode, operands: &[u64]) -> &mut IseqBuilder {
        assert_eq!(operands.len(), op.operand_len(), "{}: bad operand count", op.name());
        self.encoded.push(op as u64);
        self.encoded.extend_from_slice(operands);
        self
    }

    /// Overwrite an operand word after the fact (branch back-patching)
    pub fn patch(&mut self, at: usize, word: u64) {
        self.encoded[at] = word;
    }

    /// Register a call site, returning its `(ci, cc)` operand indices
    pub fn call_site(&mut self, ci: CallInfo, cc: CallCache) -> (u64, u64) {
        self.call_infos.push(ci);
        self.call_caches.push(cc);
        let idx = (self.call_infos.len() - 1) as u64;
        (idx, idx)
    }

    /// Register a case-dispatch table, returning its operand index
    pub fn case_table(&mut self, table: CaseDispatchTable) -> u64 {
        self.case_tables.push(table);
        (self.case_tables.len() - 1) as u64
    }

    /// Register an inline-cache slot, returning its operand index
    pub fn inline_cache(&mut self) -> u64 {
        self.inline_caches.push(InlineCache::default());
        (self.inline_caches.len() - 1) as u64
    }

    /// Finish the body
    pub fn build(self) -> IseqBody {
        IseqBody {
            label: self.label,
            encoded: self.encoded,
            stack_max: self.stack_max,
            local_table_size: self.local_table_size,
            param: self.param,
            call_infos: self.call_infos,
            call_caches: self.call_caches,
            case_tables: self.case_tables,
            inline_caches: self.inline_caches,
            total_calls: AtomicUsize::new(0),
            jit_entry: AtomicUsize::new(FUNC_NOT_ATTEMPTED),
            jit_unit: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leave_body() -> IseqBody {
        let mut b = IseqBuilder::new("test", 1);
        b.insn(OpCode::PutNil, &[]);
        b.insn(OpCode::Leave, &[]);
        b.build()
    }

    #[test]
    fn test_decode_stream() {
        let mut b = IseqBuilder::new("decode", 2);
        b.insn(OpCode::PutObject, &[Value::fixnum(7).bits()]);
        b.insn(OpCode::Leave, &[]);
        let body = b.build();

        let first = body.decode(0).unwrap();
        assert_eq!(first.op, OpCode::PutObject);
        assert_eq!(first.operands, &[Value::fixnum(7).bits()]);

        let second = body.decode(2).unwrap();
        assert_eq!(second.op, OpCode::Leave);
        assert!(second.operands.is_empty());

        // Position 1 holds an operand word, not an opcode
        assert!(body.decode(body.size()).is_none());
    }

    #[test]
    fn test_entry_slot_transitions() {
        let body = leave_body();
        assert!(matches!(body.jit_entry(), JitEntry::NotAttempted));

        body.mark_not_compilable();
        assert!(matches!(body.jit_entry(), JitEntry::NotCompilable));

        // A decided slot never goes back
        unsafe extern "C" fn stub(
            _ec: *mut crate::vm::ExecContext,
            _cfp: *mut crate::vm::ControlFrame,
        ) -> Value {
            Value::NIL
        }
        assert!(!body.publish_entry(stub));
        assert!(matches!(body.jit_entry(), JitEntry::NotCompilable));
    }

    #[test]
    fn test_publish_entry_once() {
        let body = leave_body();
        unsafe extern "C" fn stub(
            _ec: *mut crate::vm::ExecContext,
            _cfp: *mut crate::vm::ControlFrame,
        ) -> Value {
            Value::NIL
        }
        assert!(body.publish_entry(stub));
        assert!(matches!(body.jit_entry(), JitEntry::Ready(_)));
        assert!(!body.publish_entry(stub));
    }

    #[test]
    fn test_should_compile_threshold() {
        let opts = JitOptions { enabled: true, min_calls: 3, ..JitOptions::default() };
        let body = leave_body();
        assert!(!body.should_compile(&opts));
        body.record_call();
        body.record_call();
        assert!(!body.should_compile(&opts));
        body.record_call();
        assert!(body.should_compile(&opts));

        // Tracked bodies are not re-submitted
        body.set_jit_unit(9);
        assert!(!body.should_compile(&opts));
        body.set_jit_unit(0);
        body.mark_not_compilable();
        assert!(!body.should_compile(&opts));
    }

    #[test]
    fn test_param_descriptor_predicates() {
        let plain = ParamDescriptor { lead_num: 2, ..Default::default() };
        assert!(plain.simple());
        assert!(!plain.has_opt());

        let opt = ParamDescriptor {
            lead_num: 1,
            opt_num: 2,
            opt_table: vec![0, 4, 8],
            ..Default::default()
        };
        assert!(opt.has_opt());
        assert!(!opt.simple());

        let block = ParamDescriptor { has_block: true, ..Default::default() };
        assert!(!block.simple());
    }
}
