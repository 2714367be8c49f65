//! Call-protocol emission
//!
//! `send` and `opt_send_without_block` guard the call cache's method-state
//! and class-serial snapshots, baked as literals at translation time,
//! against the live global state; a mismatch cancels back to the
//! interpreter. When the cache resolved a native C method the dispatcher is
//! bypassed with a direct call; when it resolved a plain bytecode method the
//! frame is pushed inline and the outer loop resumes it. Every call shares
//! the same tail: an undefined result first retries native re-entry, then
//! pins the frame-finish flag and resumes under the interpreter.

use std::fmt::Write;

use crate::vm::calling::{CacheTarget, CallCache, CallInfo, Visibility, CALL_ARGS_BLOCKARG};
use crate::vm::OpCode;

use super::{Flow, Translator, TranslateError};

enum Dispatch {
    /// Direct call to a resolved C function
    Cfunc { func: usize, argc: i32 },
    /// Inline frame push for a plain bytecode callee
    IseqFast { body: usize, param_size: u32, local_size: u32 },
    /// The generic dispatcher
    Generic,
}

impl<'a, W: Write> Translator<'a, W> {
    pub(super) fn compile_send(
        &mut self,
        pos: usize,
        op: OpCode,
        operands: &[u64],
        stack_size: usize,
    ) -> Result<Flow, TranslateError> {
        let ci_idx = operands[0] as usize;
        let ci = self
            .body
            .call_infos
            .get(ci_idx)
            .cloned()
            .ok_or(TranslateError::MalformedStream { pos })?;
        let ci_addr = self.body.call_info_addr(ci_idx).unwrap_or_default();

        let (cc, cc_addr, block_word) = match op {
            OpCode::InvokeBlock => (None, 0, 0),
            _ => {
                let cc_idx = operands[1] as usize;
                let cc = self
                    .body
                    .call_caches
                    .get(cc_idx)
                    .cloned()
                    .ok_or(TranslateError::MalformedStream { pos })?;
                let addr = self.body.call_cache_addr(cc_idx).unwrap_or_default();
                let block = match op {
                    OpCode::Send | OpCode::InvokeSuper => operands[2],
                    _ => 0,
                };
                (Some(cc), addr, block)
            }
        };

        let has_recv = op != OpCode::InvokeBlock;
        let stack_args = ci.argc as usize
            + if ci.flags & CALL_ARGS_BLOCKARG != 0 { 1 } else { 0 };
        let pops = stack_args + usize::from(has_recv);
        let base = self.shrink(pos, stack_size, pops)?;
        let ss = self.grow(pos, base, 1)?;

        // Inline-cache guard: send family only, and only once the site has
        // resolved at least once.
        if matches!(op, OpCode::Send | OpCode::OptSendWithoutBlock) {
            if let Some(cc) = cc.as_ref().filter(|cc| cc.filled_p()) {
                writeln!(
                    self.w,
                    "    if (CVM_UNLIKELY(cvm_global_method_state() != {}ull || cvm_class_serial(stack[{}]) != {}ull)) {{",
                    cc.method_state, base, cc.class_serial
                )?;
                self.emit_sp(stack_size)?;
                writeln!(self.w, "        goto cancel;")?;
                writeln!(self.w, "    }}")?;
            }
        }

        writeln!(self.w, "    {{")?;
        writeln!(self.w, "        cvm_calling_info_t calling;")?;
        if block_word == 0 {
            writeln!(self.w, "        calling.block = CVM_BLOCK_NONE;")?;
        } else {
            writeln!(self.w, "        calling.block = (VALUE)0x{:x};", block_word)?;
        }
        writeln!(self.w, "        calling.argc = {};", ci.argc)?;
        if has_recv {
            writeln!(self.w, "        calling.recv = stack[{}];", base)?;
        } else {
            writeln!(self.w, "        calling.recv = reg_cfp->self;")?;
        }

        // Calls re-enter the interpreter: the simulated stack becomes
        // visible, so restore it and point sp at the live top first.
        self.emit_writeback(stack_size)?;
        self.emit_sp(stack_size)?;

        writeln!(self.w, "        VALUE v;")?;
        match op {
            OpCode::Send | OpCode::OptSendWithoutBlock => {
                match select_dispatch(&ci, cc.as_ref()) {
                    Dispatch::Cfunc { func, argc } => {
                        writeln!(
                            self.w,
                            "        v = cvm_call_cfunc_fast(ec, reg_cfp, &calling, (cvm_cfunc_t)0x{:x}, {});",
                            func, argc
                        )?;
                    }
                    Dispatch::IseqFast { body, param_size, local_size } => {
                        writeln!(
                            self.w,
                            "        cvm_call_iseq_setup_normal(ec, reg_cfp, &calling, (const cvm_iseq_body_t *)0x{:x}, {}, {});",
                            body, param_size, local_size
                        )?;
                        writeln!(self.w, "        v = Qundef;")?;
                    }
                    Dispatch::Generic => {
                        writeln!(
                            self.w,
                            "        v = cvm_send(ec, reg_cfp, &calling, (const cvm_call_info_t *)0x{:x}, (cvm_call_cache_t *)0x{:x});",
                            ci_addr, cc_addr
                        )?;
                    }
                }
            }
            OpCode::InvokeSuper => {
                writeln!(
                    self.w,
                    "        v = cvm_invokesuper(ec, reg_cfp, &calling, (const cvm_call_info_t *)0x{:x}, (cvm_call_cache_t *)0x{:x});",
                    ci_addr, cc_addr
                )?;
            }
            _ => {
                writeln!(
                    self.w,
                    "        v = cvm_invokeblock(ec, reg_cfp, &calling, (const cvm_call_info_t *)0x{:x});",
                    ci_addr
                )?;
            }
        }

        writeln!(self.w, "        if (v == Qundef && (v = cvm_jit_exec(ec)) == Qundef) {{")?;
        writeln!(self.w, "            cvm_frame_set_finish(ec->cfp);")?;
        writeln!(self.w, "            v = cvm_exec(ec);")?;
        writeln!(self.w, "        }}")?;
        writeln!(self.w, "        stack[{}] = v;", base)?;
        writeln!(self.w, "    }}")?;

        Ok(Flow::Next(ss))
    }
}

/// Pick the call path the cache snapshot justifies. Anything beyond plain
/// positional arguments, an unresolved cache, or a protected target falls
/// back to the generic dispatcher.
fn select_dispatch(ci: &CallInfo, cc: Option<&CallCache>) -> Dispatch {
    let cc = match cc {
        Some(cc) if cc.filled_p() => cc,
        _ => return Dispatch::Generic,
    };
    if !ci.plain_args_p() || cc.visibility == Visibility::Protected {
        return Dispatch::Generic;
    }
    match cc.target {
        CacheTarget::Cfunc { func, argc } => Dispatch::Cfunc { func, argc },
        CacheTarget::Iseq { body, param_size, local_size, simple }
            if simple && param_size == ci.argc =>
        {
            Dispatch::IseqFast { body, param_size, local_size }
        }
        _ => Dispatch::Generic,
    }
}
