//! Bytecode-to-C translation
//!
//! `compile` maps one body and a symbol name to a self-contained C
//! translation unit exposing
//! `VALUE <funcname>(cvm_exec_context_t *ec, cvm_control_frame_t *reg_cfp)`.
//!
//! The translator simulates the operand stack at compile time: every
//! instruction reads and writes slots of a local `VALUE stack[stack_max]`
//! array, and the tracked `stack_size` never touches the interpreter's
//! operand stack during normal execution. The stack is written back only in
//! the cancellation block and before calls back into the interpreter.
//!
//! Control flow is emitted as labels and gotos. A conditional branch emits
//! its taken edge as a goto, then compiles the fall-through branch
//! recursively so each branch sees the correct `stack_size`; the taken
//! target is compiled when the recursion returns. Positions are compiled at
//! most once; a reference to an already-compiled position becomes a plain
//! goto.

mod insns;
mod send;

use std::fmt::{self, Write};

use thiserror::Error;

use crate::vm::{IseqBody, OpCode};

/// Why a body could not be translated. All of these are terminal for the
/// body: the engine installs the not-compilable marker and never retries.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// The instruction has no C translation
    #[error("unsupported instruction {insn} at {pos}")]
    Unsupported {
        /// Instruction name
        insn: &'static str,
        /// Word position
        pos: usize,
    },
    /// The simulated stack grew past the body's declared bound
    #[error("stack size {size} exceeds stack_max {max} at {pos}")]
    StackOverflow {
        /// Word position
        pos: usize,
        /// Simulated size after the push
        size: usize,
        /// The body's bound
        max: usize,
    },
    /// An instruction popped more than the simulated stack holds
    #[error("stack underflow at {pos}")]
    StackUnderflow {
        /// Word position
        pos: usize,
    },
    /// `leave` reached with other than exactly one value on the stack
    #[error("leave with stack size {size} at {pos}")]
    LeaveStackMismatch {
        /// Word position
        pos: usize,
        /// Simulated size at the leave
        size: usize,
    },
    /// The stream did not decode (bad opcode word or truncated operands)
    #[error("malformed instruction stream at {pos}")]
    MalformedStream {
        /// Word position
        pos: usize,
    },
    /// Writer error
    #[error("write error: {0}")]
    Fmt(#[from] fmt::Error),
}

/// What an instruction did to linear control flow
enum Flow {
    /// Fall through to the next instruction with the given stack size
    Next(usize),
    /// Continue compiling at a branch target with the given stack size
    Jump(usize, usize),
    /// The branch is terminated (leave/throw, or all successors emitted)
    Finish,
}

/// Translate `body` into C, writing the translation unit to `out`.
///
/// On error nothing useful is in `out`; the caller discards the file and
/// marks the body not compilable.
pub fn compile<W: Write>(out: &mut W, body: &IseqBody, funcname: &str) -> Result<(), TranslateError> {
    Translator { w: out, body, compiled: vec![false; body.size()] }.run(funcname)
}

struct Translator<'a, W: Write> {
    w: &'a mut W,
    body: &'a IseqBody,
    compiled: Vec<bool>,
}

impl<'a, W: Write> Translator<'a, W> {
    fn run(&mut self, funcname: &str) -> Result<(), TranslateError> {
        writeln!(self.w, "VALUE")?;
        writeln!(self.w, "{}(cvm_exec_context_t *ec, cvm_control_frame_t *reg_cfp)", funcname)?;
        writeln!(self.w, "{{")?;
        writeln!(
            self.w,
            "    const VALUE *const original_body_iseq = (const VALUE *)0x{:x};",
            self.body.encoded_addr()
        )?;
        if self.body.stack_max > 0 {
            writeln!(self.w, "    VALUE stack[{}];", self.body.stack_max)?;
        }

        // Optional-argument prologue: dispatch on the entry pc exactly the
        // way the interpreter's opt_pc does.
        if self.body.param.has_opt() {
            writeln!(self.w, "    switch ((long)(reg_cfp->pc - original_body_iseq)) {{")?;
            for &entry in &self.body.param.opt_table {
                writeln!(self.w, "      case {}:", entry)?;
                writeln!(self.w, "        goto label_{};", entry)?;
            }
            writeln!(self.w, "    }}")?;
        }

        self.compile_insns(0, 0)?;

        // Cancellation handler: restore the interpreter's view of the
        // operand stack and hand control back. Guards set reg_cfp->sp to the
        // live top before jumping here.
        writeln!(self.w)?;
        writeln!(self.w, "cancel:")?;
        for i in 0..self.body.stack_max {
            writeln!(self.w, "    *(cvm_base_ptr(reg_cfp) + {}) = stack[{}];", i, i)?;
        }
        writeln!(self.w, "    return Qundef;")?;
        writeln!(self.w, "}}")?;
        Ok(())
    }

    /// Compile a straight-line run starting at `pos`, following jumps until
    /// the branch terminates or reaches an already-compiled position.
    fn compile_insns(&mut self, mut pos: usize, mut stack_size: usize) -> Result<(), TranslateError> {
        while pos < self.body.size() && !self.compiled[pos] {
            self.compiled[pos] = true;
            let insn = self.body.decode(pos).ok_or(TranslateError::MalformedStream { pos })?;

            writeln!(self.w)?;
            writeln!(self.w, "label_{}: /* {} */", pos, insn.op.name())?;
            writeln!(self.w, "    reg_cfp->pc = original_body_iseq + {};", pos)?;

            let len = insn.op.len();
            match self.compile_insn(pos, insn.op, insn.operands, stack_size)? {
                Flow::Next(ss) => {
                    stack_size = ss;
                    pos += len;
                }
                Flow::Jump(target, ss) => {
                    stack_size = ss;
                    pos = target;
                }
                Flow::Finish => return Ok(()),
            }
        }
        Ok(())
    }

    // ===== Simulated-stack accounting =====

    /// Account for `n` pushes; fails when the body's bound is exceeded
    fn grow(&self, pos: usize, stack_size: usize, n: usize) -> Result<usize, TranslateError> {
        let size = stack_size + n;
        if size > self.body.stack_max {
            return Err(TranslateError::StackOverflow { pos, size, max: self.body.stack_max });
        }
        Ok(size)
    }

    /// Account for `n` pops
    fn shrink(&self, pos: usize, stack_size: usize, n: usize) -> Result<usize, TranslateError> {
        stack_size.checked_sub(n).ok_or(TranslateError::StackUnderflow { pos })
    }

    /// A branch target must land on an opcode word inside the body
    fn check_target(&self, pos: usize, target: usize) -> Result<(), TranslateError> {
        if target >= self.body.size() {
            return Err(TranslateError::MalformedStream { pos });
        }
        Ok(())
    }

    /// Baked address of an inline-cache operand
    fn ic_addr(&self, pos: usize, idx: usize) -> Result<usize, TranslateError> {
        self.body
            .inline_cache_addr(idx)
            .ok_or(TranslateError::MalformedStream { pos })
    }

    // ===== Emission helpers =====

    /// Set the frame's sp to the current simulated top
    fn emit_sp(&mut self, stack_size: usize) -> Result<(), TranslateError> {
        writeln!(self.w, "        reg_cfp->sp = cvm_base_ptr(reg_cfp) + {};", stack_size)?;
        Ok(())
    }

    /// Write the live simulated slots back to the frame's operand stack,
    /// required before any call back into the interpreter
    fn emit_writeback(&mut self, stack_size: usize) -> Result<(), TranslateError> {
        for i in 0..stack_size {
            writeln!(self.w, "        *(cvm_base_ptr(reg_cfp) + {}) = stack[{}];", i, i)?;
        }
        Ok(())
    }

    /// Emit the shared tail of every optimized operator: take the helper's
    /// result, cancel when it reports the undefined sentinel, otherwise
    /// store into the result slot.
    fn emit_opt_fallback(
        &mut self,
        call: &str,
        result_slot: usize,
        stack_size_on_cancel: usize,
    ) -> Result<(), TranslateError> {
        writeln!(self.w, "    {{")?;
        writeln!(self.w, "        VALUE v = {};", call)?;
        writeln!(self.w, "        if (v == Qundef) {{")?;
        writeln!(
            self.w,
            "            reg_cfp->sp = cvm_base_ptr(reg_cfp) + {};",
            stack_size_on_cancel
        )?;
        writeln!(self.w, "            goto cancel;")?;
        writeln!(self.w, "        }}")?;
        writeln!(self.w, "        stack[{}] = v;", result_slot)?;
        writeln!(self.w, "    }}")?;
        Ok(())
    }

    /// Compile a conditional edge: the taken goto was already emitted by the
    /// caller; compile the fall-through branch now, then continue at the
    /// taken target when the recursion returns.
    fn branch(
        &mut self,
        pos: usize,
        op: OpCode,
        target: usize,
        fall_stack_size: usize,
        taken_stack_size: usize,
    ) -> Result<Flow, TranslateError> {
        self.check_target(pos, target)?;
        self.compile_insns(pos + op.len(), fall_stack_size)?;
        Ok(Flow::Jump(target, taken_stack_size))
    }
}

/// Format a value operand as a baked C literal
fn value_lit(word: u64) -> String {
    format!("(VALUE)0x{:x}", word)
}

/// The environment-pointer expression for a lexical level
fn ep_expr(level: u64) -> String {
    if level == 0 {
        "reg_cfp->ep".to_string()
    } else {
        format!("cvm_ep_level(reg_cfp->ep, {})", level)
    }
}
