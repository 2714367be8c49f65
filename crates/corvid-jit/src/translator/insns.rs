//! Per-instruction C emission
//!
//! Each arm adjusts the simulated `stack_size` and writes the C statements
//! realizing the instruction against the local stack array. Helpers that
//! can observe redefinition (the optimized operators and the guarded frozen
//! strings) return the undefined sentinel and route through the shared
//! cancellation path.

use std::fmt::Write;

use crate::vm::OpCode;

use super::{ep_expr, value_lit, Flow, Translator, TranslateError};

impl<'a, W: Write> Translator<'a, W> {
    pub(super) fn compile_insn(
        &mut self,
        pos: usize,
        op: OpCode,
        operands: &[u64],
        stack_size: usize,
    ) -> Result<Flow, TranslateError> {
        use OpCode::*;

        let w = |t: &mut Self, line: &str| -> Result<(), TranslateError> {
            writeln!(t.w, "    {}", line)?;
            Ok(())
        };

        match op {
            Nop => Ok(Flow::Next(stack_size)),

            // ===== Stack primitives =====
            PutNil => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(self, &format!("stack[{}] = Qnil;", stack_size))?;
                Ok(Flow::Next(ss))
            }
            PutSelf => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(self, &format!("stack[{}] = reg_cfp->self;", stack_size))?;
                Ok(Flow::Next(ss))
            }
            PutObject => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(self, &format!("stack[{}] = {};", stack_size, value_lit(operands[0])))?;
                Ok(Flow::Next(ss))
            }
            PutString => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_str_resurrect(ec, {});",
                        stack_size,
                        value_lit(operands[0])
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            Dup => {
                self.shrink(pos, stack_size, 1)?;
                let ss = self.grow(pos, stack_size, 1)?;
                w(self, &format!("stack[{}] = stack[{}];", stack_size, stack_size - 1))?;
                Ok(Flow::Next(ss))
            }
            DupN => {
                let n = operands[0] as usize;
                self.shrink(pos, stack_size, n)?;
                let ss = self.grow(pos, stack_size, n)?;
                for i in 0..n {
                    w(
                        self,
                        &format!("stack[{}] = stack[{}];", stack_size + i, stack_size - n + i),
                    )?;
                }
                Ok(Flow::Next(ss))
            }
            Swap => {
                self.shrink(pos, stack_size, 2)?;
                w(self, "{")?;
                w(self, &format!("    VALUE tmp = stack[{}];", stack_size - 1))?;
                w(
                    self,
                    &format!("    stack[{}] = stack[{}];", stack_size - 1, stack_size - 2),
                )?;
                w(self, &format!("    stack[{}] = tmp;", stack_size - 2))?;
                w(self, "}")?;
                Ok(Flow::Next(stack_size))
            }
            Reverse => {
                let n = operands[0] as usize;
                self.shrink(pos, stack_size, n)?;
                w(self, "{")?;
                for i in 0..n / 2 {
                    let a = stack_size - n + i;
                    let b = stack_size - 1 - i;
                    w(self, &format!("    VALUE tmp{} = stack[{}];", i, a))?;
                    w(self, &format!("    stack[{}] = stack[{}];", a, b))?;
                    w(self, &format!("    stack[{}] = tmp{};", b, i))?;
                }
                w(self, "}")?;
                Ok(Flow::Next(stack_size))
            }
            Pop => Ok(Flow::Next(self.shrink(pos, stack_size, 1)?)),
            TopN => {
                let k = operands[0] as usize;
                self.shrink(pos, stack_size, k + 1)?;
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!("stack[{}] = stack[{}];", stack_size, stack_size - 1 - k),
                )?;
                Ok(Flow::Next(ss))
            }
            SetN => {
                let k = operands[0] as usize;
                self.shrink(pos, stack_size, k + 1)?;
                w(
                    self,
                    &format!("stack[{}] = stack[{}];", stack_size - 1 - k, stack_size - 1),
                )?;
                Ok(Flow::Next(stack_size))
            }
            AdjustStack => {
                let n = operands[0] as usize;
                Ok(Flow::Next(self.shrink(pos, stack_size, n)?))
            }

            // ===== Locals =====
            GetLocal | GetLocalWc0 | GetLocalWc1 => {
                let (idx, level) = match op {
                    GetLocal => (operands[0], operands[1]),
                    GetLocalWc0 => (operands[0], 0),
                    _ => (operands[0], 1),
                };
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!("stack[{}] = *({} - {});", stack_size, ep_expr(level), idx),
                )?;
                Ok(Flow::Next(ss))
            }
            SetLocal | SetLocalWc0 | SetLocalWc1 => {
                let (idx, level) = match op {
                    SetLocal => (operands[0], operands[1]),
                    SetLocalWc0 => (operands[0], 0),
                    _ => (operands[0], 1),
                };
                let ss = self.shrink(pos, stack_size, 1)?;
                w(self, &format!("*({} - {}) = stack[{}];", ep_expr(level), idx, ss))?;
                Ok(Flow::Next(ss))
            }

            // ===== Object construction =====
            NewArray => {
                let n = operands[0] as usize;
                let base = self.shrink(pos, stack_size, n)?;
                let ss = self.grow(pos, base, 1)?;
                w(
                    self,
                    &format!("stack[{}] = cvm_newarray(ec, {}, &stack[{}]);", base, n, base),
                )?;
                Ok(Flow::Next(ss))
            }
            DupArray => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_ary_resurrect(ec, {});",
                        stack_size,
                        value_lit(operands[0])
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            ExpandArray => {
                let num = operands[0] as usize;
                let flag = operands[1];
                let base = self.shrink(pos, stack_size, 1)?;
                let ss = self.grow(pos, base, num + (flag & 1) as usize)?;
                w(
                    self,
                    &format!(
                        "cvm_expandarray(ec, &stack[{}], {}, {});",
                        base, num, flag
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            ConcatArray => {
                let base = self.shrink(pos, stack_size, 2)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_concat_array(ec, stack[{}], stack[{}]);",
                        base,
                        base,
                        base + 1
                    ),
                )?;
                Ok(Flow::Next(base + 1))
            }
            SplatArray => {
                self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_splat_array(ec, stack[{}], {});",
                        stack_size - 1,
                        stack_size - 1,
                        operands[0]
                    ),
                )?;
                Ok(Flow::Next(stack_size))
            }
            NewHash => {
                let n = operands[0] as usize;
                let base = self.shrink(pos, stack_size, n)?;
                let ss = self.grow(pos, base, 1)?;
                w(
                    self,
                    &format!("stack[{}] = cvm_newhash(ec, {}, &stack[{}]);", base, n, base),
                )?;
                Ok(Flow::Next(ss))
            }
            NewRange => {
                let base = self.shrink(pos, stack_size, 2)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_newrange(ec, stack[{}], stack[{}], {});",
                        base,
                        base,
                        base + 1,
                        operands[0]
                    ),
                )?;
                Ok(Flow::Next(base + 1))
            }
            ToRegexp => {
                let (opt, cnt) = (operands[0], operands[1] as usize);
                let base = self.shrink(pos, stack_size, cnt)?;
                let ss = self.grow(pos, base, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_toregexp(ec, {}, {}, &stack[{}]);",
                        base, opt, cnt, base
                    ),
                )?;
                Ok(Flow::Next(ss))
            }

            // ===== Strings & symbols =====
            ConcatStrings => {
                let n = operands[0] as usize;
                let base = self.shrink(pos, stack_size, n)?;
                let ss = self.grow(pos, base, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_concatstrings(ec, {}, &stack[{}]);",
                        base, n, base
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            ToString => {
                self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_tostring(ec, stack[{}]);",
                        stack_size - 1,
                        stack_size - 1
                    ),
                )?;
                Ok(Flow::Next(stack_size))
            }
            FreezeString => {
                self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_freezestring(stack[{}], {});",
                        stack_size - 1,
                        stack_size - 1,
                        value_lit(operands[0])
                    ),
                )?;
                Ok(Flow::Next(stack_size))
            }
            Intern => {
                self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_intern(stack[{}]);",
                        stack_size - 1,
                        stack_size - 1
                    ),
                )?;
                Ok(Flow::Next(stack_size))
            }
            OptStrFreeze | OptStrUminus => {
                let helper = if op == OptStrFreeze { "cvm_opt_str_freeze" } else { "cvm_opt_str_uminus" };
                let ss = self.grow(pos, stack_size, 1)?;
                let call = format!("{}({})", helper, value_lit(operands[0]));
                self.emit_opt_fallback(&call, stack_size, stack_size)?;
                Ok(Flow::Next(ss))
            }

            // ===== Variables & inline caches =====
            GetInstanceVariable => {
                let ic = self.ic_addr(pos, operands[1] as usize)?;
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_getivar(reg_cfp->self, {}, (cvm_inline_cache_t *)0x{:x});",
                        stack_size,
                        value_lit(operands[0]),
                        ic
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            SetInstanceVariable => {
                let ic = self.ic_addr(pos, operands[1] as usize)?;
                let ss = self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "cvm_setivar(reg_cfp->self, {}, stack[{}], (cvm_inline_cache_t *)0x{:x});",
                        value_lit(operands[0]),
                        ss,
                        ic
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            GetClassVariable => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_getclassvariable(ec, reg_cfp, {});",
                        stack_size,
                        value_lit(operands[0])
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            SetClassVariable => {
                let ss = self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "cvm_setclassvariable(ec, reg_cfp, {}, stack[{}]);",
                        value_lit(operands[0]),
                        ss
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            GetConstant => {
                self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_getconstant(ec, stack[{}], {});",
                        stack_size - 1,
                        stack_size - 1,
                        value_lit(operands[0])
                    ),
                )?;
                Ok(Flow::Next(stack_size))
            }
            SetConstant => {
                let ss = self.shrink(pos, stack_size, 2)?;
                w(
                    self,
                    &format!(
                        "cvm_setconstant(ec, stack[{}], {}, stack[{}]);",
                        ss + 1,
                        value_lit(operands[0]),
                        ss
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            GetGlobal => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!("stack[{}] = cvm_getglobal({});", stack_size, value_lit(operands[0])),
                )?;
                Ok(Flow::Next(ss))
            }
            SetGlobal => {
                let ss = self.shrink(pos, stack_size, 1)?;
                w(self, &format!("cvm_setglobal({}, stack[{}]);", value_lit(operands[0]), ss))?;
                Ok(Flow::Next(ss))
            }
            GetSpecial => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_getspecial(ec, {}, {});",
                        stack_size, operands[0], operands[1]
                    ),
                )?;
                Ok(Flow::Next(ss))
            }
            SetSpecial => {
                let ss = self.shrink(pos, stack_size, 1)?;
                w(self, &format!("cvm_setspecial(ec, {}, stack[{}]);", operands[0], ss))?;
                Ok(Flow::Next(ss))
            }
            GetInlineCache => {
                let target = operands[0] as usize;
                let ic = self.ic_addr(pos, operands[1] as usize)?;
                let ss = self.grow(pos, stack_size, 1)?;
                w(self, "{")?;
                w(
                    self,
                    &format!(
                        "    VALUE v = cvm_ic_get((const cvm_inline_cache_t *)0x{:x}, reg_cfp->ep);",
                        ic
                    ),
                )?;
                w(self, "    if (v != Qundef) {")?;
                w(self, &format!("        stack[{}] = v;", stack_size))?;
                w(self, &format!("        goto label_{};", target))?;
                w(self, "    }")?;
                w(self, &format!("    stack[{}] = Qnil;", stack_size))?;
                w(self, "}")?;
                self.branch(pos, op, target, ss, ss)
            }
            SetInlineCache => {
                let ic = self.ic_addr(pos, operands[0] as usize)?;
                self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "cvm_ic_set((cvm_inline_cache_t *)0x{:x}, reg_cfp->ep, stack[{}]);",
                        ic,
                        stack_size - 1
                    ),
                )?;
                Ok(Flow::Next(stack_size))
            }

            // ===== Branches =====
            Jump => {
                let target = operands[0] as usize;
                self.check_target(pos, target)?;
                w(self, "CVM_CHECK_INTS(ec);")?;
                w(self, &format!("goto label_{};", target))?;
                Ok(Flow::Jump(target, stack_size))
            }
            BranchIf | BranchUnless | BranchNil => {
                let target = operands[0] as usize;
                let ss = self.shrink(pos, stack_size, 1)?;
                let cond = match op {
                    BranchIf => format!("CVM_TEST(stack[{}])", ss),
                    BranchUnless => format!("!CVM_TEST(stack[{}])", ss),
                    _ => format!("stack[{}] == Qnil", ss),
                };
                w(self, &format!("if ({}) {{", cond))?;
                w(self, "    CVM_CHECK_INTS(ec);")?;
                w(self, &format!("    goto label_{};", target))?;
                w(self, "}")?;
                self.branch(pos, op, target, ss, ss)
            }
            BranchIfType => {
                let target = operands[1] as usize;
                let ss = self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!("if (cvm_type_p(stack[{}], {})) {{", ss, operands[0]),
                )?;
                w(self, "    CVM_CHECK_INTS(ec);")?;
                w(self, &format!("    goto label_{};", target))?;
                w(self, "}")?;
                self.branch(pos, op, target, ss, ss)
            }
            OptCaseDispatch => {
                let table_idx = operands[0] as usize;
                let else_target = operands[1] as usize;
                let ss = self.shrink(pos, stack_size, 1)?;
                self.check_target(pos, else_target)?;

                let table_addr = self
                    .body
                    .case_table_addr(table_idx)
                    .ok_or(TranslateError::MalformedStream { pos })?;
                // Distinct destinations only; several keys may share one
                let mut targets: Vec<usize> = Vec::new();
                for &(_, target) in &self.body.case_tables[table_idx].entries {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
                w(self, "{")?;
                w(
                    self,
                    &format!(
                        "    switch (cvm_case_dispatch((const cvm_cdhash_t *)0x{:x}, stack[{}])) {{",
                        table_addr, ss
                    ),
                )?;
                for &target in &targets {
                    self.check_target(pos, target)?;
                    w(self, &format!("      case {}:", target))?;
                    w(self, "        CVM_CHECK_INTS(ec);")?;
                    w(self, &format!("        goto label_{};", target))?;
                }
                w(self, "      default:")?;
                w(self, "        CVM_CHECK_INTS(ec);")?;
                w(self, &format!("        goto label_{};", else_target))?;
                w(self, "    }")?;
                w(self, "}")?;

                // Every successor goes through a goto; compile each target
                // branch with the post-pop stack.
                for &target in &targets {
                    self.compile_insns(target, ss)?;
                }
                self.compile_insns(else_target, ss)?;
                Ok(Flow::Finish)
            }

            // ===== Calls & frame exit =====
            Send | OptSendWithoutBlock | InvokeSuper | InvokeBlock => {
                self.compile_send(pos, op, operands, stack_size)
            }
            Leave => {
                if stack_size != 1 {
                    return Err(TranslateError::LeaveStackMismatch { pos, size: stack_size });
                }
                w(self, "CVM_CHECK_INTS(ec);")?;
                w(self, "cvm_pop_frame(ec, reg_cfp);")?;
                w(self, "return stack[0];")?;
                Ok(Flow::Finish)
            }
            Throw => {
                let ss = self.shrink(pos, stack_size, 1)?;
                w(self, "{")?;
                self.emit_writeback(stack_size)?;
                self.emit_sp(stack_size)?;
                w(
                    self,
                    &format!("    return cvm_throw(ec, reg_cfp, {}, stack[{}]);", operands[0], ss),
                )?;
                w(self, "}")?;
                Ok(Flow::Finish)
            }

            // ===== Optimized operators =====
            OptPlus | OptMinus | OptMult | OptDiv | OptMod | OptEq | OptNeq | OptLt | OptLe
            | OptGt | OptGe | OptLtlt | OptAref | OptRegexpMatch2 => {
                let helper = match op {
                    OptPlus => "cvm_opt_plus",
                    OptMinus => "cvm_opt_minus",
                    OptMult => "cvm_opt_mult",
                    OptDiv => "cvm_opt_div",
                    OptMod => "cvm_opt_mod",
                    OptEq => "cvm_opt_eq",
                    OptNeq => "cvm_opt_neq",
                    OptLt => "cvm_opt_lt",
                    OptLe => "cvm_opt_le",
                    OptGt => "cvm_opt_gt",
                    OptGe => "cvm_opt_ge",
                    OptLtlt => "cvm_opt_ltlt",
                    OptAref => "cvm_opt_aref",
                    _ => "cvm_opt_regexpmatch2",
                };
                let ss = self.shrink(pos, stack_size, 2)?;
                let call = format!("{}(stack[{}], stack[{}])", helper, ss, ss + 1);
                self.emit_opt_fallback(&call, ss, stack_size)?;
                Ok(Flow::Next(ss + 1))
            }
            OptAset => {
                let ss = self.shrink(pos, stack_size, 3)?;
                let call = format!(
                    "cvm_opt_aset(stack[{}], stack[{}], stack[{}])",
                    ss,
                    ss + 1,
                    ss + 2
                );
                self.emit_opt_fallback(&call, ss, stack_size)?;
                Ok(Flow::Next(ss + 1))
            }
            OptArefWith => {
                let ss = self.shrink(pos, stack_size, 1)?;
                let call = format!("cvm_opt_aref_with(stack[{}], {})", ss, value_lit(operands[0]));
                self.emit_opt_fallback(&call, ss, stack_size)?;
                Ok(Flow::Next(ss + 1))
            }
            OptAsetWith => {
                let ss = self.shrink(pos, stack_size, 2)?;
                let call = format!(
                    "cvm_opt_aset_with(stack[{}], {}, stack[{}])",
                    ss,
                    value_lit(operands[0]),
                    ss + 1
                );
                self.emit_opt_fallback(&call, ss, stack_size)?;
                Ok(Flow::Next(ss + 1))
            }
            OptLength | OptSize | OptEmptyP | OptSucc | OptNot => {
                let helper = match op {
                    OptLength => "cvm_opt_length",
                    OptSize => "cvm_opt_size",
                    OptEmptyP => "cvm_opt_empty_p",
                    OptSucc => "cvm_opt_succ",
                    _ => "cvm_opt_not",
                };
                let ss = self.shrink(pos, stack_size, 1)?;
                let call = format!("{}(stack[{}])", helper, ss);
                self.emit_opt_fallback(&call, ss, stack_size)?;
                Ok(Flow::Next(ss + 1))
            }
            OptRegexpMatch1 => {
                let ss = self.shrink(pos, stack_size, 1)?;
                let call = format!("cvm_opt_regexpmatch1({}, stack[{}])", value_lit(operands[0]), ss);
                self.emit_opt_fallback(&call, ss, stack_size)?;
                Ok(Flow::Next(ss + 1))
            }

            // ===== Tracing & inspection =====
            Trace => {
                w(self, "{")?;
                self.emit_writeback(stack_size)?;
                self.emit_sp(stack_size)?;
                w(self, &format!("    cvm_trace_hook(ec, reg_cfp, {});", operands[0]))?;
                w(self, "}")?;
                Ok(Flow::Next(stack_size))
            }
            Trace2 => {
                w(self, "{")?;
                self.emit_writeback(stack_size)?;
                self.emit_sp(stack_size)?;
                w(
                    self,
                    &format!(
                        "    cvm_trace_hook_data(ec, reg_cfp, {}, {});",
                        operands[0],
                        value_lit(operands[1])
                    ),
                )?;
                w(self, "}")?;
                Ok(Flow::Next(stack_size))
            }
            Defined => {
                self.shrink(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_defined(ec, reg_cfp, {}, {}, {}, stack[{}]);",
                        stack_size - 1,
                        operands[0],
                        value_lit(operands[1]),
                        value_lit(operands[2]),
                        stack_size - 1
                    ),
                )?;
                Ok(Flow::Next(stack_size))
            }
            CheckMatch => {
                let base = self.shrink(pos, stack_size, 2)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_checkmatch(ec, stack[{}], stack[{}], {});",
                        base,
                        base,
                        base + 1,
                        operands[0]
                    ),
                )?;
                Ok(Flow::Next(base + 1))
            }
            CheckKeyword => {
                let ss = self.grow(pos, stack_size, 1)?;
                w(
                    self,
                    &format!(
                        "stack[{}] = cvm_checkkeyword(reg_cfp->ep, {}, {});",
                        stack_size, operands[0], operands[1]
                    ),
                )?;
                Ok(Flow::Next(ss))
            }

            // ===== Interpreter-only =====
            GetBlockParamProxy | DefineClass | OptCallCFunction => {
                Err(TranslateError::Unsupported { insn: op.name(), pos })
            }
        }
    }
}
