//! End-to-end translation scenarios: literal bytecode in, literal C out.
//!
//! These pin the observable shape of generated code (the stack slots the
//! interpreter sees on cancellation, the guard literals, the dispatch
//! arguments) without needing a C toolchain.

use corvid_jit::translator::compile;
use corvid_jit::vm::calling::{CacheTarget, CallCache, CallInfo, Visibility};
use corvid_jit::vm::{IseqBody, IseqBuilder, OpCode, ParamDescriptor, Value};

fn translate(body: &IseqBody) -> String {
    let mut out = String::new();
    compile(&mut out, body, "_jit0").unwrap();
    out
}

#[test]
fn scenario_putobject_zero_returns_zero() {
    let mut b = IseqBuilder::new("zero", 1);
    b.insn(OpCode::PutObject, &[Value::fixnum(0).bits()]);
    b.insn(OpCode::Leave, &[]);
    let c = translate(&b.build());

    assert!(c.contains("stack[0] = (VALUE)0x1;"));
    assert!(c.contains("return stack[0];"));
}

#[test]
fn scenario_opt_plus_cache_miss_leaves_operands_in_frame() {
    let mut b = IseqBuilder::new("plus", 2);
    let (ci, cc) = b.call_site(CallInfo::simple(1, 1), CallCache::empty());
    b.insn(OpCode::PutObject, &[Value::fixnum(1).bits()]);
    b.insn(OpCode::PutObject, &[Value::fixnum(2).bits()]);
    b.insn(OpCode::OptPlus, &[ci, cc]);
    b.insn(OpCode::Leave, &[]);
    let c = translate(&b.build());

    // Normal path: 1 + 2 through the optimized helper, result in slot 0
    assert!(c.contains("cvm_opt_plus(stack[0], stack[1])"));

    // Miss path: sp covers both operands, then the cancellation block puts
    // slot 0 = 1 and slot 1 = 2 back where the interpreter expects them
    assert!(c.contains("reg_cfp->sp = cvm_base_ptr(reg_cfp) + 2;"));
    let cancel = c.find("\ncancel:").expect("cancel block");
    let tail = &c[cancel..];
    assert!(tail.contains("*(cvm_base_ptr(reg_cfp) + 0) = stack[0];"));
    assert!(tail.contains("*(cvm_base_ptr(reg_cfp) + 1) = stack[1];"));
    assert!(tail.contains("return Qundef;"));
}

#[test]
fn scenario_send_without_block_guards_method_state() {
    let mut b = IseqBuilder::new("call_foo", 1);
    let cache = CallCache {
        method_state: 41,
        class_serial: 77,
        visibility: Visibility::Public,
        target: CacheTarget::Cfunc { func: 0xf00d, argc: 0 },
    };
    let (ci, cc) = b.call_site(CallInfo::simple(0xf00, 0), cache);
    b.insn(OpCode::PutSelf, &[]);
    b.insn(OpCode::OptSendWithoutBlock, &[ci, cc]);
    b.insn(OpCode::Leave, &[]);
    let c = translate(&b.build());

    // Dispatch sees calling.recv = self and calling.argc = 0
    assert!(c.contains("calling.recv = stack[0];"));
    assert!(c.contains("calling.argc = 0;"));

    // On method-state mismatch the guard fires and the function reports
    // the undefined sentinel
    assert!(c.contains("cvm_global_method_state() != 41ull"));
    assert!(c.contains("cvm_class_serial(stack[0]) != 77ull"));
    assert!(c.contains("goto cancel;"));
    assert!(c.contains("return Qundef;"));
}

#[test]
fn scenario_trace_fires_hook_then_returns_nil() {
    let mut b = IseqBuilder::new("traced", 1);
    b.insn(OpCode::Trace, &[8]);
    b.insn(OpCode::PutNil, &[]);
    b.insn(OpCode::Leave, &[]);
    let c = translate(&b.build());

    let hook = c.find("cvm_trace_hook(ec, reg_cfp, 8);").expect("trace hook");
    let nil = c.find("stack[0] = Qnil;").expect("putnil");
    assert!(hook < nil);
    assert!(c.contains("return stack[0];"));
}

#[test]
fn scenario_branchunless_falsey_reaches_skipped_branch() {
    let taken = Value::static_sym(1);
    let skipped = Value::static_sym(2);

    let mut b = IseqBuilder::new("cond", 1);
    b.insn(OpCode::PutNil, &[]); // 0: falsey TOS
    b.insn(OpCode::BranchUnless, &[6]); // 1
    b.insn(OpCode::PutObject, &[taken.bits()]); // 3
    b.insn(OpCode::Leave, &[]); // 5
    b.insn(OpCode::PutObject, &[skipped.bits()]); // 6
    b.insn(OpCode::Leave, &[]); // 8
    let c = translate(&b.build());

    // Falsey TOS takes the branch to label_6, whose branch returns :skipped
    assert!(c.contains("if (!CVM_TEST(stack[0])) {"));
    assert!(c.contains("goto label_6;"));
    assert!(c.contains("label_6: /* putobject */"));
    assert!(c.contains(&format!("stack[0] = (VALUE)0x{:x};", skipped.bits())));
    assert!(c.contains(&format!("stack[0] = (VALUE)0x{:x};", taken.bits())));
    assert_eq!(c.matches("return stack[0];").count(), 2);
}

#[test]
fn scenario_locals_resolve_correct_environment_level() {
    let mut b = IseqBuilder::new("levels", 1);
    b.insn(OpCode::GetLocalWc0, &[2]);
    b.insn(OpCode::SetLocalWc1, &[3]);
    b.insn(OpCode::PutNil, &[]);
    b.insn(OpCode::Leave, &[]);
    let c = translate(&b.build());

    // Level 0 reads straight off the frame's ep; level 1 walks one scope up
    assert!(c.contains("stack[0] = *(reg_cfp->ep - 2);"));
    assert!(c.contains("*(cvm_ep_level(reg_cfp->ep, 1) - 3) = stack[0];"));
}

#[test]
fn boundary_opt_table_dispatches_every_entry() {
    let mut b = IseqBuilder::new("optargs", 1);
    b.insn(OpCode::PutNil, &[]); // 0: default for the optional arg
    b.insn(OpCode::SetLocalWc0, &[1]); // 1
    b.insn(OpCode::PutNil, &[]); // 3: body proper
    b.insn(OpCode::Leave, &[]); // 4
    let body = b
        .param(ParamDescriptor {
            lead_num: 0,
            opt_num: 1,
            opt_table: vec![0, 3],
            ..Default::default()
        })
        .build();
    let c = translate(&body);

    for entry in [0usize, 3] {
        assert!(c.contains(&format!("case {}:", entry)));
        assert!(c.contains(&format!("goto label_{};", entry)));
        assert!(c.contains(&format!("label_{}:", entry)));
    }
}

#[test]
fn boundary_zero_stack_max_emits_no_stack_array() {
    let mut b = IseqBuilder::new("spin", 0);
    b.insn(OpCode::Jump, &[0]);
    let c = translate(&b.build());

    assert!(!c.contains("VALUE stack["));
    assert!(c.contains("goto label_0;"));
}
