//! Full engine lifecycle against a stub compiler.
//!
//! The stub stands in for cc: it touches whatever `-o` names and exits 0,
//! so the PCH "builds", per-unit objects are produced empty, loading fails,
//! and every unit ends not compilable, which exercises the whole worker
//! pipeline, the hooks, and shutdown without a C toolchain on the machine.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use corvid_jit::vm::{IseqBody, IseqBuilder, JitEntry, OpCode};
use corvid_jit::{jit_enabled, JitEngine, JitOptions};

fn write_stub_compiler(dir: &Path) -> PathBuf {
    let path = dir.join("stub-cc");
    fs::write(
        &path,
        "#!/bin/sh\n\
         out=\"\"\n\
         prev=\"\"\n\
         for a in \"$@\"; do\n\
         \x20 if [ \"$prev\" = \"-o\" ]; then out=\"$a\"; fi\n\
         \x20 prev=\"$a\"\n\
         done\n\
         if [ -n \"$out\" ]; then : > \"$out\"; fi\n\
         exit 0\n",
    )
    .unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn hot_body(label: &str) -> Arc<IseqBody> {
    let mut b = IseqBuilder::new(label, 1);
    b.insn(OpCode::PutNil, &[]);
    b.insn(OpCode::Leave, &[]);
    let body = Arc::new(b.build());
    for _ in 0..10 {
        body.record_call();
    }
    body
}

fn wait_for_decision(body: &IseqBody) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match body.jit_entry() {
            JitEntry::NotAttempted => {
                assert!(Instant::now() < deadline, "worker never decided the unit");
                thread::sleep(Duration::from_millis(10));
            }
            _ => return,
        }
    }
}

#[test]
fn engine_lifecycle_with_stub_compiler() {
    let scratch = tempfile::tempdir().unwrap();
    let header = scratch.path().join("corvid_runtime.min.h");
    fs::write(&header, "/* minimized runtime header */\n").unwrap();
    let stub_cc = write_stub_compiler(scratch.path());

    let opts = JitOptions {
        enabled: true,
        min_calls: 1,
        header_path: Some(header),
        compiler_path: Some(stub_cc),
        scratch_dir: Some(scratch.path().to_path_buf()),
        ..JitOptions::default()
    };

    let engine = JitEngine::init(opts.clone());
    assert!(engine.enabled());
    assert!(jit_enabled());

    let body = hot_body("lifecycle");
    assert!(body.should_compile(engine.options()));
    engine.add_iseq_to_process(&body);

    // The stub produces an empty shared object, so loading fails and the
    // body lands terminal: not compilable, never retried.
    wait_for_decision(&body);
    assert!(matches!(body.jit_entry(), JitEntry::NotCompilable));
    assert!(!body.should_compile(engine.options()));

    // GC hooks interleave cleanly with a live worker
    engine.gc_start_hook();
    engine.gc_finish_hook();

    // A body collected right after enqueue is tolerated: the worker
    // discards its unit.
    let collected = hot_body("collected");
    engine.add_iseq_to_process(&collected);
    engine.free_iseq(&collected);

    engine.finish();
    assert!(!engine.enabled());
    assert!(!jit_enabled());

    // Nothing from the engine's namespace survives shutdown: the per-unit
    // .c/.so are deleted after use and the PCH at finish.
    let leftovers: Vec<String> = fs::read_dir(scratch.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("_jit"))
        .collect();
    assert!(leftovers.is_empty(), "stray scratch files: {:?}", leftovers);

    // The engine is a per-process singleton: a second init comes up
    // disabled and the host keeps interpreting.
    let second = JitEngine::init(opts);
    assert!(!second.enabled());
    second.finish();
}
