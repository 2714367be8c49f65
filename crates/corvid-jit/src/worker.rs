//! Background compilation worker
//!
//! A single detached thread runs a two-phase state machine: build the
//! precompiled header once, then drain the unit queue until the engine asks
//! it to finish. Per unit it runs the translator, the external compiler and
//! the loader, and publishes the entry pointer into the body.
//!
//! The worker is never cancelled mid-unit; shutdown sets the finish flag and
//! wakes the worker condvar, and the worker exits between units. GC mutual
//! exclusion brackets only the translation step (the only step that reads
//! collector-managed memory): the worker waits out an in-progress GC before
//! raising `in_jit`, and drops it again the moment the `.c` file is written.

use std::fmt::Write as _;
use std::sync::Arc;
use std::thread;

use crate::build::loader::SharedObject;
use crate::build::{cc, remove_temp, temp_path, UNIT_PREFIX};
use crate::engine::{EngineState, PchStatus};
use crate::options::CompilerKind;
use crate::translator;
use crate::unit::JitUnit;
use crate::vm::IseqBody;

/// Spawn the worker thread. The handle is dropped; the thread is detached
/// and coordinates with the engine purely through the shared state.
pub(crate) fn spawn(state: Arc<EngineState>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("corvid-jit-worker".to_string())
        .spawn(move || worker_loop(state))
        .map(|_| ())
}

fn worker_loop(state: Arc<EngineState>) {
    let pch_ok = build_pch(&state);
    {
        let mut inner = state.inner.lock();
        inner.pch_status = if pch_ok { PchStatus::Success } else { PchStatus::Failed };
        state.pch_cond.notify_all();
        if !pch_ok {
            // The engine is unusable for the rest of the process; pending
            // requests become no-ops.
            state.disable();
            inner.worker_finished = true;
            state.client_cond.notify_all();
            return;
        }
    }

    loop {
        let unit = {
            let mut inner = state.inner.lock();
            while inner.queue.is_empty() && !inner.finish_requested {
                state.worker_cond.wait(&mut inner);
            }
            if inner.finish_requested {
                break;
            }
            match inner.queue.dequeue_best() {
                Some(unit) => {
                    while inner.in_gc {
                        state.gc_cond.wait(&mut inner);
                    }
                    inner.in_jit = true;
                    unit
                }
                None => continue,
            }
        };
        process_unit(&state, unit);
    }

    let mut inner = state.inner.lock();
    inner.worker_finished = true;
    state.client_cond.notify_all();
    state.pch_cond.notify_all();
}

fn build_pch(state: &EngineState) -> bool {
    state.opts.diag(2, &format!("building precompiled header {}", state.pch_file.display()));
    let args = cc::pch_args(&state.opts, &state.header_file, &state.pch_file);
    match cc::run_compiler(&state.compiler, &args, state.opts.verbose) {
        Ok(()) => true,
        Err(e) => {
            state.opts.diag(1, &format!("precompiled header build failed: {}", e));
            false
        }
    }
}

/// Compile one dequeued unit end to end. `in_jit` is held on entry and
/// released as soon as the translation is on disk.
fn process_unit(state: &Arc<EngineState>, mut unit: JitUnit) {
    let funcname = unit.funcname();
    let c_file = temp_path(&state.scratch_dir, UNIT_PREFIX, unit.id, ".c");
    let so_file = temp_path(&state.scratch_dir, UNIT_PREFIX, unit.id, ".so");

    let body = unit.body.clone();
    let translated = match &body {
        Some(body) => translate_to_file(state, body, &funcname, &c_file),
        // Body collected between enqueue and dequeue: discard the unit
        None => Err("body collected before translation".to_string()),
    };

    // Translation no longer touches the body; let a pending GC proceed.
    {
        let mut inner = state.inner.lock();
        inner.in_jit = false;
        state.client_cond.notify_all();
    }

    let body = match body {
        Some(body) => body,
        None => return,
    };

    if let Err(reason) = translated {
        state.opts.warn(&format!("cannot compile {}: {}", body.label, reason));
        remove_temp(&c_file, state.opts.save_temps);
        give_up(&body);
        return;
    }

    let args = cc::so_args(&state.opts, &state.pch_file, &c_file, &so_file);
    if let Err(e) = cc::run_compiler(&state.compiler, &args, state.opts.verbose) {
        state.opts.warn(&format!("C compile failed for {}: {}", body.label, e));
        remove_temp(&c_file, state.opts.save_temps);
        remove_temp(&so_file, state.opts.save_temps);
        give_up(&body);
        return;
    }

    let loaded = SharedObject::open(&so_file)
        .and_then(|so| so.entry(&funcname).map(|func| (so, func)));
    // The object stays mapped once opened; the files themselves are spent.
    remove_temp(&c_file, state.opts.save_temps);
    remove_temp(&so_file, state.opts.save_temps);

    match loaded {
        Ok((so, func)) => {
            unit.handle = Some(so);
            body.publish_entry(func);
            state.opts.diag(2, &format!("compiled {} as {}", body.label, funcname));
            let mut inner = state.inner.lock();
            inner.compiled_count += 1;
            inner.active.insert(unit.id, unit);
        }
        Err(e) => {
            state.opts.warn(&format!("failed to load compiled {}: {}", body.label, e));
            give_up(&body);
        }
    }
}

/// Terminal failure for a body: never retried, no longer tracked
fn give_up(body: &IseqBody) {
    body.mark_not_compilable();
    body.set_jit_unit(0);
}

/// Write the compile prelude and the translated function to the `.c` file.
///
/// gcc-style drivers pick the PCH up through an include of the header path
/// the `.gch` was compiled to; clang preloads it with `-include-pch` and
/// needs no include at all.
fn translate_to_file(
    state: &EngineState,
    body: &IseqBody,
    funcname: &str,
    c_file: &std::path::Path,
) -> Result<(), String> {
    let mut src = String::new();
    if state.opts.compiler == CompilerKind::Cc {
        let pch = state.pch_file.display().to_string();
        let header = pch.strip_suffix(".gch").unwrap_or(&pch);
        writeln!(src, "#include \"{}\"", header).map_err(|e| e.to_string())?;
    }

    translator::compile(&mut src, body, funcname).map_err(|e| e.to_string())?;
    std::fs::write(c_file, src).map_err(|e| e.to_string())
}
