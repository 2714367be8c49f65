//! Engine façade: lifecycle, hooks, and shared state
//!
//! `JitEngine::init` snapshots the options, resolves the runtime header and
//! the compiler, spawns the worker, and hands the host a façade whose every
//! entry point degrades to a no-op when the engine is disabled. Failures
//! never propagate to the host: they disable the engine (initialization,
//! PCH) or mark a single body not compilable (per-unit).
//!
//! One mutex guards the shared state; four condition variables give
//! directed wakeups: `pch_cond` (PCH decided), `client_cond` (translation
//! finished / worker exited), `worker_cond` (queue or finish), `gc_cond`
//! (GC finished).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::build::cc::resolve_compiler;
use crate::build::{remove_temp, temp_path, PCH_PREFIX, PCH_SUFFIX};
use crate::options::JitOptions;
use crate::unit::{JitUnit, UnitQueue};
use crate::vm::{IseqBody, JitEntry};
use crate::worker;

/// Default install location of the minimized runtime header
const HEADER_INSTALL_DIR: &str = "/usr/local/include/corvid";
/// Minimized runtime header file name
const HEADER_NAME: &str = "corvid_runtime.min.h";
/// Environment override for the header location
const HEADER_ENV: &str = "CORVID_JIT_HEADER";

/// Process-wide flag: is a JIT engine active? The interpreter reads this
/// before consulting any body's entry slot.
static JIT_ENABLED: AtomicBool = AtomicBool::new(false);
/// Latched in a forked child; the child never inherits the worker thread,
/// so every engine in it is dead.
static FORK_DISABLED: AtomicBool = AtomicBool::new(false);
static FORK_HANDLER: Once = Once::new();
/// The worker, the scratch namespace and the fork handler are per-process;
/// only one engine may ever come up.
static ENGINE_CLAIMED: OnceCell<()> = OnceCell::new();

/// Is a JIT engine active in this process?
pub fn jit_enabled() -> bool {
    JIT_ENABLED.load(Ordering::Acquire) && !FORK_DISABLED.load(Ordering::Acquire)
}

unsafe extern "C" fn disable_in_fork_child() {
    // Only async-signal-safe work here: plain atomic stores.
    FORK_DISABLED.store(true, Ordering::Release);
    JIT_ENABLED.store(false, Ordering::Release);
}

fn register_fork_handler() {
    FORK_HANDLER.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(disable_in_fork_child));
    });
}

/// Precompiled-header lifecycle state. Moves away from `NotReady` exactly
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PchStatus {
    /// The worker has not decided yet
    NotReady,
    /// PCH build failed; the engine is disabled for the process
    Failed,
    /// PCH is on disk and per-unit builds may use it
    Success,
}

pub(crate) struct EngineInner {
    pub(crate) queue: UnitQueue,
    /// Compiled units, keeping their shared objects mapped
    pub(crate) active: FxHashMap<u64, JitUnit>,
    pub(crate) pch_status: PchStatus,
    pub(crate) finish_requested: bool,
    pub(crate) worker_finished: bool,
    pub(crate) in_gc: bool,
    pub(crate) in_jit: bool,
    next_unit_id: u64,
    pub(crate) compiled_count: usize,
}

pub(crate) struct EngineState {
    pub(crate) opts: JitOptions,
    pub(crate) header_file: PathBuf,
    pub(crate) pch_file: PathBuf,
    pub(crate) scratch_dir: PathBuf,
    pub(crate) compiler: PathBuf,
    pub(crate) enabled: AtomicBool,
    pub(crate) inner: Mutex<EngineInner>,
    pub(crate) pch_cond: Condvar,
    pub(crate) client_cond: Condvar,
    pub(crate) worker_cond: Condvar,
    pub(crate) gc_cond: Condvar,
}

impl EngineState {
    fn new(opts: JitOptions, header_file: PathBuf, scratch_dir: PathBuf, enabled: bool) -> EngineState {
        let pch_file = temp_path(&scratch_dir, PCH_PREFIX, 0, PCH_SUFFIX);
        let compiler = resolve_compiler(&opts);
        EngineState {
            opts,
            header_file,
            pch_file,
            scratch_dir,
            compiler,
            enabled: AtomicBool::new(enabled),
            inner: Mutex::new(EngineInner {
                queue: UnitQueue::new(),
                active: FxHashMap::default(),
                pch_status: PchStatus::NotReady,
                finish_requested: false,
                worker_finished: false,
                in_gc: false,
                in_jit: false,
                next_unit_id: 0,
                compiled_count: 0,
            }),
            pch_cond: Condvar::new(),
            client_cond: Condvar::new(),
            worker_cond: Condvar::new(),
            gc_cond: Condvar::new(),
        }
    }

    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        JIT_ENABLED.store(false, Ordering::Release);
    }
}

/// The method-JIT engine façade handed to the host interpreter
pub struct JitEngine {
    state: Arc<EngineState>,
}

impl JitEngine {
    /// Bring the engine up. Never fails outward: on any initialization
    /// problem the returned engine is disabled and the host proceeds
    /// without JIT.
    pub fn init(opts: JitOptions) -> JitEngine {
        register_fork_handler();

        let scratch_dir = opts
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        if !opts.enabled {
            return JitEngine {
                state: Arc::new(EngineState::new(opts, PathBuf::new(), scratch_dir, false)),
            };
        }

        let header_file = match resolve_header(&opts) {
            Some(path) => path,
            None => {
                opts.diag(1, "runtime header not found, JIT disabled");
                return JitEngine {
                    state: Arc::new(EngineState::new(opts, PathBuf::new(), scratch_dir, false)),
                };
            }
        };

        if ENGINE_CLAIMED.set(()).is_err() {
            opts.diag(1, "engine already initialized in this process, JIT disabled");
            return JitEngine {
                state: Arc::new(EngineState::new(opts, PathBuf::new(), scratch_dir, false)),
            };
        }

        let state = Arc::new(EngineState::new(opts, header_file, scratch_dir, true));
        if let Err(e) = worker::spawn(state.clone()) {
            state.opts.diag(1, &format!("cannot spawn worker thread: {}", e));
            state.enabled.store(false, Ordering::Release);
            return JitEngine { state };
        }

        JIT_ENABLED.store(true, Ordering::Release);
        state.opts.diag(1, "engine initialized");
        JitEngine { state }
    }

    /// Is this engine accepting work?
    pub fn enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Acquire) && !FORK_DISABLED.load(Ordering::Acquire)
    }

    /// Snapshot of the options the engine runs with
    pub fn options(&self) -> &JitOptions {
        &self.state.opts
    }

    /// Hand a hot body to the engine. Allocates the body's unit, queues it,
    /// and wakes the worker. A body that is already tracked, already
    /// decided, or arriving after shutdown is ignored.
    pub fn add_iseq_to_process(&self, body: &Arc<IseqBody>) {
        if !self.enabled() {
            return;
        }
        if !matches!(body.jit_entry(), JitEntry::NotAttempted) || body.jit_unit() != 0 {
            return;
        }

        let mut inner = self.state.inner.lock();
        if inner.finish_requested || inner.pch_status == PchStatus::Failed {
            return;
        }
        inner.next_unit_id += 1;
        let id = inner.next_unit_id;
        body.set_jit_unit(id);
        inner.queue.enqueue(JitUnit::new(id, body.clone()));
        self.state.worker_cond.notify_all();
        self.state.opts.diag(3, &format!("queued {} as unit {}", body.label, id));

        self.unload_over_capacity(&mut inner);
    }

    /// Unload policy for an over-full cache: evict the compiled unit with
    /// the smallest observed call count until back under the bound. The
    /// evicted body keeps the not-compilable marker (the entry slot only
    /// moves forward), and the shared object is released.
    fn unload_over_capacity(&self, inner: &mut EngineInner) {
        while inner.active.len() > self.state.opts.max_cache_size {
            let victim = inner
                .active
                .values()
                .min_by_key(|u| (u.body.as_ref().map_or(0, |b| b.total_calls()), u.id))
                .map(|u| u.id);
            let Some(id) = victim else { break };
            if let Some(unit) = inner.active.remove(&id) {
                if let Some(body) = &unit.body {
                    body.mark_not_compilable();
                    body.set_jit_unit(0);
                }
                self.state.opts.diag(2, &format!("unloaded unit {}", id));
            }
        }
    }

    /// The host GC is about to free `body`: detach it from its unit so the
    /// worker skips it.
    pub fn free_iseq(&self, body: &IseqBody) {
        let id = body.jit_unit();
        if id == 0 {
            return;
        }
        let mut inner = self.state.inner.lock();
        if let Some(unit) = inner.queue.get_mut(id) {
            unit.body = None;
        } else if let Some(unit) = inner.active.get_mut(&id) {
            unit.body = None;
        }
        body.set_jit_unit(0);
    }

    /// GC entry hook: wait out an in-progress translation, then fence the
    /// worker off.
    pub fn gc_start_hook(&self) {
        if !self.enabled() {
            return;
        }
        let mut inner = self.state.inner.lock();
        while inner.in_jit {
            self.state.client_cond.wait(&mut inner);
        }
        inner.in_gc = true;
    }

    /// GC exit hook: release the fence and wake the worker
    pub fn gc_finish_hook(&self) {
        if !self.enabled() {
            return;
        }
        let mut inner = self.state.inner.lock();
        inner.in_gc = false;
        self.state.gc_cond.notify_all();
    }

    /// Cooperative shutdown: wait for the PCH decision, ask the worker to
    /// finish, drain every unit (releasing loader handles), and remove the
    /// PCH unless temps are kept.
    pub fn finish(&self) {
        if !self.state.enabled.load(Ordering::Acquire) {
            return;
        }

        let (units, compiled_count) = {
            let mut inner = self.state.inner.lock();
            while inner.pch_status == PchStatus::NotReady && !inner.worker_finished {
                self.state.pch_cond.wait(&mut inner);
            }
            inner.finish_requested = true;
            while !inner.worker_finished {
                self.state.worker_cond.notify_all();
                let _ = self
                    .state
                    .client_cond
                    .wait_for(&mut inner, Duration::from_millis(10));
            }

            let mut units = inner.queue.drain();
            units.extend(inner.active.drain().map(|(_, unit)| unit));
            (units, inner.compiled_count)
        };

        for unit in units {
            if let Some(body) = &unit.body {
                // The unit's code is about to be unmapped; the body must
                // not advertise it any more.
                body.mark_not_compilable();
                body.set_jit_unit(0);
            }
        }

        remove_temp(&self.state.pch_file, self.state.opts.save_temps);
        self.state.disable();
        self.state
            .opts
            .diag(1, &format!("finish: {} units compiled", compiled_count));
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Build an engine around live state without spawning the worker, so
    /// tests can drive the protocol by hand.
    #[cfg(test)]
    pub(crate) fn for_tests(opts: JitOptions) -> JitEngine {
        let scratch = opts.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
        JitEngine {
            state: Arc::new(EngineState::new(opts, PathBuf::new(), scratch, true)),
        }
    }
}

/// Find the minimized runtime header: host override, environment, then the
/// install dir.
fn resolve_header(opts: &JitOptions) -> Option<PathBuf> {
    if let Some(path) = &opts.header_path {
        return path.exists().then(|| path.clone());
    }
    if let Ok(path) = std::env::var(HEADER_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }
    let installed = PathBuf::from(HEADER_INSTALL_DIR).join(HEADER_NAME);
    installed.exists().then_some(installed)
}
