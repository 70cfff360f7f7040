//! The measurement runtime linked into trec-instrumented programs.
//!
//! The instrumentation pass plants calls to the C-ABI probes below and a
//! module constructor that calls [__trec_init]. At run time an enter probe
//! reads the configured clock and stores the sample in the calling thread's
//! entry map; the matching exit probe reads the clock again and folds the
//! difference into the process-wide histogram for that identifier. A
//! background flusher rewrites the output file once a second and once more
//! at process exit.
//!
//! Initialisation is idempotent: the first caller wins a compare-and-swap
//! and builds an immutable [Runtime] handle stored in a process-wide
//! pointer; every probe loads that pointer lock-free and does nothing while
//! it is null, which covers the `none` mode, probes firing before init, and
//! probes firing after teardown.
//!
//! Configuration is environment-only: `TREC_PERF_MODE` (clock source, unset
//! disables everything), `TREC_PERF_DIR` (output directory), and
//! `TREC_PERF_INTERVAL` (histogram bucket width). See [rt] for the rest.

mod clock;
mod entrymap;
mod flush;
mod histogram;
mod log;
mod profile;
mod rt;

pub use clock::Mode;
pub use histogram::{BUCKETS, DEFAULT_STEP};
pub use profile::{ETX, Profile, ProfileError, ProfileRecord};
pub use rt::RuntimeError;

use rt::Runtime;
use std::{
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

/// Latched by the first `__trec_init`; losers return immediately.
static INITED: AtomicBool = AtomicBool::new(false);
/// The runtime handle. Null before init, in disabled modes, and after the
/// exit hook has run.
static RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(ptr::null_mut());

fn runtime() -> Option<&'static Runtime> {
    let p = RUNTIME.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        // SAFETY: the pointer was leaked out of a Box by `__trec_init` and
        // is only reclaimed by the exit hook.
        Some(unsafe { &*p })
    }
}

/// Initialise the runtime. Called from the module constructor the pass
/// inserts; safe to call any number of times from any thread.
#[no_mangle]
pub extern "C" fn __trec_init() {
    if INITED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    match Runtime::from_env() {
        Ok(Some(runtime)) => {
            let ptr = Box::into_raw(Box::new(runtime));
            RUNTIME.store(ptr, Ordering::Release);
            // SAFETY: just leaked above; freed only by the exit hook.
            let rt: &'static Runtime = unsafe { &*ptr };
            rt.start_flusher();
            unsafe { libc::atexit(__trec_deinit) };
        }
        Ok(None) => (),
        Err(e) => log::fatal(&e.to_string()),
    }
}

/// The exit half of the lifecycle: stop and join the flusher (which flushes
/// one final time), then free the runtime-owned heap. Registered with
/// `atexit` by the init winner; calling it again is a no-op.
#[no_mangle]
pub extern "C" fn __trec_deinit() {
    let p = RUNTIME.swap(ptr::null_mut(), Ordering::AcqRel);
    if p.is_null() {
        return;
    }
    // SAFETY: only one caller can win the swap; the pointer came from
    // `__trec_init`'s Box.
    let rt = unsafe { &*p };
    rt.shutdown();
    log::debug("runtime deinitialised");
    drop(unsafe { Box::from_raw(p) });
}

/// Record the entry time of `id` on the current thread.
#[no_mangle]
pub extern "C" fn __trec_perf_enter(id: u64) {
    let Some(rt) = runtime() else { return };
    let Some(t) = clock::now(rt.mode) else { return };
    rt.entries.for_current_thread().record_entry(id, t);
}

/// Fold the cost since the matching entry into `id`'s histogram. An exit
/// with no recorded entry on this thread (seen when user exit hooks run on
/// degraded threads) drops its sample rather than faulting.
#[no_mangle]
pub extern "C" fn __trec_perf_exit(id: u64) {
    let Some(rt) = runtime() else { return };
    let Some(t) = clock::now(rt.mode) else { return };
    let Some(entered) = rt.entries.for_current_thread().entry_time(id) else {
        return;
    };
    rt.histograms.record(id, t - entered);
}

/// The dispatcher predicate: non-zero routes the instrumented call down the
/// block-probed clone, zero down the untouched original.
#[no_mangle]
pub extern "C" fn __trec_perf_record_bbl(_id: u64) -> u64 {
    match runtime() {
        Some(rt) if rt.fine_path => 1,
        _ => 0,
    }
}
