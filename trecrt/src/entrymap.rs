//! The per-thread entry-time maps and the process-wide index over them.
//!
//! Each thread owns a map from function identifier to the cost sample its
//! last enter probe recorded; the matching exit probe subtracts against it.
//! Re-entry simply overwrites, so recursive calls lose inner samples, which
//! the histogram semantics tolerate.
//!
//! The maps themselves do NOT live in thread-local storage. User code can
//! register `atexit` hooks, and on this target those run *after* a thread's
//! thread-local destructors. A TLS-resident map would already be dead when
//! the hooks' instrumented functions probe it. Instead the runtime owns one
//! index keyed by kernel thread id, and each inner map lives there until
//! the runtime is torn down.
//!
//! What *does* sit in thread-local storage is a bare pointer cache with no
//! destructor, so the index mutex is taken once per thread and late probes
//! still find their map.

use parking_lot::Mutex;
use std::{
    cell::{Cell, UnsafeCell},
    collections::HashMap,
    ptr,
};

/// One thread's identifier-to-entry-time map.
pub(crate) struct ThreadEntries(UnsafeCell<HashMap<u64, i64>>);

// SAFETY: a `ThreadEntries` is created under the index mutex, keyed by the
// creating thread's tid, and is only ever dereferenced by that thread. It
// is never removed from the index while the runtime is alive, so the
// references handed out below cannot dangle.
unsafe impl Send for ThreadEntries {}
unsafe impl Sync for ThreadEntries {}

impl ThreadEntries {
    fn new() -> Self {
        Self(UnsafeCell::new(HashMap::new()))
    }

    /// Record the entry sample for `id`, overwriting any previous one.
    pub(crate) fn record_entry(&self, id: u64, at: i64) {
        // SAFETY: sole-owner-thread access, see the impl comment.
        unsafe { (*self.0.get()).insert(id, at) };
    }

    /// The entry sample last recorded for `id`. `None` is the
    /// exit-without-entry case; callers drop the sample.
    pub(crate) fn entry_time(&self, id: u64) -> Option<i64> {
        // SAFETY: as above.
        unsafe { (*self.0.get()).get(&id).copied() }
    }
}

thread_local! {
    /// Cache of the current thread's [ThreadEntries], tagged with the
    /// address of the [EntryMap] that owns it so a pointer cached against
    /// one index is never served for another. A const-initialised `Cell`
    /// registers no destructor, so it stays readable while the thread
    /// tears down its real thread-locals.
    static CACHED: Cell<(usize, *const ThreadEntries)> = const { Cell::new((0, ptr::null())) };
}

/// The process-wide index of per-thread entry maps.
pub(crate) struct EntryMap {
    threads: Mutex<HashMap<libc::pid_t, Box<ThreadEntries>>>,
}

impl EntryMap {
    pub(crate) fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// The current thread's entry map, created on first use. The index
    /// mutex is only taken when the thread-local cache misses.
    pub(crate) fn for_current_thread(&self) -> &ThreadEntries {
        let key = self as *const EntryMap as usize;
        let (owner, cached) = CACHED.try_with(Cell::get).unwrap_or((0, ptr::null()));
        if owner == key && !cached.is_null() {
            // SAFETY: the pointee is owned by `threads`, which never drops
            // entries while the runtime is alive.
            return unsafe { &*cached };
        }
        let p = self.lookup_or_insert();
        CACHED.try_with(|c| c.set((key, p))).ok();
        // SAFETY: as above.
        unsafe { &*p }
    }

    fn lookup_or_insert(&self) -> *const ThreadEntries {
        let tid = unsafe { libc::gettid() };
        let mut lk = self.threads.lock();
        let entries = lk
            .entry(tid)
            .or_insert_with(|| Box::new(ThreadEntries::new()));
        &**entries as *const ThreadEntries
    }
}
