//! The background flusher.
//!
//! One long-lived thread, started at init and joined by the exit hook. It
//! wakes every 50 ms to poll the quit flag and rewrites the output file
//! once a second; when the flag is observed set it performs one final flush
//! and exits. There is at most one flush after the flag is set.

use crate::{log, profile, rt::Runtime};
use std::{mem::MaybeUninit, ptr, sync::atomic::Ordering, thread, time::Duration};

/// How often the quit flag is polled.
const POLL_SLICE: Duration = Duration::from_millis(50);
/// Poll slices between flushes: one flush per second.
const SLICES_PER_FLUSH: u32 = 20;

pub(crate) fn run(rt: &'static Runtime) {
    block_all_signals();
    log::debug("flusher started");
    loop {
        for _ in 0..SLICES_PER_FLUSH {
            if rt.quit.load(Ordering::Relaxed) {
                flush_now(rt);
                log::debug("flusher quit");
                return;
            }
            thread::sleep(POLL_SLICE);
        }
        flush_now(rt);
    }
}

/// The host program's signal handlers must never run on the flusher's
/// stack.
fn block_all_signals() {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigfillset(set.as_mut_ptr());
        libc::pthread_sigmask(libc::SIG_BLOCK, set.as_ptr(), ptr::null_mut());
    }
}

/// Rewrite the output file from the current histogram table.
///
/// If the process has forked since init, the data in memory belongs to the
/// parent: warn once and write nothing. The child must not open files the
/// parent is also writing.
pub(crate) fn flush_now(rt: &Runtime) {
    if unsafe { libc::getpid() } != rt.pid {
        if !rt.fork_warned.swap(true, Ordering::Relaxed) {
            log::warning(&format!(
                "{} has forked; perf data is not recorded in the child process",
                rt.short_name
            ));
        }
        return;
    }

    let res = rt
        .histograms
        .with_table(|table| profile::write_file(&rt.data_path, &rt.header, table));
    if let Err(e) = res {
        log::error(&format!("flush to {} failed: {e}", rt.data_path.display()));
    }
}
