//! The implementation of the `TREC_PERF_LOG` environment variable.
//!
//! The variable holds a numeric [Verbosity]; unset or unparsable values
//! fall back to [Verbosity::Warning] so that degraded-operation warnings
//! (a fork suppressing output, a failed flush) reach the user without any
//! configuration. Probe hot paths never log.

use std::{env, process, sync::LazyLock};
use strum_macros::FromRepr;

/// How verbose should the runtime's stderr reporting be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Nothing, not even errors.
    Disabled,
    /// Non-fatal errors.
    Error,
    /// Degraded-operation warnings.
    Warning,
    /// Lifecycle chatter for debugging the runtime itself.
    Debug,
}

static VERBOSITY: LazyLock<Verbosity> = LazyLock::new(|| {
    env::var("TREC_PERF_LOG")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .and_then(Verbosity::from_repr)
        .unwrap_or(Verbosity::Warning)
});

pub(crate) fn error(msg: &str) {
    emit(Verbosity::Error, msg);
}

pub(crate) fn warning(msg: &str) {
    emit(Verbosity::Warning, msg);
}

pub(crate) fn debug(msg: &str) {
    emit(Verbosity::Debug, msg);
}

fn emit(level: Verbosity, msg: &str) {
    if *VERBOSITY >= level {
        eprintln!("trec-perf: {msg}");
    }
}

/// Print a diagnostic regardless of verbosity and take the process down.
/// Used where continuing would record garbage: no clock source, no output
/// directory.
pub(crate) fn fatal(msg: &str) -> ! {
    eprintln!("trec-perf: fatal: {msg}");
    process::abort();
}
