//! The implementation of the `TREC_LOG_INSTR` environment variable.
//!
//! When set to `-`, per-function instrumentation reports go to stderr; any
//! other value names a file which is truncated on first use and appended to
//! thereafter. When unset, reporting is disabled and costs one pointer load.

use std::{
    env,
    fs::File,
    io::Write,
    sync::LazyLock,
};

static LOG_INSTR: LazyLock<Option<String>> = LazyLock::new(|| {
    let p = env::var("TREC_LOG_INSTR").ok()?;
    if p != "-" {
        // Truncate any previous run's log so appends start clean.
        File::create(&p).ok();
    }
    Some(p)
});

pub(crate) fn log_instr(s: &str) {
    match LOG_INSTR.as_deref() {
        Some("-") => eprintln!("{s}"),
        Some(p) => {
            File::options()
                .append(true)
                .open(p)
                .map(|mut f| writeln!(f, "{s}"))
                .ok();
        }
        None => (),
    }
}
