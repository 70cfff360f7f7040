//! Runtime construction and teardown.
//!
//! The [Runtime] is built exactly once, by the winner of the init race, and
//! lives behind a process-wide pointer until the exit hook tears it down.
//! All configuration is read here, from the environment, never again.

use crate::{
    clock::Mode,
    entrymap::EntryMap,
    flush,
    histogram::{DEFAULT_STEP, Histograms},
    log,
    profile::Header,
};
use parking_lot::Mutex;
use std::{
    env, fs, io,
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
    thread::JoinHandle,
};
use thiserror::Error;

pub(crate) const MODE_ENV: &str = "TREC_PERF_MODE";
pub(crate) const DIR_ENV: &str = "TREC_PERF_DIR";
pub(crate) const INTERVAL_ENV: &str = "TREC_PERF_INTERVAL";
/// Routes instrumented calls down the block-probed clone when set to `1`.
pub(crate) const FINE_ENV: &str = "TREC_PERF_BBL";

/// Fatal initialisation failures. The caller prints these to stderr and
/// aborts; there is no degraded mode short of `none`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown TREC_PERF_MODE value `{0}`, available ones: time, cycle, insn, none")]
    BadMode(String),
    #[error("environment variable {0} is not set")]
    EnvMissing(&'static str),
    #[error("{0} exists and is not a directory")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything the probes and the flusher share, immutable after init apart
/// from the interior-mutable tables.
pub(crate) struct Runtime {
    pub(crate) mode: Mode,
    /// The dispatcher predicate's answer: route calls down the fine path?
    pub(crate) fine_path: bool,
    /// The pid at init time; a mismatch later means the program forked.
    pub(crate) pid: libc::pid_t,
    pub(crate) short_name: String,
    pub(crate) data_path: PathBuf,
    pub(crate) header: Header,
    pub(crate) histograms: Histograms,
    pub(crate) entries: EntryMap,
    pub(crate) quit: AtomicBool,
    pub(crate) fork_warned: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Build a runtime from the environment. `Ok(None)` means profiling is
    /// disabled (`TREC_PERF_MODE` unset or `none`): no thread, no tables,
    /// no files.
    pub(crate) fn from_env() -> Result<Option<Self>, RuntimeError> {
        let mode = match env::var(MODE_ENV) {
            Err(_) => return Ok(None),
            Ok(v) => Mode::from_str(&v).map_err(|_| RuntimeError::BadMode(v))?,
        };
        if mode == Mode::None {
            return Ok(None);
        }

        let dir = PathBuf::from(env::var_os(DIR_ENV).ok_or(RuntimeError::EnvMissing(DIR_ENV))?);
        if dir.exists() {
            if !dir.is_dir() {
                return Err(RuntimeError::NotADirectory(dir));
            }
        } else {
            fs::create_dir_all(&dir)?;
        }

        let step = match env::var(INTERVAL_ENV) {
            Err(_) => DEFAULT_STEP,
            Ok(v) => match v.parse::<i64>() {
                Ok(s) if s > 0 => s,
                _ => {
                    log::warning(&format!(
                        "invalid {INTERVAL_ENV} value `{v}`, defaulting to {DEFAULT_STEP}"
                    ));
                    DEFAULT_STEP
                }
            },
        };

        let pid = unsafe { libc::getpid() };
        let exe = fs::read_link("/proc/self/exe")?;
        let short_name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_owned());
        let data_path = dir.join(format!("trec_perf_{short_name}_{pid}.bin"));
        log::debug(&format!("data file: {}", data_path.display()));

        let header = Header {
            cmdline: fs::read("/proc/self/cmdline")?,
            exe: exe.as_os_str().as_bytes().to_vec(),
            cwd: fs::read_link("/proc/self/cwd")?
                .as_os_str()
                .as_bytes()
                .to_vec(),
            mode,
        };

        Ok(Some(Self {
            mode,
            fine_path: env::var(FINE_ENV).map(|v| v == "1").unwrap_or(false),
            pid,
            short_name,
            data_path,
            header,
            histograms: Histograms::new(step),
            entries: EntryMap::new(),
            quit: AtomicBool::new(false),
            fork_warned: AtomicBool::new(false),
            flusher: Mutex::new(None),
        }))
    }

    pub(crate) fn start_flusher(&'static self) {
        match std::thread::Builder::new()
            .name("trec-flusher".into())
            .spawn(move || flush::run(self))
        {
            Ok(h) => *self.flusher.lock() = Some(h),
            Err(e) => log::fatal(&format!("failed to spawn flusher: {e}")),
        }
    }

    /// Stop the flusher and wait for its final flush.
    pub(crate) fn shutdown(&self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(h) = self.flusher.lock().take() {
            h.join().ok();
        }
    }
}
