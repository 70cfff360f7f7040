//! Cost readers: the per-thread clock sources behind every probe.
//!
//! The mode is chosen once, from `TREC_PERF_MODE`, when the runtime
//! initialises, and never changes afterwards. `time` reads the monotonic
//! clock; `cycle` and `insn` read a per-thread hardware counter opened
//! through `perf_event_open(2)` on first use. Every source yields a
//! monotonically non-decreasing signed 64-bit sample within one thread.
//!
//! A thread's counter descriptor is pinned to that thread, counts user
//! space only, and is closed by the thread-local destructor when the thread
//! exits. Probes that fire after that teardown (user exit hooks on a dying
//! thread) simply lose their samples.

use crate::log;
use std::{
    cell::RefCell,
    mem::MaybeUninit,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd},
};
use strum_macros::{Display, EnumString, FromRepr};

/// The clock source, as configured by `TREC_PERF_MODE`. The discriminants
/// are the mode byte of the output header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, FromRepr)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Wall-clock nanoseconds.
    Time = 0,
    /// Reference CPU cycles.
    Cycle = 1,
    /// Retired instructions.
    Insn = 2,
    /// All probe bodies disabled.
    None = 3,
}

// From linux/perf_event.h.
const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;

/// `struct perf_event_attr`. Only the flag bits we set are named.
#[repr(C)]
#[derive(Clone, Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
    aux_sample_size: u32,
    __reserved_3: u32,
}

impl PerfEventAttr {
    const DISABLED_BIT: u64 = 1 << 0;
    // Without these two, opening the counter needs CAP_PERFMON.
    const EXCLUDE_KERNEL_BIT: u64 = 1 << 5;
    const EXCLUDE_HV_BIT: u64 = 1 << 6;

    fn new() -> Self {
        PerfEventAttr {
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            ..Default::default()
        }
    }
}

/// A per-thread hardware counter descriptor.
struct PerfCounter {
    fd: OwnedFd,
}

impl PerfCounter {
    /// Open a counter for the current thread, any CPU, user space only,
    /// reset and enabled.
    fn open(mode: Mode) -> std::io::Result<Self> {
        let mut attr = PerfEventAttr::new();
        attr.type_ = PERF_TYPE_HARDWARE;
        attr.config = match mode {
            Mode::Cycle => PERF_COUNT_HW_REF_CPU_CYCLES,
            Mode::Insn => PERF_COUNT_HW_INSTRUCTIONS,
            Mode::Time | Mode::None => unreachable!(),
        };
        attr.flags = PerfEventAttr::DISABLED_BIT
            | PerfEventAttr::EXCLUDE_KERNEL_BIT
            | PerfEventAttr::EXCLUDE_HV_BIT;

        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                libc::gettid(),
                -1 as libc::c_int, // any CPU
                -1 as libc::c_int, // no group
                0 as libc::c_ulong,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) };
        unsafe {
            libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_RESET, 0);
            libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE, 0);
        }
        Ok(Self { fd })
    }

    fn read(&self) -> i64 {
        let mut v: i64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut v as *mut i64 as *mut libc::c_void,
                std::mem::size_of::<i64>(),
            )
        };
        if n == std::mem::size_of::<i64>() as isize {
            v
        } else {
            0
        }
    }
}

impl Drop for PerfCounter {
    fn drop(&mut self) {
        unsafe { libc::ioctl(self.fd.as_raw_fd(), PERF_EVENT_IOC_DISABLE, 0) };
        // OwnedFd closes the descriptor.
    }
}

thread_local! {
    /// This thread's counter, opened lazily. The destructor disables and
    /// closes it on thread exit.
    static COUNTER: RefCell<Option<PerfCounter>> = const { RefCell::new(None) };
}

/// Read the current cost sample for `mode` on this thread. `None` means the
/// sample is lost: either the mode reads nothing, or the thread-local
/// storage is already torn down.
pub(crate) fn now(mode: Mode) -> Option<i64> {
    match mode {
        Mode::Time => Some(monotonic_ns()),
        Mode::Cycle | Mode::Insn => counter_read(mode),
        Mode::None => None,
    }
}

fn monotonic_ns() -> i64 {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) } != 0 {
        // If this fails, we have big problems, and it's probably not worth
        // trying to recover.
        panic!("failed to read clock");
    }
    let ts = unsafe { ts.assume_init() };
    ts.tv_sec * 1_000_000_000 + ts.tv_nsec
}

fn counter_read(mode: Mode) -> Option<i64> {
    COUNTER
        .try_with(|c| {
            let mut c = c.borrow_mut();
            if c.is_none() {
                match PerfCounter::open(mode) {
                    Ok(x) => *c = Some(x),
                    // A thread that cannot count cannot be profiled in this
                    // mode; carrying on would silently skew every histogram.
                    Err(e) => log::fatal(&format!("failed to open perf counter: {e}")),
                }
            }
            c.as_ref().map(|x| x.read())
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn mode_parses_env_values() {
        assert_eq!(Mode::from_str("time"), Ok(Mode::Time));
        assert_eq!(Mode::from_str("cycle"), Ok(Mode::Cycle));
        assert_eq!(Mode::from_str("insn"), Ok(Mode::Insn));
        assert_eq!(Mode::from_str("none"), Ok(Mode::None));
        assert!(Mode::from_str("wallclock").is_err());
    }

    #[test]
    fn mode_bytes_match_output_format() {
        assert_eq!(Mode::Time as u8, 0);
        assert_eq!(Mode::Cycle as u8, 1);
        assert_eq!(Mode::Insn as u8, 2);
        assert_eq!(Mode::from_repr(1), Some(Mode::Cycle));
        assert_eq!(Mode::from_repr(200), None);
    }

    #[test]
    fn time_samples_do_not_decrease() {
        let a = now(Mode::Time).unwrap();
        let b = now(Mode::Time).unwrap();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn none_mode_reads_nothing() {
        assert_eq!(now(Mode::None), None);
    }
}
