use std::sync::atomic::{AtomicBool, Ordering};

use crate::config;

static ENABLED: AtomicBool = AtomicBool::new(true);

pub(crate) enum RuntimeWarning<'a> {
    DroppedHandle(&'a str),
    BlockingCall(&'a str, &'a str),
    DeadlockTimeout(&'a str, f64),
}

impl<'a> RuntimeWarning<'a> {
    #[allow(dead_code)]
    pub(crate) fn enable_warnings() {
        ENABLED.store(true, Ordering::Relaxed);
    }
    #[allow(dead_code)]
    pub(crate) fn disable_warnings() {
        ENABLED.store(false, Ordering::Relaxed);
    }

    fn print_warning(&self) -> bool {
        if ENABLED.load(Ordering::Relaxed) {
            match self {
                RuntimeWarning::DroppedHandle(_) => {
                    config().dropped_handle_warning.unwrap_or(true)
                }
                RuntimeWarning::BlockingCall(_, _) => true,
                RuntimeWarning::DeadlockTimeout(_, _) => true,
            }
        } else {
            false
        }
    }

    pub(crate) fn print(self) {
        if self.print_warning() {
            let msg = match self {
                RuntimeWarning::DroppedHandle(what) => {
                    format!("[DART WARNING] You are dropping {what} that has not been waited on or tested to completion.
                    The operation is completed before the handle is released. Set DART_DROPPED_HANDLE_WARNING=false to disable this warning.")
                }
                RuntimeWarning::BlockingCall(func, alternative) => {
                    format!("[DART WARNING] You are calling {func} from within a task, this may result in deadlock!
                    Using '{alternative}' is likely a better choice.")
                }
                RuntimeWarning::DeadlockTimeout(op, elapsed) => {
                    format!("[DART WARNING][{:?}] {op} has been waiting for {elapsed:.1} seconds. Potential deadlock detected.
                    {op} is a collective operation requiring every member of the team to enter it.
                    The deadlock timeout can be set via the DART_DEADLOCK_TIMEOUT environment variable, setting this to 0 will disable this warning.",
                        std::thread::current().id())
                }
            };
            tracing::warn!("{}", msg);
            eprintln!(
                "{msg}
                Note that this warning is informative only, and will not terminate your application.
                To view backtrace set RUST_LIB_BACKTRACE=1.
                {}",
                std::backtrace::Backtrace::capture()
            );
        }
    }
}

/// Tracks how long a collective has been waiting and reports a
/// [RuntimeWarning::DeadlockTimeout] each time the timeout elapses.
pub(crate) struct DeadlockTimer {
    op: &'static str,
    timeout: f64,
    start: std::time::Instant,
    last: std::time::Instant,
}

impl DeadlockTimer {
    pub(crate) fn new(op: &'static str, timeout: f64) -> Self {
        let now = std::time::Instant::now();
        DeadlockTimer {
            op,
            timeout,
            start: now,
            last: now,
        }
    }

    /// Returns true when a warning was emitted.
    pub(crate) fn check(&mut self) -> bool {
        if self.timeout > 0.0 && self.last.elapsed().as_secs_f64() > self.timeout {
            RuntimeWarning::DeadlockTimeout(self.op, self.start.elapsed().as_secs_f64()).print();
            self.last = std::time::Instant::now();
            true
        } else {
            false
        }
    }
}
