//! Cooperative interruption of the supervision loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::warn;

static SIGNAL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_: libc::c_int) {
    if let Some(flag) = SIGNAL_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Installs `on_signal` without `SA_RESTART`, so blocking calls return `EINTR` and the
/// waiting loop gets to look at the flag.
fn install_handler(signal: libc::c_int) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as *const () as libc::sighandler_t;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            warn!("failed to install handler for signal {}", signal);
        }
    }
}

/// Shared flag checked by the loops at every suspension point.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide token raised by SIGINT and SIGTERM, installing the handlers
    /// on first use.
    pub fn install() -> Self {
        let flag = SIGNAL_FLAG.get_or_init(|| {
            let flag = Arc::new(AtomicBool::new(false));
            for signal in [libc::SIGINT, libc::SIGTERM] {
                install_handler(signal);
            }
            flag
        });
        Self { flag: flag.clone() }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let a = Interrupt::new();
        let b = a.clone();
        assert!(!b.is_set());
        a.trigger();
        assert!(b.is_set());
        assert!(!Interrupt::new().is_set());
    }

    #[test]
    fn test_signal_raises_installed_token() {
        let token = Interrupt::install();
        let local = Interrupt::new();
        unsafe {
            libc::raise(libc::SIGINT);
        }
        assert!(token.is_set());
        assert!(Interrupt::install().is_set());
        assert!(!local.is_set());
    }
}
