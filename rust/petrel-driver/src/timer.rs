//! Windows high-resolution timer lifecycle.
//!
//! Park-based idle strategies are only as fine-grained as the OS timer. On
//! Windows the driver can raise the system timer resolution for its
//! lifetime; the guard tracks whether *this* driver raised it and only
//! lowers it again on close if so. One driver per process is the supported
//! arrangement. On other platforms the whole module is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide flag: has the timer already been raised (by us or an earlier
/// driver in this process)?
static TIMER_ENABLED: AtomicBool = AtomicBool::new(false);

/// Guard over the raised timer resolution.
pub struct HighResTimerGuard {
    enabled_here: bool,
}

impl HighResTimerGuard {
    /// Raise the timer resolution if it is not already raised.
    pub fn enable() -> Self {
        let was_enabled = TIMER_ENABLED.swap(true, Ordering::AcqRel);
        if !was_enabled {
            platform::enable();
        }
        Self {
            enabled_here: !was_enabled,
        }
    }

    /// A guard that does nothing, for configurations that leave the timer
    /// alone.
    pub fn disabled() -> Self {
        Self {
            enabled_here: false,
        }
    }

    /// Whether this guard is the one holding the resolution up.
    pub fn is_owner(&self) -> bool {
        self.enabled_here
    }
}

impl Drop for HighResTimerGuard {
    fn drop(&mut self) {
        if self.enabled_here {
            platform::disable();
            TIMER_ENABLED.store(false, Ordering::Release);
        }
    }
}

#[cfg(windows)]
mod platform {
    use windows_sys::Win32::Media::{timeBeginPeriod, timeEndPeriod};

    const RESOLUTION_MS: u32 = 1;

    pub fn enable() {
        unsafe {
            timeBeginPeriod(RESOLUTION_MS);
        }
    }

    pub fn disable() {
        unsafe {
            timeEndPeriod(RESOLUTION_MS);
        }
    }
}

#[cfg(not(windows))]
mod platform {
    pub fn enable() {}
    pub fn disable() {}
}
