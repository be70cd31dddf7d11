//! Scoped thread-count override.
//!
//! The active setting is dynamically scoped to the calling thread: it applies
//! to every kernel descriptor created (and hence every kernel executed) while
//! an [`NThreadGuard`] is alive, and the previous value comes back when the
//! guard drops, including during unwinding.
//!
//! Descriptors created on another thread do not see the override; every
//! thread starts with none set.

use crate::config::RuntimeConfig;
use crate::{MhaError, Result};
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static ACTIVE_N_THREAD: Cell<Option<usize>> = const { Cell::new(None) };
}

/// RAII guard returned by [`with_n_thread`].
///
/// Not `Send`: the override belongs to the thread that installed it.
#[derive(Debug)]
#[must_use = "the override is reverted as soon as the guard is dropped"]
pub struct NThreadGuard {
    previous: Option<usize>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for NThreadGuard {
    fn drop(&mut self) {
        ACTIVE_N_THREAD.with(|c| c.set(self.previous));
    }
}

/// Override the thread count until the returned guard drops.
///
/// `0` selects the implementation default; negative counts are rejected.
pub fn with_n_thread(n: i32) -> Result<NThreadGuard> {
    if n < 0 {
        return Err(MhaError::illegal_configuration(format!(
            "thread count must be >= 0, got {n}"
        )));
    }
    let requested = if n == 0 { None } else { Some(n as usize) };
    let previous = ACTIVE_N_THREAD.with(|c| c.replace(requested));
    Ok(NThreadGuard { previous, _not_send: PhantomData })
}

/// Closure form of [`with_n_thread`].
pub fn with_n_thread_scope<T>(n: i32, f: impl FnOnce() -> T) -> Result<T> {
    let _guard = with_n_thread(n)?;
    Ok(f())
}

/// The explicit override active on this thread, if any.
pub fn n_thread_override() -> Option<usize> {
    ACTIVE_N_THREAD.with(Cell::get)
}

/// Thread count in effect: the active override, else the configured default.
pub fn current_n_thread() -> usize {
    n_thread_override().unwrap_or_else(|| RuntimeConfig::from_env().resolved_threads())
}
