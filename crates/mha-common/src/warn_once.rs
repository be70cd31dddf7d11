//! Rate-limited warnings for conditions that repeat on hot paths.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

static WARN_REGISTRY: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn get_registry() -> &'static Mutex<HashSet<String>> {
    WARN_REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Log `message` at WARN the first time `key` is seen, at DEBUG afterwards.
pub fn warn_once_fn(key: &str, message: &str) {
    // Poisoning only means another thread panicked mid-insert; the set is still usable.
    let mut seen = match get_registry().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if seen.insert(key.to_string()) {
        log::warn!("[{key}] {message}");
    } else {
        log::debug!("[{key}] (rate-limited) {message}");
    }
}

/// Formatting front-end for [`warn_once_fn`].
#[macro_export]
macro_rules! warn_once {
    ($key:expr, $($arg:tt)*) => {
        $crate::warn_once_fn($key, &format!($($arg)*))
    };
}

/// Whether `key` has already been reported.
pub fn has_warned(key: &str) -> bool {
    match get_registry().lock() {
        Ok(guard) => guard.contains(key),
        Err(poisoned) => poisoned.into_inner().contains(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_is_recorded() {
        assert!(!has_warned("warn_once_test_a"));
        warn_once_fn("warn_once_test_a", "first");
        warn_once_fn("warn_once_test_a", "second");
        assert!(has_warned("warn_once_test_a"));
    }

    #[test]
    fn macro_formats_message() {
        let tier = "scalar";
        crate::warn_once!("warn_once_test_b", "falling back to {tier}");
        assert!(has_warned("warn_once_test_b"));
    }

    #[test]
    fn concurrent_callers_share_registry() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| warn_once_fn("warn_once_test_c", "racing")))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(has_warned("warn_once_test_c"));
    }
}
