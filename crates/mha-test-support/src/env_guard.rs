//! RAII restoration of process environment variables in tests.
//!
//! Guards serialise on an in-process mutex; tests must additionally carry
//! `#[serial(mha_env)]` so that env-reading tests in the same binary never
//! observe a half-applied override.
//!
//! ```rust,ignore
//! #[test]
//! #[serial(mha_env)]
//! fn scalar_only_host() {
//!     let mut env = EnvScope::new();
//!     env.set("MHA_FORCE_ISA", "scalar");
//!     env.remove("MHA_STRICT_PROBE");
//!     // ... every variable is restored when `env` drops
//! }
//! ```

use std::collections::HashMap;
use std::env;
use std::sync::{Mutex, MutexGuard, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

/// Guards a single variable; restores its original value on drop.
///
/// Holds the non-reentrant env lock for its whole lifetime, so use
/// [`EnvScope`] when a test needs several variables.
#[derive(Debug)]
pub struct EnvGuard {
    key: String,
    old: Option<String>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    pub fn new(key: &str) -> Self {
        let lock = env_lock();
        Self { key: key.to_string(), old: env::var(key).ok(), _lock: lock }
    }

    pub fn set(&self, val: &str) {
        // SAFETY: ENV_LOCK is held and callers are `#[serial(mha_env)]`.
        unsafe { env::set_var(&self.key, val) };
    }

    pub fn remove(&self) {
        // SAFETY: as in `set`.
        unsafe { env::remove_var(&self.key) };
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn original_value(&self) -> Option<&str> {
        self.old.as_deref()
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        // SAFETY: ENV_LOCK is still held through `_lock`.
        unsafe {
            match &self.old {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }
}

/// Takes the env lock once and restores every touched variable on drop.
pub struct EnvScope {
    _lock: MutexGuard<'static, ()>,
    saved: HashMap<String, Option<String>>,
}

impl EnvScope {
    pub fn new() -> Self {
        Self { _lock: env_lock(), saved: HashMap::new() }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.saved.entry(key.to_string()).or_insert_with(|| env::var(key).ok());
        // SAFETY: ENV_LOCK is held for the scope's lifetime.
        unsafe { env::set_var(key, value) };
    }

    pub fn remove(&mut self, key: &str) {
        self.saved.entry(key.to_string()).or_insert_with(|| env::var(key).ok());
        // SAFETY: ENV_LOCK is held for the scope's lifetime.
        unsafe { env::remove_var(key) };
    }
}

impl Default for EnvScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EnvScope {
    fn drop(&mut self) {
        for (key, original) in &self.saved {
            // SAFETY: ENV_LOCK is still held through `_lock`.
            unsafe {
                match original {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(mha_env)]
    fn guard_restores_unset_variable() {
        let key = "MHA_TEST_GUARD_UNSET";
        {
            let guard = EnvGuard::new(key);
            assert_eq!(guard.original_value(), None);
            guard.set("4");
            assert_eq!(env::var(key).unwrap(), "4");
        }
        assert!(env::var(key).is_err());
    }

    #[test]
    #[serial(mha_env)]
    fn scope_restores_every_variable() {
        let (a, b) = ("MHA_TEST_SCOPE_A", "MHA_TEST_SCOPE_B");
        // SAFETY: serialized on `mha_env`.
        unsafe {
            env::set_var(a, "original");
            env::set_var(b, "keep");
        }
        {
            let mut scope = EnvScope::new();
            scope.set(a, "changed");
            scope.set(a, "changed again");
            scope.remove(b);
            assert_eq!(env::var(a).unwrap(), "changed again");
            assert!(env::var(b).is_err());
        }
        assert_eq!(env::var(a).unwrap(), "original");
        assert_eq!(env::var(b).unwrap(), "keep");
        // SAFETY: as above.
        unsafe {
            env::remove_var(a);
            env::remove_var(b);
        }
    }
}
