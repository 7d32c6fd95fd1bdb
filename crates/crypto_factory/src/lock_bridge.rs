// Copyright (C) Microsoft Corporation. All rights reserved.

//! Locking callback bridge for libcrypto builds without intrinsic thread
//! safety (OpenSSL before 1.1.0 and LibreSSL).
//!
//! The library calls a process-wide `(mode, index, file, line)` callback; the
//! bridge backs every index with a raw mutex from a fixed-size pool.

use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::CStr;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use parking_lot::RwLock;

use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::native::process_module;
use crate::native::resolve;
use crate::native::NativeModule;

/// Mode flag: acquire the lock.
pub const CRYPTO_LOCK: c_int = 1;
/// Mode flag: release the lock.
pub const CRYPTO_UNLOCK: c_int = 2;
/// Mode flag: read access.
pub const CRYPTO_READ: c_int = 4;
/// Mode flag: write access.
pub const CRYPTO_WRITE: c_int = 8;

/// Signature of the legacy libcrypto locking callback.
pub type LockingCallback =
    unsafe extern "C" fn(mode: c_int, n: c_int, file: *const c_char, line: c_int);

/// Access to the cryptographic library's locking callback registry.
pub trait LockingHost: Send + Sync {
    /// Returns true when the library serializes its own global state.
    fn is_thread_safe(&self) -> bool;

    /// Number of locks the library expects the callback to serve.
    fn num_locks(&self) -> i64;

    /// Currently installed callback, if any.
    fn locking_callback(&self) -> Option<LockingCallback>;

    /// Installs or clears the callback.
    fn set_locking_callback(&self, callback: Option<LockingCallback>);
}

type NumLocksFn = unsafe extern "C" fn() -> c_int;
type GetLockingCallbackFn = unsafe extern "C" fn() -> Option<LockingCallback>;
type SetLockingCallbackFn = unsafe extern "C" fn(Option<LockingCallback>);

struct LegacyLockingApi {
    _module: Box<dyn NativeModule>,
    num_locks: NumLocksFn,
    get_callback: GetLockingCallbackFn,
    set_callback: SetLockingCallbackFn,
}

/// Locking host for the libcrypto linked into this process.
pub struct OsslLockingHost {
    legacy: Option<LegacyLockingApi>,
}

impl OsslLockingHost {
    /// Detects whether the linked libcrypto needs a locking callback.
    pub fn new() -> Self {
        let is_libressl = openssl::version::version().starts_with("LibreSSL");
        if openssl::version::number() >= 0x1010_0000 && !is_libressl {
            return Self { legacy: None };
        }

        let legacy = process_module().and_then(|module| {
            // SAFETY: signatures match the pre-1.1.0 libcrypto declarations.
            unsafe {
                let num_locks = resolve::<NumLocksFn>(&*module, c"CRYPTO_num_locks")?;
                let get_callback =
                    resolve::<GetLockingCallbackFn>(&*module, c"CRYPTO_get_locking_callback")?;
                let set_callback =
                    resolve::<SetLockingCallbackFn>(&*module, c"CRYPTO_set_locking_callback")?;
                Some(LegacyLockingApi {
                    _module: module,
                    num_locks,
                    get_callback,
                    set_callback,
                })
            }
        });

        if legacy.is_none() {
            tracing::warn!("legacy libcrypto detected but locking entry points are missing");
        }
        Self { legacy }
    }
}

impl Default for OsslLockingHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LockingHost for OsslLockingHost {
    fn is_thread_safe(&self) -> bool {
        self.legacy.is_none()
    }

    fn num_locks(&self) -> i64 {
        self.legacy
            .as_ref()
            // SAFETY: resolved from libcrypto with a matching signature.
            .map(|api| i64::from(unsafe { (api.num_locks)() }))
            .unwrap_or(0)
    }

    fn locking_callback(&self) -> Option<LockingCallback> {
        // SAFETY: resolved from libcrypto with a matching signature.
        self.legacy
            .as_ref()
            .and_then(|api| unsafe { (api.get_callback)() })
    }

    fn set_locking_callback(&self, callback: Option<LockingCallback>) {
        if let Some(api) = self.legacy.as_ref() {
            // SAFETY: resolved from libcrypto with a matching signature.
            unsafe { (api.set_callback)(callback) }
        }
    }
}

/// Fixed-size pool of exclusive sections indexed by the library.
pub struct LockPool {
    locks: Box<[RawMutex]>,
}

impl LockPool {
    /// Allocates `count` unlocked mutexes.
    pub fn new(count: usize) -> FactoryResult<Self> {
        let mut locks = Vec::new();
        locks
            .try_reserve_exact(count)
            .map_err(|_| FactoryError::LockPoolAllocation(count))?;
        locks.extend((0..count).map(|_| RawMutex::INIT));

        Ok(Self {
            locks: locks.into_boxed_slice(),
        })
    }

    /// Number of locks in the pool.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if the pool holds no locks.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Acquires or releases lock `index` according to `mode`.
    ///
    /// Returns false, touching nothing, when `index` is outside the pool.
    pub fn apply(&self, mode: c_int, index: c_int) -> bool {
        let Some(lock) = usize::try_from(index).ok().and_then(|i| self.locks.get(i)) else {
            return false;
        };

        if mode & CRYPTO_LOCK != 0 {
            lock.lock();
        } else if lock.is_locked() {
            // SAFETY: libcrypto pairs every unlock with a preceding lock on
            // the same index.
            unsafe { lock.unlock() };
        } else {
            tracing::warn!("release of unheld lock {index}");
        }
        true
    }
}

lazy_static! {
    static ref LOCK_POOL: RwLock<Option<Arc<LockPool>>> = RwLock::new(None);
}

unsafe extern "C" fn lock_callback(mode: c_int, n: c_int, file: *const c_char, line: c_int) {
    let Some(pool) = LOCK_POOL.read().clone() else {
        tracing::error!("locking callback invoked without a lock pool");
        return;
    };

    if !pool.apply(mode, n) {
        let file = if file.is_null() {
            "<unknown>".into()
        } else {
            // SAFETY: libcrypto passes __FILE__, a NUL terminated literal.
            unsafe { CStr::from_ptr(file) }.to_string_lossy()
        };
        tracing::error!(
            "out of range [0..{}[ lock {} at {}:{}",
            pool.len(),
            n,
            file,
            line
        );
    }
}

/// Who owns the library's locking callback slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    /// No callback is installed.
    NotInstalled,

    /// This bridge installed its callback and must remove it.
    InstalledByUs,

    /// Another component's callback was found and is left alone.
    InstalledByOther,
}

/// Owns the lock pool and, possibly, the library's locking callback.
pub struct LockBridge {
    host: Arc<dyn LockingHost>,
    pool: Option<Arc<LockPool>>,
    state: CallbackState,
}

impl LockBridge {
    /// Sizes the pool and installs the callback unless one is present.
    ///
    /// Thread-safe library builds get an inert bridge.
    pub fn setup(host: Arc<dyn LockingHost>) -> FactoryResult<Self> {
        if host.is_thread_safe() {
            tracing::debug!("libcrypto is thread safe, locking callback not needed");
            return Ok(Self {
                host,
                pool: None,
                state: CallbackState::NotInstalled,
            });
        }

        let count = host.num_locks();
        let size = usize::try_from(count)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(FactoryError::LockPoolSize(count))?;
        let pool = Arc::new(LockPool::new(size)?);
        *LOCK_POOL.write() = Some(pool.clone());

        let state = if host.locking_callback().is_none() {
            host.set_locking_callback(Some(lock_callback));
            CallbackState::InstalledByUs
        } else {
            tracing::info!("locking callback already installed, leaving it in place");
            CallbackState::InstalledByOther
        };

        tracing::debug!("lock bridge ready with {size} locks ({state:?})");
        Ok(Self {
            host,
            pool: Some(pool),
            state,
        })
    }

    /// Callback ownership state.
    pub fn state(&self) -> CallbackState {
        self.state
    }

    /// Pool size, zero for an inert bridge.
    pub fn pool_size(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.len())
    }

    /// Removes our callback (if ours) and then releases the pool.
    ///
    /// The callback is only removed while it is still ours and the global
    /// pool is still this bridge's; a newer bridge or a replacement
    /// callback is left in place.
    pub fn teardown(&mut self) {
        let mut global = LOCK_POOL.write();
        let owns_pool = match (&self.pool, global.as_ref()) {
            (Some(pool), Some(current)) => Arc::ptr_eq(pool, current),
            _ => false,
        };

        if self.state == CallbackState::InstalledByUs {
            let ours = self
                .host
                .locking_callback()
                .is_some_and(|cb| cb as usize == lock_callback as usize);
            if ours && owns_pool {
                self.host.set_locking_callback(None);
            } else {
                tracing::warn!("locking callback changed hands after setup, leaving it in place");
            }
            self.state = CallbackState::NotInstalled;
        }

        if self.pool.take().is_some() && owns_pool {
            *global = None;
        }
    }
}

impl Drop for LockBridge {
    fn drop(&mut self) {
        self.teardown();
    }
}
