// Copyright (C) Microsoft Corporation. All rights reserved.

//! FIPS compliance mode entry.

use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_void;
use std::ptr;

use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::native::process_module;
use crate::native::resolve;
use crate::native::NativeModule;

/// Access to the cryptographic library's compliance mode.
pub trait ComplianceModule: Send + Sync {
    /// Returns true when the library already runs in compliance mode.
    fn is_enabled(&self) -> bool;

    /// Enters compliance mode, running the power-on self tests.
    fn enable(&self) -> bool;

    /// Re-seeds the approved random generator after a library cleanup.
    fn reinit_rand(&self);
}

type FipsModeFn = unsafe extern "C" fn() -> c_int;
type FipsModeSetFn = unsafe extern "C" fn(on: c_int) -> c_int;
type RandInitFipsFn = unsafe extern "C" fn() -> c_int;
type IsFipsEnabledFn = unsafe extern "C" fn(libctx: *mut c_void) -> c_int;
type EnableFipsFn = unsafe extern "C" fn(libctx: *mut c_void, enable: c_int) -> c_int;
type ProviderLoadFn = unsafe extern "C" fn(libctx: *mut c_void, name: *const c_char) -> *mut c_void;

/// Compliance mode of the libcrypto linked into this process.
///
/// Uses the 1.x `FIPS_mode` API when exported, otherwise the 3.x default
/// property query and the `fips` provider.
pub struct OsslCompliance {
    _module: Option<Box<dyn NativeModule>>,
    fips_mode: Option<FipsModeFn>,
    fips_mode_set: Option<FipsModeSetFn>,
    rand_init_fips: Option<RandInitFipsFn>,
    is_fips_enabled: Option<IsFipsEnabledFn>,
    enable_fips: Option<EnableFipsFn>,
    provider_load: Option<ProviderLoadFn>,
}

impl OsslCompliance {
    /// Resolves the compliance entry points from the process image.
    pub fn new() -> Self {
        let module = process_module();
        let m = module.as_deref();

        // SAFETY: signatures match the libcrypto declarations.
        unsafe {
            Self {
                fips_mode: m.and_then(|m| resolve(m, c"FIPS_mode")),
                fips_mode_set: m.and_then(|m| resolve(m, c"FIPS_mode_set")),
                rand_init_fips: m.and_then(|m| resolve(m, c"RAND_init_fips")),
                is_fips_enabled: m
                    .and_then(|m| resolve(m, c"EVP_default_properties_is_fips_enabled")),
                enable_fips: m.and_then(|m| resolve(m, c"EVP_default_properties_enable_fips")),
                provider_load: m.and_then(|m| resolve(m, c"OSSL_PROVIDER_load")),
                _module: module,
            }
        }
    }
}

impl Default for OsslCompliance {
    fn default() -> Self {
        Self::new()
    }
}

impl ComplianceModule for OsslCompliance {
    fn is_enabled(&self) -> bool {
        // SAFETY: resolved with matching signatures; null selects the
        // default library context.
        unsafe {
            if let Some(fips_mode) = self.fips_mode {
                return fips_mode() != 0;
            }
            self.is_fips_enabled
                .is_some_and(|is_enabled| is_enabled(ptr::null_mut()) != 0)
        }
    }

    fn enable(&self) -> bool {
        // SAFETY: resolved with matching signatures.
        unsafe {
            if let Some(fips_mode_set) = self.fips_mode_set {
                return fips_mode_set(1) != 0;
            }

            let (Some(provider_load), Some(enable_fips)) = (self.provider_load, self.enable_fips)
            else {
                return false;
            };
            // The provider stays loaded for the life of the process.
            if provider_load(ptr::null_mut(), c"fips".as_ptr()).is_null() {
                return false;
            }
            enable_fips(ptr::null_mut(), 1) != 0
        }
    }

    fn reinit_rand(&self) {
        if let Some(rand_init_fips) = self.rand_init_fips {
            // SAFETY: resolved with a matching signature.
            unsafe { rand_init_fips() };
        }
    }
}

/// Enters compliance mode.
///
/// When the library is already compliant (factory re-creation) the self
/// tests are not repeated and only the random generator is re-initialized.
pub fn enter_compliance_mode(module: &dyn ComplianceModule) -> FactoryResult<()> {
    if module.is_enabled() {
        tracing::debug!("already in FIPS mode, skipping self tests");
        module.reinit_rand();
        return Ok(());
    }

    if !module.enable() {
        tracing::error!("can't enter into FIPS mode");
        Err(FactoryError::ComplianceMode)?;
    }

    tracing::info!("FIPS mode enabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use test_log::test;

    use super::*;

    struct FakeFips {
        enabled: AtomicBool,
        can_enable: bool,
        reinits: AtomicUsize,
    }

    impl FakeFips {
        fn new(enabled: bool, can_enable: bool) -> Self {
            Self {
                enabled: AtomicBool::new(enabled),
                can_enable,
                reinits: AtomicUsize::new(0),
            }
        }
    }

    impl ComplianceModule for FakeFips {
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn enable(&self) -> bool {
            if self.can_enable {
                self.enabled.store(true, Ordering::SeqCst);
            }
            self.can_enable
        }

        fn reinit_rand(&self) {
            self.reinits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_enter_then_reenter() {
        let fips = FakeFips::new(false, true);
        enter_compliance_mode(&fips).expect("enter");
        assert_eq!(fips.reinits.load(Ordering::SeqCst), 0);

        enter_compliance_mode(&fips).expect("reenter");
        assert_eq!(fips.reinits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enter_failure() {
        let fips = FakeFips::new(false, false);
        assert!(matches!(
            enter_compliance_mode(&fips),
            Err(FactoryError::ComplianceMode)
        ));
    }
}
