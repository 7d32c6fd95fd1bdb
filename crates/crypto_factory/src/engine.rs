// Copyright (C) Microsoft Corporation. All rights reserved.

//! Optional libcrypto engines: the hardware RNG accelerator and the
//! alternate (GOST) cipher suite.
//!
//! The ENGINE API is not wrapped by the `openssl` crate, so the entry points
//! are resolved from the process image at run time. Builds of libcrypto
//! without engine support simply report every engine as unavailable.

use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_uint;
use std::ffi::c_void;
use std::ffi::CStr;
use std::ffi::CString;
use std::ptr;
use std::ptr::NonNull;
use std::sync::Arc;

use foreign_types::ForeignType;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;

use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::native::process_module;
use crate::native::resolve;
use crate::native::NativeModule;

/// `ENGINE_METHOD_RAND`
pub const ENGINE_METHOD_RAND: c_uint = 0x0008;

/// `OPENSSL_INIT_LOAD_CRYPTO_STRINGS`
pub const OPENSSL_INIT_LOAD_CRYPTO_STRINGS: u64 = 0x0000_0002;
/// `OPENSSL_INIT_ADD_ALL_CIPHERS`
pub const OPENSSL_INIT_ADD_ALL_CIPHERS: u64 = 0x0000_0004;
/// `OPENSSL_INIT_ADD_ALL_DIGESTS`
pub const OPENSSL_INIT_ADD_ALL_DIGESTS: u64 = 0x0000_0008;
/// `OPENSSL_INIT_LOAD_CONFIG`
pub const OPENSSL_INIT_LOAD_CONFIG: u64 = 0x0000_0040;
/// `OPENSSL_INIT_ENGINE_RDRAND`
pub const OPENSSL_INIT_ENGINE_RDRAND: u64 = 0x0000_0200;
/// `OPENSSL_INIT_ENGINE_ALL_BUILTIN`
pub const OPENSSL_INIT_ENGINE_ALL_BUILTIN: u64 = 0x0000_7600;

/// GOST R 34.11-94 digest
pub const NID_ID_GOSTR3411_94: c_int = 809;
/// GOST R 34.10-2001 signature key
pub const NID_ID_GOSTR3410_2001: c_int = 811;

/// Engine id of the hardware RNG accelerator.
pub const RDRAND_ENGINE_ID: &CStr = c"rdrand";

/// Engine id of the GOST suite.
pub const GOST_ENGINE_ID: &CStr = c"gost";
/// GOST parameter control command.
pub const GOST_CTRL_CMD: &CStr = c"CRYPT_PARAMS";
/// GOST parameter set applied at bring-up.
pub const GOST_CTRL_ARG: &CStr = c"id-Gost28147-89-CryptoPro-A-ParamSet";

/// Reference to an `ENGINE` inside libcrypto's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineRef(NonNull<c_void>);

// SAFETY: ENGINE objects are reference counted and internally locked.
unsafe impl Send for EngineRef {}
unsafe impl Sync for EngineRef {}

impl EngineRef {
    /// Wraps a raw `ENGINE *`.
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Raw `ENGINE *`.
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Reference to an `EVP_MD` owned by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestRef(NonNull<c_void>);

// SAFETY: EVP_MD method tables are immutable once registered.
unsafe impl Send for DigestRef {}
unsafe impl Sync for DigestRef {}

impl DigestRef {
    /// Wraps a raw `const EVP_MD *`.
    pub fn new(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr.cast_mut()).map(Self)
    }

    /// Raw `const EVP_MD *`.
    pub fn as_ptr(self) -> *const c_void {
        self.0.as_ptr()
    }
}

/// libcrypto ENGINE operations used by the factory.
pub trait EngineApi: Send + Sync {
    /// Loads builtin engines selected by `OPENSSL_INIT_*` flags.
    fn load_builtin_engines(&self, flags: u64) -> bool;

    /// Looks up an engine by id, returning a structural reference.
    fn by_id(&self, id: &CStr) -> Option<EngineRef>;

    /// Takes a functional reference.
    fn init(&self, engine: EngineRef) -> bool;

    /// Makes the engine the default for `methods`.
    fn set_default(&self, engine: EngineRef, methods: c_uint) -> bool;

    /// Fetches a digest implemented by the engine.
    fn digest(&self, engine: EngineRef, nid: c_int) -> Option<DigestRef>;

    /// Registers the engine's ASN.1 key methods.
    fn register_pkey_asn1_meths(&self, engine: EngineRef) -> bool;

    /// Sends a control command string.
    fn ctrl_cmd_string(&self, engine: EngineRef, cmd: &CStr, arg: &CStr) -> bool;

    /// Releases a functional reference.
    fn finish(&self, engine: EngineRef);

    /// Releases a structural reference.
    fn free(&self, engine: EngineRef);

    /// Generates a key of type `nid` through the engine.
    fn keygen(
        &self,
        engine: EngineRef,
        nid: c_int,
        params: &[(&CStr, &CStr)],
    ) -> FactoryResult<PKey<Private>>;
}

type InitCryptoFn = unsafe extern "C" fn(opts: u64, settings: *const c_void) -> c_int;
type LoadFn = unsafe extern "C" fn();
type ByIdFn = unsafe extern "C" fn(id: *const c_char) -> *mut c_void;
type EngineIntFn = unsafe extern "C" fn(e: *mut c_void) -> c_int;
type SetDefaultFn = unsafe extern "C" fn(e: *mut c_void, flags: c_uint) -> c_int;
type GetDigestFn = unsafe extern "C" fn(e: *mut c_void, nid: c_int) -> *const c_void;
type CtrlCmdStringFn =
    unsafe extern "C" fn(e: *mut c_void, cmd: *const c_char, arg: *const c_char, opt: c_int) -> c_int;
type CtxCtrlStrFn =
    unsafe extern "C" fn(ctx: *mut openssl_sys::EVP_PKEY_CTX, t: *const c_char, v: *const c_char) -> c_int;

/// ENGINE API of the libcrypto linked into this process.
pub struct OsslEngineApi {
    _module: Option<Box<dyn NativeModule>>,
    init_crypto: Option<InitCryptoFn>,
    load_builtin: Option<LoadFn>,
    load_rdrand: Option<LoadFn>,
    by_id: Option<ByIdFn>,
    init: Option<EngineIntFn>,
    finish: Option<EngineIntFn>,
    free: Option<EngineIntFn>,
    set_default: Option<SetDefaultFn>,
    get_digest: Option<GetDigestFn>,
    register_asn1: Option<EngineIntFn>,
    ctrl_cmd_string: Option<CtrlCmdStringFn>,
    ctx_ctrl_str: Option<CtxCtrlStrFn>,
}

impl OsslEngineApi {
    /// Resolves the ENGINE entry points from the process image.
    pub fn new() -> Self {
        let module = process_module();
        let m = module.as_deref();

        // SAFETY: signatures match the libcrypto declarations.
        let api = unsafe {
            Self {
                init_crypto: m.and_then(|m| resolve(m, c"OPENSSL_init_crypto")),
                load_builtin: m.and_then(|m| resolve(m, c"ENGINE_load_builtin_engines")),
                load_rdrand: m.and_then(|m| resolve(m, c"ENGINE_load_rdrand")),
                by_id: m.and_then(|m| resolve(m, c"ENGINE_by_id")),
                init: m.and_then(|m| resolve(m, c"ENGINE_init")),
                finish: m.and_then(|m| resolve(m, c"ENGINE_finish")),
                free: m.and_then(|m| resolve(m, c"ENGINE_free")),
                set_default: m.and_then(|m| resolve(m, c"ENGINE_set_default")),
                get_digest: m.and_then(|m| resolve(m, c"ENGINE_get_digest")),
                register_asn1: m.and_then(|m| resolve(m, c"ENGINE_register_pkey_asn1_meths")),
                ctrl_cmd_string: m.and_then(|m| resolve(m, c"ENGINE_ctrl_cmd_string")),
                ctx_ctrl_str: m.and_then(|m| resolve(m, c"EVP_PKEY_CTX_ctrl_str")),
                _module: module,
            }
        };

        if api.by_id.is_none() {
            tracing::debug!("libcrypto was built without ENGINE support");
        }
        api
    }
}

impl Default for OsslEngineApi {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineApi for OsslEngineApi {
    fn load_builtin_engines(&self, flags: u64) -> bool {
        // SAFETY: resolved with matching signatures.
        unsafe {
            if let Some(init_crypto) = self.init_crypto {
                return init_crypto(flags, ptr::null()) == 1;
            }
            if flags == OPENSSL_INIT_ENGINE_RDRAND {
                if let Some(load_rdrand) = self.load_rdrand {
                    load_rdrand();
                    return true;
                }
            }
            match self.load_builtin {
                Some(load_builtin) => {
                    load_builtin();
                    true
                }
                None => false,
            }
        }
    }

    fn by_id(&self, id: &CStr) -> Option<EngineRef> {
        let by_id = self.by_id?;
        // SAFETY: id is NUL terminated.
        EngineRef::new(unsafe { by_id(id.as_ptr()) })
    }

    fn init(&self, engine: EngineRef) -> bool {
        // SAFETY: engine is a live structural reference.
        self.init
            .is_some_and(|init| unsafe { init(engine.as_ptr()) } > 0)
    }

    fn set_default(&self, engine: EngineRef, methods: c_uint) -> bool {
        // SAFETY: engine holds a functional reference.
        self.set_default
            .is_some_and(|set_default| unsafe { set_default(engine.as_ptr(), methods) } > 0)
    }

    fn digest(&self, engine: EngineRef, nid: c_int) -> Option<DigestRef> {
        let get_digest = self.get_digest?;
        // SAFETY: engine holds a functional reference.
        DigestRef::new(unsafe { get_digest(engine.as_ptr(), nid) })
    }

    fn register_pkey_asn1_meths(&self, engine: EngineRef) -> bool {
        // SAFETY: engine holds a functional reference.
        self.register_asn1
            .is_some_and(|register| unsafe { register(engine.as_ptr()) } > 0)
    }

    fn ctrl_cmd_string(&self, engine: EngineRef, cmd: &CStr, arg: &CStr) -> bool {
        // SAFETY: engine holds a functional reference; strings are NUL terminated.
        self.ctrl_cmd_string.is_some_and(|ctrl| unsafe {
            ctrl(engine.as_ptr(), cmd.as_ptr(), arg.as_ptr(), 0) > 0
        })
    }

    fn finish(&self, engine: EngineRef) {
        if let Some(finish) = self.finish {
            // SAFETY: releases the functional reference taken by `init`.
            unsafe { finish(engine.as_ptr()) };
        }
    }

    fn free(&self, engine: EngineRef) {
        if let Some(free) = self.free {
            // SAFETY: releases the structural reference from `by_id`.
            unsafe { free(engine.as_ptr()) };
        }
    }

    fn keygen(
        &self,
        engine: EngineRef,
        nid: c_int,
        params: &[(&CStr, &CStr)],
    ) -> FactoryResult<PKey<Private>> {
        struct CtxGuard(*mut openssl_sys::EVP_PKEY_CTX);
        impl Drop for CtxGuard {
            fn drop(&mut self) {
                // SAFETY: allocated by EVP_PKEY_CTX_new_id.
                unsafe { openssl_sys::EVP_PKEY_CTX_free(self.0) }
            }
        }

        // SAFETY: engine holds a functional reference.
        let ctx = unsafe { openssl_sys::EVP_PKEY_CTX_new_id(nid, engine.as_ptr().cast()) };
        if ctx.is_null() {
            Err(openssl::error::ErrorStack::get())?;
        }
        let ctx = CtxGuard(ctx);

        // SAFETY: ctx is a live keygen context for the duration of the block.
        unsafe {
            if openssl_sys::EVP_PKEY_keygen_init(ctx.0) <= 0 {
                Err(openssl::error::ErrorStack::get())?;
            }
            for (name, value) in params {
                let applied = self
                    .ctx_ctrl_str
                    .is_some_and(|ctrl| ctrl(ctx.0, name.as_ptr(), value.as_ptr()) > 0);
                if !applied {
                    Err(FactoryError::InvalidParameter(format!(
                        "key parameter {}={}",
                        name.to_string_lossy(),
                        value.to_string_lossy()
                    )))?;
                }
            }

            let mut pkey = ptr::null_mut();
            if openssl_sys::EVP_PKEY_keygen(ctx.0, &mut pkey) <= 0 || pkey.is_null() {
                Err(openssl::error::ErrorStack::get())?;
            }
            Ok(PKey::from_ptr(pkey))
        }
    }
}

/// RAII owner of an engine's structural and functional references.
pub struct EngineHandle {
    api: Arc<dyn EngineApi>,
    engine: EngineRef,
    id: String,
    initialized: bool,
}

impl EngineHandle {
    /// Looks up `id` and takes a structural reference.
    pub fn by_id(api: Arc<dyn EngineApi>, id: &CStr) -> FactoryResult<Self> {
        let id_str = id.to_string_lossy().into_owned();
        let engine = api.by_id(id).ok_or_else(|| {
            tracing::warn!("can't get the {id_str} engine");
            FactoryError::EngineUnavailable(id_str.clone())
        })?;

        Ok(Self {
            api,
            engine,
            id: id_str,
            initialized: false,
        })
    }

    /// Takes the functional reference.
    pub fn init(&mut self) -> FactoryResult<()> {
        if !self.api.init(self.engine) {
            return Err(self.step_failed("initialize"));
        }
        self.initialized = true;
        Ok(())
    }

    /// Engine id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw engine reference.
    pub fn engine(&self) -> EngineRef {
        self.engine
    }

    /// Engine API the handle was created from.
    pub fn api(&self) -> &dyn EngineApi {
        self.api.as_ref()
    }

    fn step_failed(&self, step: &'static str) -> FactoryError {
        tracing::warn!("can't {step} the {} engine", self.id);
        FactoryError::EngineStep {
            engine: self.id.clone(),
            step,
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.initialized {
            self.api.finish(self.engine);
        }
        self.api.free(self.engine);
        tracing::debug!("released the {} engine", self.id);
    }
}

/// Hardware random generator acceleration (`rdrand`).
pub struct HardwareRngEngine {
    handle: EngineHandle,
}

impl HardwareRngEngine {
    /// Loads the accelerator and makes it the default RAND method.
    pub fn attach(api: Arc<dyn EngineApi>) -> FactoryResult<Self> {
        if !api.load_builtin_engines(OPENSSL_INIT_ENGINE_RDRAND) {
            tracing::debug!("could not load the builtin rdrand engine");
        }

        let mut handle = EngineHandle::by_id(api, RDRAND_ENGINE_ID)?;
        handle.init()?;
        if !handle.api().set_default(handle.engine(), ENGINE_METHOD_RAND) {
            return Err(handle.step_failed("set default RAND for"));
        }

        tracing::info!("using the rdrand engine for random generation");
        Ok(Self { handle })
    }

    /// Engine id.
    pub fn id(&self) -> &str {
        self.handle.id()
    }
}

/// Alternate suite engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltEngineConfig {
    /// Engine id
    pub id: CString,
    /// Control command applied after registration
    pub control: Option<(CString, CString)>,
}

impl AltEngineConfig {
    /// Configuration for the GOST engine with CryptoPro-A parameters.
    pub fn gost() -> Self {
        Self {
            id: GOST_ENGINE_ID.to_owned(),
            control: Some((GOST_CTRL_CMD.to_owned(), GOST_CTRL_ARG.to_owned())),
        }
    }
}

/// Live alternate cipher-suite engine.
pub struct AltSuiteEngine {
    handle: EngineHandle,
    digest: DigestRef,
}

impl AltSuiteEngine {
    /// Locates, initializes, registers and configures the engine.
    ///
    /// Any failed step releases the engine before returning.
    pub fn attach(api: Arc<dyn EngineApi>, config: &AltEngineConfig) -> FactoryResult<Self> {
        let flags = OPENSSL_INIT_ENGINE_ALL_BUILTIN
            | OPENSSL_INIT_ENGINE_RDRAND
            | OPENSSL_INIT_LOAD_CRYPTO_STRINGS
            | OPENSSL_INIT_ADD_ALL_CIPHERS
            | OPENSSL_INIT_ADD_ALL_DIGESTS
            | OPENSSL_INIT_LOAD_CONFIG;
        if !api.load_builtin_engines(flags) {
            tracing::debug!("could not load the builtin engines");
        }

        let mut handle = EngineHandle::by_id(api, &config.id)?;
        handle.init()?;

        let digest = handle
            .api()
            .digest(handle.engine(), NID_ID_GOSTR3411_94)
            .ok_or_else(|| handle.step_failed("get the digest of"))?;

        if !handle.api().register_pkey_asn1_meths(handle.engine()) {
            return Err(handle.step_failed("register ASN.1 for"));
        }

        if let Some((cmd, arg)) = &config.control {
            if !handle.api().ctrl_cmd_string(handle.engine(), cmd, arg) {
                return Err(handle.step_failed("set params of"));
            }
        }

        tracing::info!("{} engine ready", handle.id());
        Ok(Self { handle, digest })
    }

    /// Engine id.
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Digest implemented by the engine.
    pub fn digest(&self) -> MessageDigest {
        // SAFETY: the EVP_MD lives as long as the engine's functional
        // reference, which `self` holds.
        unsafe { MessageDigest::from_ptr(self.digest.as_ptr().cast()) }
    }

    /// Generates a signature key of type `nid` with the engine.
    pub fn generate_key(
        &self,
        nid: c_int,
        params: &[(&CStr, &CStr)],
    ) -> FactoryResult<PKey<Private>> {
        self.handle.api().keygen(self.handle.engine(), nid, params)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use parking_lot::Mutex;
    use test_log::test;

    use super::*;

    #[derive(Default)]
    struct ScriptedEngine {
        missing: bool,
        fail_step: Option<&'static str>,
        calls: Mutex<Vec<&'static str>>,
        live: AtomicUsize,
    }

    impl ScriptedEngine {
        fn step(&self, name: &'static str) -> bool {
            self.calls.lock().push(name);
            self.fail_step != Some(name)
        }
    }

    impl EngineApi for ScriptedEngine {
        fn load_builtin_engines(&self, _flags: u64) -> bool {
            self.step("load")
        }

        fn by_id(&self, _id: &CStr) -> Option<EngineRef> {
            self.calls.lock().push("by_id");
            if self.missing {
                return None;
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            EngineRef::new(NonNull::<u64>::dangling().as_ptr().cast())
        }

        fn init(&self, _engine: EngineRef) -> bool {
            self.step("init")
        }

        fn set_default(&self, _engine: EngineRef, methods: c_uint) -> bool {
            assert_eq!(methods, ENGINE_METHOD_RAND);
            self.step("set_default")
        }

        fn digest(&self, _engine: EngineRef, nid: c_int) -> Option<DigestRef> {
            assert_eq!(nid, NID_ID_GOSTR3411_94);
            self.step("digest")
                .then(|| DigestRef::new(MessageDigest::sha256().as_ptr().cast()))
                .flatten()
        }

        fn register_pkey_asn1_meths(&self, _engine: EngineRef) -> bool {
            self.step("asn1")
        }

        fn ctrl_cmd_string(&self, _engine: EngineRef, cmd: &CStr, _arg: &CStr) -> bool {
            assert_eq!(cmd, c"CRYPT_PARAMS");
            self.step("ctrl")
        }

        fn finish(&self, _engine: EngineRef) {
            self.calls.lock().push("finish");
        }

        fn free(&self, _engine: EngineRef) {
            self.calls.lock().push("free");
            self.live.fetch_sub(1, Ordering::SeqCst);
        }

        fn keygen(
            &self,
            _engine: EngineRef,
            _nid: c_int,
            _params: &[(&CStr, &CStr)],
        ) -> FactoryResult<PKey<Private>> {
            Err(FactoryError::EngineUnavailable("scripted".into()))
        }
    }

    #[test]
    fn test_rdrand_attach_and_release() {
        let api = Arc::new(ScriptedEngine::default());
        let engine = HardwareRngEngine::attach(api.clone()).expect("attach");
        assert_eq!(engine.id(), "rdrand");
        drop(engine);

        assert_eq!(
            *api.calls.lock(),
            ["load", "by_id", "init", "set_default", "finish", "free"]
        );
        assert_eq!(api.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rdrand_missing() {
        let api = Arc::new(ScriptedEngine {
            missing: true,
            ..Default::default()
        });
        let result = HardwareRngEngine::attach(api.clone());
        assert!(matches!(result, Err(FactoryError::EngineUnavailable(_))));
        assert!(!api.calls.lock().contains(&"free"));
    }

    #[test]
    fn test_alt_suite_unwinds_each_step() {
        for (fail_step, finished) in [
            ("init", false),
            ("digest", true),
            ("asn1", true),
            ("ctrl", true),
        ] {
            let api = Arc::new(ScriptedEngine {
                fail_step: Some(fail_step),
                ..Default::default()
            });
            let result = AltSuiteEngine::attach(api.clone(), &AltEngineConfig::gost());
            assert!(
                matches!(result, Err(FactoryError::EngineStep { .. })),
                "step {fail_step}"
            );

            let calls = api.calls.lock();
            assert_eq!(calls.contains(&"finish"), finished, "step {fail_step}");
            assert_eq!(calls.last(), Some(&"free"), "step {fail_step}");
            assert_eq!(api.live.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_alt_suite_ready() {
        let api = Arc::new(ScriptedEngine::default());
        let engine = AltSuiteEngine::attach(api.clone(), &AltEngineConfig::gost()).expect("attach");
        assert_eq!(engine.id(), "gost");
        assert_eq!(engine.digest().size(), 32);
        assert_eq!(api.live.load(Ordering::SeqCst), 1);
        drop(engine);
        assert_eq!(api.live.load(Ordering::SeqCst), 0);
    }
}
