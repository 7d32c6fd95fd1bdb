// Copyright (C) Microsoft Corporation. All rights reserved.

#![allow(dead_code)]

//! Native doubles shared by the integration tests.
//!
//! The transport plugin and command library are `extern "C"` functions in
//! this binary served through [`FakeLoader`]; engines, compliance and the
//! locking registry are trait doubles. Everything observable is appended to
//! a process-wide event log.

use std::collections::HashMap;
use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_uint;
use std::ffi::c_void;
use std::ffi::CStr;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use azihsm_crypto_factory::algorithms::OsslRng;
use azihsm_crypto_factory::algorithms::Rng;
use azihsm_crypto_factory::compliance::ComplianceModule;
use azihsm_crypto_factory::engine::AltEngineConfig;
use azihsm_crypto_factory::engine::DigestRef;
use azihsm_crypto_factory::engine::EngineApi;
use azihsm_crypto_factory::engine::EngineRef;
use azihsm_crypto_factory::lock_bridge::LockingCallback;
use azihsm_crypto_factory::lock_bridge::LockingHost;
use azihsm_crypto_factory::native::ModuleLoader;
use azihsm_crypto_factory::native::NativeModule;
use azihsm_crypto_factory::sys_context::AbiVersion;
use azihsm_crypto_factory::sys_context::SysContextBlob;
use azihsm_crypto_factory::tcti::tcti_library_name;
use azihsm_crypto_factory::tcti::TctiContextBlob;
use azihsm_crypto_factory::tcti::TctiContextCommonV1;
use azihsm_crypto_factory::tcti::TctiInfo;
use azihsm_crypto_factory::tcti::TctiLoader;
use azihsm_crypto_factory::tcti::TransportSpec;
use azihsm_crypto_factory::tcti::TSS2_TCTI_INFO_SYMBOL;
use azihsm_crypto_factory::Backends;
use azihsm_crypto_factory::FactoryConfig;
use azihsm_crypto_factory::FactoryError;
use azihsm_crypto_factory::FactoryOptions;
use azihsm_crypto_factory::FactoryResult;
use openssl::ec::EcGroup;
use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use parking_lot::const_mutex;
use parking_lot::Mutex;

/// Serializes tests that touch process-wide state.
pub static SERIAL: Mutex<()> = const_mutex(());

static EVENTS: Mutex<Vec<String>> = const_mutex(Vec::new());

/// Transport name served by the fake loader.
pub const FAKE_TCTI: &str = "fake";

/// Command library name served by the fake loader.
pub const FAKE_SYS: &str = "libfake-tss2-sys.so";

/// Return code of the fake initializer's size query.
pub static TCTI_SIZE_RC: AtomicU32 = AtomicU32::new(0);

/// Return code of the fake initializer's allocation call.
pub static TCTI_INIT_RC: AtomicU32 = AtomicU32::new(0);

/// Return code of the fake command context initializer.
pub static SYS_INIT_RC: AtomicU32 = AtomicU32::new(0);

/// Return code of the fake nested transport lookup.
pub static SYS_GET_TCTI_RC: AtomicU32 = AtomicU32::new(0);

pub fn record(event: impl Into<String>) {
    EVENTS.lock().push(event.into());
}

pub fn take_events() -> Vec<String> {
    std::mem::take(&mut *EVENTS.lock())
}

/// Clears the event log and every injected failure.
pub fn reset_fakes() {
    take_events();
    TCTI_SIZE_RC.store(0, Ordering::SeqCst);
    TCTI_INIT_RC.store(0, Ordering::SeqCst);
    SYS_INIT_RC.store(0, Ordering::SeqCst);
    SYS_GET_TCTI_RC.store(0, Ordering::SeqCst);
}

// Transport plugin

const FAKE_TCTI_MAGIC: u64 = 0x5446_4b45_5443_5449;
const FAKE_TCTI_SIZE: usize = size_of::<TctiContextCommonV1>() + 64;

static FAKE_TCTI_INFO: TctiInfo = TctiInfo {
    version: 2,
    name: c"fake".as_ptr(),
    description: c"in-process test transport".as_ptr(),
    config_help: c"any string".as_ptr(),
    init: Some(fake_tcti_init),
};

static BROKEN_TCTI_INFO: TctiInfo = TctiInfo {
    version: 2,
    name: c"broken".as_ptr(),
    description: c"transport without an initializer".as_ptr(),
    config_help: c"".as_ptr(),
    init: None,
};

extern "C" fn fake_tcti_info() -> *const TctiInfo {
    &FAKE_TCTI_INFO
}

extern "C" fn broken_tcti_info() -> *const TctiInfo {
    &BROKEN_TCTI_INFO
}

unsafe extern "C" fn fake_tcti_init(
    context: *mut TctiContextBlob,
    size: *mut usize,
    config: *const c_char,
) -> u32 {
    if context.is_null() {
        let rc = TCTI_SIZE_RC.load(Ordering::SeqCst);
        if rc == 0 {
            // SAFETY: the loader passes a valid size pointer.
            unsafe { *size = FAKE_TCTI_SIZE };
        }
        return rc;
    }

    let rc = TCTI_INIT_RC.load(Ordering::SeqCst);
    if rc != 0 {
        return rc;
    }

    // SAFETY: the loader passes a zeroed buffer of FAKE_TCTI_SIZE bytes.
    unsafe {
        assert_eq!(*size, FAKE_TCTI_SIZE);
        let common = context.cast::<TctiContextCommonV1>();
        (*common).magic = FAKE_TCTI_MAGIC;
        (*common).version = 1;
        (*common).finalize = Some(fake_tcti_finalize);
    }

    if config.is_null() {
        record("tcti init");
    } else {
        // SAFETY: NUL terminated string from the loader.
        let config = unsafe { CStr::from_ptr(config) }.to_string_lossy();
        record(format!("tcti init {config}"));
    }
    0
}

unsafe extern "C" fn fake_tcti_finalize(context: *mut TctiContextBlob) {
    // SAFETY: context initialized by fake_tcti_init.
    let magic = unsafe { (*context.cast::<TctiContextCommonV1>()).magic };
    assert_eq!(magic, FAKE_TCTI_MAGIC);
    record(format!("tcti finalize loaded={}", TctiLoader::is_loaded()));
}

// Command library

#[repr(C)]
struct FakeSys {
    tcti: *mut TctiContextBlob,
}

unsafe extern "C" fn fake_sys_context_size(_max_command_size: usize) -> usize {
    size_of::<FakeSys>()
}

unsafe extern "C" fn fake_sys_initialize(
    context: *mut SysContextBlob,
    context_size: usize,
    tcti: *mut TctiContextBlob,
    abi_version: *const AbiVersion,
) -> u32 {
    let rc = SYS_INIT_RC.load(Ordering::SeqCst);
    if rc != 0 {
        record("sys init failed");
        return rc;
    }

    assert_eq!(context_size, size_of::<FakeSys>());
    // SAFETY: arguments supplied by the factory.
    unsafe {
        assert_eq!((*abi_version).tss_version, AbiVersion::CURRENT.tss_version);
        (*context.cast::<FakeSys>()).tcti = tcti;
    }
    record("sys init");
    0
}

unsafe extern "C" fn fake_sys_get_tcti(
    context: *mut SysContextBlob,
    tcti: *mut *mut TctiContextBlob,
) -> u32 {
    record("sys get_tcti");
    let rc = SYS_GET_TCTI_RC.load(Ordering::SeqCst);
    if rc != 0 {
        return rc;
    }
    // SAFETY: context initialized by fake_sys_initialize.
    unsafe { *tcti = (*context.cast::<FakeSys>()).tcti };
    0
}

unsafe extern "C" fn fake_sys_finalize(_context: *mut SysContextBlob) {
    record("sys finalize");
}

// Loader

type SymbolTable = Vec<(&'static CStr, usize)>;

struct FakeModule {
    path: String,
    symbols: SymbolTable,
}

impl NativeModule for FakeModule {
    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        self.symbols
            .iter()
            .find(|(symbol, _)| *symbol == name)
            .and_then(|(_, address)| NonNull::new(*address as *mut c_void))
    }
}

impl Drop for FakeModule {
    fn drop(&mut self) {
        record(format!("close {}", self.path));
    }
}

/// Serves in-process modules by path.
#[derive(Default)]
pub struct FakeLoader {
    libraries: HashMap<String, SymbolTable>,
}

impl FakeLoader {
    /// Loader serving the fake transport under its conventional file name
    /// and the fake command library.
    pub fn standard() -> Self {
        Self::default()
            .with_tcti(&conventional(FAKE_TCTI))
            .with_sys(FAKE_SYS)
    }

    pub fn with_tcti(self, path: &str) -> Self {
        self.with_library(
            path,
            vec![(TSS2_TCTI_INFO_SYMBOL, fake_tcti_info as usize)],
        )
    }

    pub fn with_broken_tcti(self, path: &str) -> Self {
        self.with_library(
            path,
            vec![(TSS2_TCTI_INFO_SYMBOL, broken_tcti_info as usize)],
        )
    }

    pub fn with_sys(self, path: &str) -> Self {
        self.with_library(
            path,
            vec![
                (c"Tss2_Sys_GetContextSize", fake_sys_context_size as usize),
                (c"Tss2_Sys_Initialize", fake_sys_initialize as usize),
                (c"Tss2_Sys_GetTctiContext", fake_sys_get_tcti as usize),
                (c"Tss2_Sys_Finalize", fake_sys_finalize as usize),
            ],
        )
    }

    pub fn with_library(mut self, path: &str, symbols: SymbolTable) -> Self {
        self.libraries.insert(path.to_string(), symbols);
        self
    }
}

impl ModuleLoader for FakeLoader {
    fn open(&self, path: &str) -> Option<Box<dyn NativeModule>> {
        let Some(symbols) = self.libraries.get(path) else {
            record(format!("open miss {path}"));
            return None;
        };
        record(format!("open {path}"));
        Some(Box::new(FakeModule {
            path: path.to_string(),
            symbols: symbols.clone(),
        }))
    }
}

pub fn conventional(name: &str) -> String {
    tcti_library_name(name).expect("short name")
}

// Engines

static RDRAND_TOKEN: u8 = 1;
static ALT_TOKEN: u8 = 2;

fn engine_name(engine: EngineRef) -> &'static str {
    if std::ptr::eq(engine.as_ptr().cast_const().cast::<u8>(), &RDRAND_TOKEN) {
        "rdrand"
    } else {
        "alt"
    }
}

/// ENGINE API double; the alternate suite digest is SHA-256 and its keys
/// are P-256.
#[derive(Default)]
pub struct FakeEngines {
    /// Every engine lookup misses
    pub missing: bool,
    /// Name of an engine whose initialization fails
    pub fail_init: Option<&'static str>,
}

impl EngineApi for FakeEngines {
    fn load_builtin_engines(&self, _flags: u64) -> bool {
        true
    }

    fn by_id(&self, id: &CStr) -> Option<EngineRef> {
        if self.missing {
            return None;
        }
        let token: &u8 = if id == c"rdrand" {
            &RDRAND_TOKEN
        } else {
            &ALT_TOKEN
        };
        EngineRef::new((token as *const u8).cast_mut().cast())
    }

    fn init(&self, engine: EngineRef) -> bool {
        let name = engine_name(engine);
        record(format!("engine init {name}"));
        self.fail_init != Some(name)
    }

    fn set_default(&self, engine: EngineRef, _methods: c_uint) -> bool {
        record(format!("engine set_default {}", engine_name(engine)));
        true
    }

    fn digest(&self, _engine: EngineRef, _nid: c_int) -> Option<DigestRef> {
        DigestRef::new(MessageDigest::sha256().as_ptr().cast())
    }

    fn register_pkey_asn1_meths(&self, _engine: EngineRef) -> bool {
        true
    }

    fn ctrl_cmd_string(&self, _engine: EngineRef, cmd: &CStr, _arg: &CStr) -> bool {
        record(format!("engine ctrl {}", cmd.to_string_lossy()));
        true
    }

    fn finish(&self, engine: EngineRef) {
        record(format!("engine finish {}", engine_name(engine)));
    }

    fn free(&self, engine: EngineRef) {
        record(format!("engine free {}", engine_name(engine)));
    }

    fn keygen(
        &self,
        _engine: EngineRef,
        _nid: c_int,
        _params: &[(&CStr, &CStr)],
    ) -> FactoryResult<PKey<Private>> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
    }
}

// Compliance

pub struct FakeCompliance {
    pub enabled: bool,
    pub accept: bool,
}

impl ComplianceModule for FakeCompliance {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn enable(&self) -> bool {
        record("compliance enable");
        self.accept
    }

    fn reinit_rand(&self) {
        record("compliance reinit rand");
    }
}

// Locking registry

/// Legacy, non thread-safe locking registry.
pub struct FakeLockingHost {
    callback: Mutex<Option<LockingCallback>>,
}

impl FakeLockingHost {
    pub fn new() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }

    pub fn installed(&self) -> Option<LockingCallback> {
        *self.callback.lock()
    }
}

impl LockingHost for FakeLockingHost {
    fn is_thread_safe(&self) -> bool {
        false
    }

    fn num_locks(&self) -> i64 {
        8
    }

    fn locking_callback(&self) -> Option<LockingCallback> {
        *self.callback.lock()
    }

    fn set_locking_callback(&self, callback: Option<LockingCallback>) {
        record(if callback.is_some() {
            "lock callback set"
        } else {
            "lock callback cleared"
        });
        *self.callback.lock() = callback;
    }
}

// Options

pub fn failing_rng() -> FactoryResult<Box<dyn Rng>> {
    Err(FactoryError::RngUnavailable)
}

pub fn fake_config() -> FactoryConfig {
    FactoryConfig {
        transport: Some(TransportSpec {
            name: FAKE_TCTI.to_string(),
            config: None,
        }),
        sys_library: FAKE_SYS.to_string(),
        hardware_rng: true,
        alt_engine: Some(AltEngineConfig::gost()),
        fips: false,
    }
}

pub fn fake_backends() -> Backends {
    Backends {
        locking: Arc::new(FakeLockingHost::new()),
        engines: Arc::new(FakeEngines::default()),
        compliance: Arc::new(FakeCompliance {
            enabled: false,
            accept: true,
        }),
        modules: Arc::new(FakeLoader::standard()),
        rng: OsslRng::boxed,
    }
}

pub fn fake_options() -> FactoryOptions {
    FactoryOptions {
        config: fake_config(),
        backends: fake_backends(),
    }
}
