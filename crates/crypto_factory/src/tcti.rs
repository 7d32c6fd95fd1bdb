// Copyright (C) Microsoft Corporation. All rights reserved.

//! TPM transport (TCTI) plugin loader.
//!
//! A transport plugin exports `Tss2_Tcti_Info`, which returns a static info
//! structure whose initializer follows a two-call protocol: the first call,
//! with a null context, reports the context size; the second call
//! initializes a buffer of that size. At most one plugin is loaded in the
//! process at any time.

use std::ffi::c_char;
use std::ffi::c_void;
use std::ffi::CStr;
use std::mem::size_of;
use std::ptr;
use std::ptr::NonNull;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::buffer::ContextBuffer;
use crate::buffer::RequiredSize;
use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::error::Tss2Rc;
use crate::native::resolve;
use crate::native::DynamicLoader;
use crate::native::ModuleLoader;
use crate::native::NativeModule;

/// Name of the info entry point every transport plugin exports.
pub const TSS2_TCTI_INFO_SYMBOL: &CStr = c"Tss2_Tcti_Info";

/// Success status shared by transports and the command library.
pub const TSS2_RC_SUCCESS: Tss2Rc = 0;

/// Longest accepted transport library file name, terminator included.
pub const TCTI_PATH_MAX: usize = 4096;

#[cfg(all(unix, not(target_os = "macos")))]
const TCTI_LIB_PREFIX: &str = "libtss2-tcti-";
#[cfg(all(unix, not(target_os = "macos")))]
const TCTI_LIB_SUFFIX: &str = ".so.0";

#[cfg(target_os = "macos")]
const TCTI_LIB_PREFIX: &str = "libtss2-tcti-";
#[cfg(target_os = "macos")]
const TCTI_LIB_SUFFIX: &str = ".0.dylib";

#[cfg(windows)]
const TCTI_LIB_PREFIX: &str = "tss2-tcti-";
#[cfg(windows)]
const TCTI_LIB_SUFFIX: &str = ".dll";

/// Opaque transport context as seen through the C ABI.
#[repr(C)]
pub struct TctiContextBlob {
    _opaque: [u8; 0],
}

/// Transport initializer: `(context, size, config) -> rc`.
pub type TctiInitFn =
    unsafe extern "C" fn(context: *mut TctiContextBlob, size: *mut usize, config: *const c_char) -> Tss2Rc;

/// Signature of the exported info entry point.
pub type TctiInfoFn = unsafe extern "C" fn() -> *const TctiInfo;

/// Transport finalizer stored in the common context header.
pub type TctiFinalizeFn = unsafe extern "C" fn(context: *mut TctiContextBlob);

/// Self-describing structure returned by a transport plugin.
#[repr(C)]
pub struct TctiInfo {
    /// Structure version
    pub version: u32,
    /// Short transport name
    pub name: *const c_char,
    /// Human readable description
    pub description: *const c_char,
    /// Help text for the configuration string
    pub config_help: *const c_char,
    /// Context initializer
    pub init: Option<TctiInitFn>,
}

// SAFETY: the info structure is immutable static data inside the plugin.
unsafe impl Send for TctiInfo {}
unsafe impl Sync for TctiInfo {}

/// Header shared by every version 1+ transport context.
#[repr(C)]
pub struct TctiContextCommonV1 {
    /// Transport specific magic number
    pub magic: u64,
    /// Context layout version
    pub version: u32,
    /// Command transmit routine
    pub transmit: *const c_void,
    /// Response receive routine
    pub receive: *const c_void,
    /// Finalizer
    pub finalize: Option<TctiFinalizeFn>,
    /// Cancel routine
    pub cancel: *const c_void,
    /// Poll handle query
    pub get_poll_handles: *const c_void,
    /// Locality selection
    pub set_locality: *const c_void,
}

/// Owned, initialized transport context.
pub struct TctiContext {
    buffer: ContextBuffer,
    finalized: bool,
}

impl TctiContext {
    /// Raw context pointer handed to the command library.
    pub fn as_ptr(&self) -> *mut TctiContextBlob {
        self.buffer.as_ptr()
    }

    /// Size of the context buffer.
    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    /// Runs the transport's finalizer once.
    pub fn finalize(&mut self) {
        if std::mem::replace(&mut self.finalized, true) {
            return;
        }
        if self.buffer.size() < size_of::<TctiContextCommonV1>() {
            tracing::debug!("transport context too small for a common header");
            return;
        }

        // SAFETY: an initialized transport context starts with the common
        // header and the buffer is large enough to hold one.
        let common = unsafe { &*self.buffer.as_ptr::<TctiContextCommonV1>() };
        if common.version >= 1 {
            if let Some(finalize) = common.finalize {
                // SAFETY: finalizer installed by the transport for this context.
                unsafe { finalize(self.as_ptr()) }
            }
        }
    }
}

impl Drop for TctiContext {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Snapshot of the loaded plugin's info structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// Structure version
    pub version: u32,
    /// Short transport name
    pub name: String,
    /// Description
    pub description: String,
    /// Configuration help text
    pub config_help: String,
    /// Name the plugin was requested by
    pub library: String,
}

/// Transport selection parsed from `name[:config]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    /// Transport name or library path
    pub name: String,
    /// Configuration string passed to the initializer
    pub config: Option<std::ffi::CString>,
}

impl TransportSpec {
    /// Parses `name[:config]`; everything after the first colon is config.
    pub fn parse(spec: &str) -> FactoryResult<Self> {
        let (name, config) = match spec.split_once(':') {
            Some((name, config)) => (name, Some(config)),
            None => (spec, None),
        };
        if name.is_empty() {
            return Err(FactoryError::InvalidParameter(format!(
                "empty transport name in \"{spec}\""
            )));
        }

        let config = config
            .map(std::ffi::CString::new)
            .transpose()
            .map_err(|_| FactoryError::InvalidParameter("NUL in transport config".into()))?;

        Ok(Self {
            name: name.to_string(),
            config,
        })
    }
}

struct LoadedTransport {
    module: Box<dyn NativeModule>,
    info: NonNull<TctiInfo>,
    library: String,
}

// SAFETY: `info` points into the plugin image, which stays mapped for as long
// as `module` is owned (and forever after unload).
unsafe impl Send for LoadedTransport {}

lazy_static! {
    static ref TRANSPORT: Mutex<Option<LoadedTransport>> = Mutex::new(None);
}

/// Returns the conventional file name for transport `name`, or `None` when
/// it would not fit in [`TCTI_PATH_MAX`].
pub fn tcti_library_name(name: &str) -> Option<String> {
    let path = format!("{TCTI_LIB_PREFIX}{name}{TCTI_LIB_SUFFIX}");
    (path.len() < TCTI_PATH_MAX).then_some(path)
}

fn open_conventional(modules: &dyn ModuleLoader, name: &str) -> Option<Box<dyn NativeModule>> {
    let Some(path) = tcti_library_name(name) else {
        tracing::error!("transport name too long: {} bytes", name.len());
        return None;
    };
    modules.open(&path)
}

fn to_string_lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: info strings are NUL terminated static data.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Process-wide transport plugin loader.
pub struct TctiLoader;

impl TctiLoader {
    /// Loads transport `name` through the platform loader.
    pub fn load(name: &str) -> FactoryResult<TctiContext> {
        Self::load_with(&DynamicLoader, name, None)
    }

    /// Loads transport `name` and initializes a context for it.
    ///
    /// `name` is first opened verbatim, then as the conventional
    /// `libtss2-tcti-<name>` file name. Fails without side effects when a
    /// transport is already loaded. On any failure the plugin is closed and
    /// no state is retained.
    pub fn load_with(
        modules: &dyn ModuleLoader,
        name: &str,
        config: Option<&CStr>,
    ) -> FactoryResult<TctiContext> {
        let mut slot = TRANSPORT.lock();
        if slot.is_some() {
            tracing::error!("a TCTI transport is already loaded, refusing \"{name}\"");
            Err(FactoryError::TransportAlreadyLoaded)?;
        }

        let module = modules
            .open(name)
            .or_else(|| open_conventional(modules, name))
            .ok_or_else(|| {
                tracing::error!("Could not open TCTI library \"{name}\"");
                FactoryError::TransportNotFound(name.to_string())
            })?;

        // SAFETY: the info entry point has the documented C signature.
        let info_fn = unsafe { resolve::<TctiInfoFn>(&*module, TSS2_TCTI_INFO_SYMBOL) }
            .ok_or_else(|| {
                tracing::error!(
                    "Symbol \"{}\" not found in library \"{name}\"",
                    TSS2_TCTI_INFO_SYMBOL.to_string_lossy()
                );
                FactoryError::TransportSymbolMissing {
                    symbol: TSS2_TCTI_INFO_SYMBOL.to_string_lossy().into_owned(),
                    path: name.to_string(),
                }
            })?;

        // SAFETY: resolved above from the plugin that is still loaded.
        let info = NonNull::new(unsafe { info_fn() }.cast_mut())
            .ok_or_else(|| FactoryError::TransportInvalidInfo(name.to_string()))?;
        // SAFETY: non-null info structure owned by the plugin.
        let init = unsafe { info.as_ref() }
            .init
            .ok_or_else(|| FactoryError::TransportInvalidInfo(name.to_string()))?;

        let config_ptr = config.map_or(ptr::null(), CStr::as_ptr);
        let size = query_size(init, name, config_ptr)?;
        let context = initialize(init, size, name, config_ptr)?;

        tracing::debug!(
            "loaded TCTI \"{name}\" with a {} byte context",
            context.size()
        );
        *slot = Some(LoadedTransport {
            module,
            info,
            library: name.to_string(),
        });
        Ok(context)
    }

    /// Forgets the loaded transport.
    ///
    /// Idempotent. The plugin's native module is deliberately left mapped:
    /// some transports keep background state that still references their
    /// code after finalization, and unmapping it can crash the process.
    /// Only the loader's bookkeeping is cleared, so a later load proceeds.
    pub fn unload() {
        let Some(transport) = TRANSPORT.lock().take() else {
            return;
        };

        tracing::debug!("unloading TCTI \"{}\"", transport.library);
        std::mem::forget(transport.module);
    }

    /// Returns true while a transport is loaded.
    pub fn is_loaded() -> bool {
        TRANSPORT.lock().is_some()
    }

    /// Describes the loaded transport.
    pub fn info() -> Option<TransportInfo> {
        let slot = TRANSPORT.lock();
        let transport = slot.as_ref()?;
        // SAFETY: the module holding the info structure is still owned.
        let info = unsafe { transport.info.as_ref() };

        Some(TransportInfo {
            version: info.version,
            name: to_string_lossy(info.name),
            description: to_string_lossy(info.description),
            config_help: to_string_lossy(info.config_help),
            library: transport.library.clone(),
        })
    }

    /// Checks whether the conventional library for `name` can be opened.
    pub fn is_present(name: &str) -> bool {
        Self::is_present_with(&DynamicLoader, name)
    }

    /// [`TctiLoader::is_present`] against the given `modules` loader.
    pub fn is_present_with(modules: &dyn ModuleLoader, name: &str) -> bool {
        open_conventional(modules, name).is_some()
    }
}

fn query_size(init: TctiInitFn, name: &str, config: *const c_char) -> FactoryResult<RequiredSize> {
    let mut size = 0usize;
    // SAFETY: a null context asks the initializer for its size only.
    let rc = unsafe { init(ptr::null_mut(), &mut size, config) };
    if rc != TSS2_RC_SUCCESS {
        tracing::error!("TCTI init setup routine failed for library \"{name}\": {rc:#x}");
        Err(FactoryError::TransportInitSize {
            path: name.to_string(),
            rc,
        })?;
    }
    Ok(RequiredSize::reported(size))
}

fn initialize(
    init: TctiInitFn,
    size: RequiredSize,
    name: &str,
    config: *const c_char,
) -> FactoryResult<TctiContext> {
    let buffer = ContextBuffer::zeroed(size)?;
    let mut len = size.get();
    // SAFETY: buffer holds exactly the size the initializer asked for.
    let rc = unsafe { init(buffer.as_ptr(), &mut len, config) };
    if rc != TSS2_RC_SUCCESS {
        tracing::error!("TCTI init allocation routine failed for library \"{name}\": {rc:#x}");
        Err(FactoryError::TransportInit {
            path: name.to_string(),
            rc,
        })?;
    }

    Ok(TctiContext {
        buffer,
        finalized: false,
    })
}
