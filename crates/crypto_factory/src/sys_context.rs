// Copyright (C) Microsoft Corporation. All rights reserved.

//! TPM command context (TSS2 SAPI) built on top of a loaded transport.

use std::ptr;

use crate::buffer::ContextBuffer;
use crate::buffer::RequiredSize;
use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::error::Tss2Rc;
use crate::native::resolve;
use crate::native::ModuleLoader;
use crate::native::NativeModule;
use crate::tcti::TctiContext;
use crate::tcti::TctiContextBlob;
use crate::tcti::TctiLoader;
use crate::tcti::TransportSpec;
use crate::tcti::TSS2_RC_SUCCESS;

/// Default command-marshaling library.
pub const TSS2_SYS_LIBRARY: &str = "libtss2-sys.so.1";

/// ABI version descriptor exchanged at context initialization.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiVersion {
    /// TSS creator
    pub tss_creator: u32,
    /// TSS family
    pub tss_family: u32,
    /// TSS level
    pub tss_level: u32,
    /// TSS version
    pub tss_version: u32,
}

impl AbiVersion {
    /// Version this crate was written against.
    pub const CURRENT: Self = Self {
        tss_creator: 1,
        tss_family: 2,
        tss_level: 1,
        tss_version: 108,
    };
}

/// Opaque command context as seen through the C ABI.
#[repr(C)]
pub struct SysContextBlob {
    _opaque: [u8; 0],
}

type GetContextSizeFn = unsafe extern "C" fn(max_command_size: usize) -> usize;
type InitializeFn = unsafe extern "C" fn(
    context: *mut SysContextBlob,
    context_size: usize,
    tcti: *mut TctiContextBlob,
    abi_version: *const AbiVersion,
) -> Tss2Rc;
type GetTctiContextFn =
    unsafe extern "C" fn(context: *mut SysContextBlob, tcti: *mut *mut TctiContextBlob) -> Tss2Rc;
type FinalizeFn = unsafe extern "C" fn(context: *mut SysContextBlob);

/// Entry points of the command-marshaling library.
pub struct SysApi {
    _module: Box<dyn NativeModule>,
    get_context_size: GetContextSizeFn,
    initialize: InitializeFn,
    get_tcti_context: GetTctiContextFn,
    finalize: FinalizeFn,
}

impl SysApi {
    /// Opens `library` and resolves the context lifecycle functions.
    pub fn open(modules: &dyn ModuleLoader, library: &str) -> FactoryResult<Self> {
        let unavailable = || FactoryError::CommandLibraryUnavailable(library.to_string());
        let module = modules.open(library).ok_or_else(unavailable)?;

        // SAFETY: signatures match the TSS2 SAPI declarations.
        unsafe {
            let get_context_size =
                resolve::<GetContextSizeFn>(&*module, c"Tss2_Sys_GetContextSize");
            let initialize = resolve::<InitializeFn>(&*module, c"Tss2_Sys_Initialize");
            let get_tcti_context =
                resolve::<GetTctiContextFn>(&*module, c"Tss2_Sys_GetTctiContext");
            let finalize = resolve::<FinalizeFn>(&*module, c"Tss2_Sys_Finalize");

            match (get_context_size, initialize, get_tcti_context, finalize) {
                (Some(get_context_size), Some(initialize), Some(get_tcti_context), Some(finalize)) => {
                    Ok(Self {
                        _module: module,
                        get_context_size,
                        initialize,
                        get_tcti_context,
                        finalize,
                    })
                }
                _ => {
                    tracing::error!("command library \"{library}\" lacks context entry points");
                    Err(unavailable())
                }
            }
        }
    }
}

/// Live command context bound to the process-wide transport.
pub struct HardwareContext {
    api: SysApi,
    sys: Option<ContextBuffer>,
    tcti: Option<TctiContext>,
}

impl HardwareContext {
    /// Loads the transport and binds a command context to it.
    ///
    /// On failure nothing is retained: the transport context is finalized
    /// and freed and the loader is returned to its empty state.
    pub fn bring_up(
        modules: &dyn ModuleLoader,
        sys_library: &str,
        transport: &TransportSpec,
    ) -> FactoryResult<Self> {
        let api = SysApi::open(modules, sys_library)?;
        let tcti =
            TctiLoader::load_with(modules, &transport.name, transport.config.as_deref())?;

        match bind(&api, &tcti) {
            Ok(sys) => {
                tracing::info!("TPM command context bound to TCTI \"{}\"", transport.name);
                Ok(Self {
                    api,
                    sys: Some(sys),
                    tcti: Some(tcti),
                })
            }
            Err(e) => {
                drop(tcti);
                TctiLoader::unload();
                Err(e)
            }
        }
    }

    /// Raw command context pointer.
    pub fn sys_context(&self) -> *mut SysContextBlob {
        self.sys.as_ref().map_or(ptr::null_mut(), |sys| sys.as_ptr())
    }

    /// Raw transport context pointer.
    pub fn tcti_context(&self) -> *mut TctiContextBlob {
        self.tcti.as_ref().map_or(ptr::null_mut(), |tcti| tcti.as_ptr())
    }

    /// Tears the command context down, then the transport.
    ///
    /// The nested transport reference is read before the command context is
    /// finalized. If it cannot be read the transport context is left
    /// allocated. Safe to call more than once.
    pub fn teardown(&mut self) {
        let Some(sys) = self.sys.take() else {
            return;
        };

        let mut nested: *mut TctiContextBlob = ptr::null_mut();
        // SAFETY: `sys` is an initialized command context.
        let rc = unsafe { (self.api.get_tcti_context)(sys.as_ptr(), &mut nested) };
        if rc != TSS2_RC_SUCCESS {
            tracing::warn!("could not retrieve TCTI context: {rc:#x}");
            nested = ptr::null_mut();
        }

        // SAFETY: initialized in `bind` and finalized exactly once.
        unsafe { (self.api.finalize)(sys.as_ptr()) };
        drop(sys);

        match self.tcti.take() {
            Some(tcti) if !nested.is_null() => {
                if nested != tcti.as_ptr() {
                    tracing::warn!("command context reported a foreign TCTI context");
                }
                drop(tcti);
            }
            Some(tcti) => {
                tracing::warn!("TCTI context not finalized");
                std::mem::forget(tcti);
            }
            None => {}
        }

        TctiLoader::unload();
        tracing::debug!("TPM command context released");
    }
}

impl Drop for HardwareContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn bind(api: &SysApi, tcti: &TctiContext) -> FactoryResult<ContextBuffer> {
    // SAFETY: zero selects the library's default maximum command size.
    let size = unsafe { (api.get_context_size)(0) };
    let buffer = ContextBuffer::zeroed(RequiredSize::reported(size)).inspect_err(|e| {
        tracing::error!("could not allocate the command context: {e}");
    })?;

    let abi_version = AbiVersion::CURRENT;
    // SAFETY: buffer has the size the library asked for; tcti is initialized.
    let rc = unsafe { (api.initialize)(buffer.as_ptr(), size, tcti.as_ptr(), &abi_version) };
    if rc != TSS2_RC_SUCCESS {
        tracing::error!("could not initialize the command context: {rc:#x}");
        Err(FactoryError::CommandContextInit(rc))?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_abi_version_layout() {
        assert_eq!(std::mem::size_of::<AbiVersion>(), 16);
        assert_eq!(AbiVersion::CURRENT.tss_version, 108);
    }

    #[test]
    fn test_missing_command_library() {
        let result = SysApi::open(&crate::native::DynamicLoader, "libno-such-tss2-sys.so.1");
        assert!(matches!(
            result,
            Err(FactoryError::CommandLibraryUnavailable(_))
        ));
    }
}
