// Copyright (C) Microsoft Corporation. All rights reserved.

//! Native module access.
//!
//! Transport plugins, the command-marshaling library and the libcrypto entry
//! points that the `openssl` crate does not wrap are all reached through the
//! [`ModuleLoader`] / [`NativeModule`] pair. Raw handles never leave this
//! module; callers get typed function pointers from [`resolve`].

use std::ffi::c_void;
use std::ffi::CStr;
use std::mem::size_of;
use std::mem::transmute_copy;
use std::ptr::NonNull;

/// A loaded native module.
pub trait NativeModule: Send + Sync {
    /// Looks up an exported symbol by name.
    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>>;
}

/// Opens native modules by file name or path.
pub trait ModuleLoader: Send + Sync {
    /// Opens `path`, returning `None` if it cannot be loaded.
    fn open(&self, path: &str) -> Option<Box<dyn NativeModule>>;
}

/// Module backed by the platform dynamic loader.
pub struct DynamicModule {
    lib: libloading::Library,
}

impl NativeModule for DynamicModule {
    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: the symbol is only read as an untyped address here.
        let symbol = unsafe { self.lib.get::<*mut c_void>(name.to_bytes_with_nul()) }.ok()?;
        NonNull::new(*symbol)
    }
}

/// Loader backed by the platform dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLoader;

impl ModuleLoader for DynamicLoader {
    fn open(&self, path: &str) -> Option<Box<dyn NativeModule>> {
        // SAFETY: loading a module runs its initializers; transport plugins
        // and the TSS libraries are trusted system components.
        match unsafe { libloading::Library::new(path) } {
            Ok(lib) => Some(Box::new(DynamicModule { lib })),
            Err(e) => {
                tracing::debug!("could not open \"{path}\": {e}");
                None
            }
        }
    }
}

/// Returns a module view of the running process image.
///
/// libcrypto is already linked into the process through `openssl-sys`, so
/// symbols the `openssl` crate leaves unwrapped are looked up here.
pub fn process_module() -> Option<Box<dyn NativeModule>> {
    #[cfg(unix)]
    {
        let lib: libloading::Library = libloading::os::unix::Library::this().into();
        Some(Box::new(DynamicModule { lib }))
    }
    #[cfg(windows)]
    {
        libloading::os::windows::Library::this()
            .ok()
            .map(|lib| Box::new(DynamicModule { lib: lib.into() }) as Box<dyn NativeModule>)
    }
    #[cfg(not(any(unix, windows)))]
    {
        None
    }
}

/// Resolves `name` in `module` as a function pointer of type `F`.
///
/// # Safety
/// `F` must be an `extern "C"` function pointer type whose signature matches
/// the exported symbol.
pub unsafe fn resolve<F: Copy>(module: &dyn NativeModule, name: &CStr) -> Option<F> {
    debug_assert_eq!(size_of::<F>(), size_of::<*mut c_void>());
    let address = module.symbol(name)?.as_ptr();
    // SAFETY: guaranteed by the caller; F is pointer sized.
    Some(unsafe { transmute_copy::<*mut c_void, F>(&address) })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::ffi::CString;

    use test_log::test;

    use super::*;

    struct TableModule(HashMap<CString, usize>);

    impl NativeModule for TableModule {
        fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
            self.0
                .get(name)
                .and_then(|addr| NonNull::new(*addr as *mut c_void))
        }
    }

    extern "C" fn answer() -> u32 {
        42
    }

    #[test]
    fn test_resolve_typed_function() {
        let mut table = HashMap::new();
        table.insert(c"answer".to_owned(), answer as usize);
        let module = TableModule(table);

        let func = unsafe { resolve::<extern "C" fn() -> u32>(&module, c"answer") };
        assert_eq!(func.map(|f| f()), Some(42));

        let missing = unsafe { resolve::<extern "C" fn() -> u32>(&module, c"missing") };
        assert!(missing.is_none());
    }

    #[test]
    fn test_dynamic_loader_missing_library() {
        let loader = DynamicLoader;
        assert!(loader.open("libdefinitely-not-present-azihsm.so.0").is_none());
    }
}
