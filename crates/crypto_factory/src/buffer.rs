// Copyright (C) Microsoft Corporation. All rights reserved.

//! Owned, zero-initialized buffers for size-negotiated native contexts.

use std::alloc::alloc_zeroed;
use std::alloc::dealloc;
use std::alloc::Layout;
use std::ptr::NonNull;

use crate::error::FactoryError;
use crate::error::FactoryResult;

const CONTEXT_ALIGN: usize = 16;

/// Size reported by the sizing step of a two-phase native initializer.
///
/// Only the sizing step can produce one, so a buffer can never be allocated
/// for the initialization step without the size query having run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredSize(usize);

impl RequiredSize {
    pub(crate) fn reported(size: usize) -> Self {
        Self(size)
    }

    /// Size in bytes.
    pub fn get(self) -> usize {
        self.0
    }
}

/// Heap buffer holding an opaque native context.
pub struct ContextBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned; the native contexts stored in it are
// only used under the owner's synchronization.
unsafe impl Send for ContextBuffer {}
unsafe impl Sync for ContextBuffer {}

impl ContextBuffer {
    /// Allocates a zeroed buffer of exactly the required size.
    pub fn zeroed(size: RequiredSize) -> FactoryResult<Self> {
        let len = size.get();
        if len == 0 {
            return Err(FactoryError::ContextAllocation(0));
        }

        let layout = Layout::from_size_align(len, CONTEXT_ALIGN)
            .map_err(|_| FactoryError::ContextAllocation(len))?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(FactoryError::ContextAllocation(len))?;

        Ok(Self { ptr, layout })
    }

    /// Untyped pointer to the start of the buffer.
    pub fn as_ptr<T>(&self) -> *mut T {
        self.ptr.as_ptr().cast()
    }

    /// Allocated size in bytes, as reported by the size query.
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for ContextBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_zeroed_buffer() {
        let buffer = ContextBuffer::zeroed(RequiredSize::reported(96)).expect("alloc");
        assert_eq!(buffer.size(), 96);
        assert_eq!(buffer.as_ptr::<u8>() as usize % CONTEXT_ALIGN, 0);

        let bytes = unsafe { std::slice::from_raw_parts(buffer.as_ptr::<u8>(), buffer.size()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_size_matches_report() {
        for reported in [1, 13, 4096] {
            let buffer = ContextBuffer::zeroed(RequiredSize::reported(reported)).expect("alloc");
            assert_eq!(buffer.size(), reported);
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ContextBuffer::zeroed(RequiredSize::reported(0)),
            Err(FactoryError::ContextAllocation(0))
        ));
    }
}
