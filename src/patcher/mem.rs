//! This module contains a patcher which adjusts memory permissions to patch read-only data, such as code

use region::Protection;
use thiserror::Error;
use tracing::error;

use super::{PatchGuard, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections: {0}")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0:?}")]
    CustomError(E),
}

impl From<()> for PermissionError<()> {
    fn from(e: ()) -> Self {
        Self::CustomError(e)
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}

impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub const fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

/// Converts a const pointer to a mutable pointer to be passed into our [`Patcher::patch`] implementation.
///
/// # Safety
///
/// **THIS FUNCTION DOES NOT CHANGE MEMORY PERMISSIONS.**
///
/// This function should **ONLY** be called in conjunction with our [`Patcher::patch`] implementation, which properly changes the memory permissions.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;
    type Guard<'a> = PermissionWrapperGuard<P::Guard<'a>> where Self: 'a;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        let _guard = region::protect_with_handle(location, patch.len(), Protection::all())?;
        self.patcher
            .patch(location, patch)
            .map(|g| PermissionWrapperGuard::guard(g, location, patch.len()))
            .map_err(Into::into)
    }
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can drop it in our [`Drop::drop`] impl
    guard: Option<G>,
    /// Location of the patch
    location: *const u8,
    /// Length of the patch
    len: usize,
}

impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. When this guard is dropped, the underlying guard will also be dropped with its target location made writable
    fn guard(guard: G, location: *const u8, len: usize) -> Self {
        Self {
            guard: Some(guard),
            location,
            len,
        }
    }
}

unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {}

unsafe impl<G: PatchGuard + Send> Send for PermissionWrapperGuard<G> {}
unsafe impl<G: PatchGuard + Sync> Sync for PermissionWrapperGuard<G> {}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        match unsafe { region::protect_with_handle(self.location, self.len, Protection::all()) } {
            Ok(_handle) => {
                if let Some(guard) = self.guard.take() {
                    guard.restore();
                }
            }
            Err(e) => {
                // Without write access the original bytes can't go back; leave the patch in place
                error!("can't restore patch at {:p}: {e}", self.location);
                std::mem::forget(self.guard.take());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use region::Protection;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::mem::{to_mut, PermissionWrapper};
    use crate::patcher::PatchGuard;
    use crate::patcher::Patcher;

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        let patch = unsafe { wrapper.patch(ptr, &[4, 3, 2, 1]).unwrap() };
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);

        patch.restore();
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Read-only and executable memory is writable during the patch and keeps its protection
    fn test_perms() {
        let mut mem = region::alloc(4, Protection::READ_WRITE).unwrap();
        let ptr = mem.as_mut_ptr::<u8>() as *const u8;
        unsafe {
            std::ptr::copy_nonoverlapping(b"1234".as_ptr(), mem.as_mut_ptr::<u8>(), 4);
            region::protect(ptr, 4, Protection::READ_EXECUTE).unwrap();
        }

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        let patch = unsafe { wrapper.patch(to_mut(ptr), &[4, 3, 2, 1]).unwrap() };
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);

        // make sure permissions reverted correctly after the patch
        for region in region::query_range(ptr, 4).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert_eq!(region.protection(), Protection::READ_EXECUTE);
        }

        patch.restore();
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 4) }, *b"1234");
        for region in region::query_range(ptr, 4).unwrap() {
            assert_eq!(region.unwrap().protection(), Protection::READ_EXECUTE);
        }
    }
}
