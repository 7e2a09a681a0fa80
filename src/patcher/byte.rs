//! This module contains a byte patcher

use std::ptr;

use super::{PatchGuard, Patcher};

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytePatcher;

impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub const fn new() -> Self {
        Self
    }
}

unsafe impl Patcher for BytePatcher {
    type Error = ();
    type Guard<'a> = BytePatchGuard;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        Ok(BytePatchGuard::patch(location, patch))
    }
}

/// Guard for byte-patches
///
/// See [`BytePatcher`].
pub struct BytePatchGuard {
    /// Original data from `location`
    original: Vec<u8>,
    /// Location of the patch
    location: *mut u8,
}

impl BytePatchGuard {
    /// Saves the bytes at `location`, then overwrites them with `patch`
    ///
    /// # Safety
    ///
    /// `location` must be valid for reads and writes of `patch.len()` bytes
    unsafe fn patch(location: *mut u8, patch: &[u8]) -> Self {
        let original = std::slice::from_raw_parts(location, patch.len()).to_vec();
        ptr::copy(patch.as_ptr(), location, patch.len());
        Self { original, location }
    }

    /// The bytes that were at the location before patching
    pub fn original(&self) -> &[u8] {
        &self.original
    }
}

unsafe impl PatchGuard for BytePatchGuard {}

// The guard only holds the address; writing back happens under the caller's patching rules
unsafe impl Send for BytePatchGuard {}
unsafe impl Sync for BytePatchGuard {}

impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        unsafe {
            ptr::copy(self.original.as_ptr(), self.location, self.original.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::{PatchGuard, Patcher};

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr, &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed, and the old data kept
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);
        assert_eq!(patch.original(), [1, 2, 3, 4]);

        patch.restore();
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests a partial patch of a block to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr.add(1), &[5, 5]).unwrap() };
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 4) }, [1, 5, 5, 4]);

        // dropping restores as well
        drop(patch);
        assert_eq!(data, [1, 2, 3, 4]);
    }
}
