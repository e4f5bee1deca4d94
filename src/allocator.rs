//! Anonymous shared-memory allocation for tables shared with the engine.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("failed to create shared memory region: {0}")]
    Create(#[source] io::Error),
    #[error("failed to size shared memory region: {0}")]
    Resize(#[source] nix::Error),
}

/// Allocator for fixed-size regions handed to the engine by descriptor, such
/// as the lens-shading table.
pub trait TableAllocator {
    fn alloc(&self, name: &str, len: usize) -> Result<OwnedFd, AllocError>;
}

/// Table allocation backed by `memfd_create`.
pub struct MemfdAllocator;

impl TableAllocator for MemfdAllocator {
    fn alloc(&self, name: &str, len: usize) -> Result<OwnedFd, AllocError> {
        let c_name = CString::new(name)
            .map_err(|_| AllocError::Create(io::ErrorKind::InvalidInput.into()))?;

        let raw = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(AllocError::Create(io::Error::last_os_error()));
        }
        // memfd_create returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        nix::unistd::ftruncate(&fd, len as libc::off_t).map_err(AllocError::Resize)?;
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_region_has_requested_size() {
        let fd = MemfdAllocator.alloc("test-table", 32 << 10).unwrap();
        let stat = nix::sys::stat::fstat(&fd).unwrap();
        assert_eq!(stat.st_size, 32 << 10);
    }

    #[test]
    fn embedded_nul_in_name_is_rejected() {
        let err = MemfdAllocator.alloc("bad\0name", 64).unwrap_err();
        assert!(matches!(err, AllocError::Create(_)));
    }
}
