//! POSIX shared-memory regions (`shm_open`/`mmap`/`shm_unlink`).

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::BufferError;

/// A mapped shared-memory region addressed by name.
///
/// The first `open(create=true)` creates and sizes the object; later opens
/// attach to it. The mapping is released on drop; the name is removed only by
/// [`ShmRegion::unlink`], after which the memory is freed once the last
/// mapping goes away.
#[derive(Debug)]
pub struct ShmRegion {
    name: String,
    base: *mut u8,
    size: usize,
    created: bool,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn shm_path(name: &str) -> CString {
    CString::new(format!("/{name}")).expect("shm names contain no NUL")
}

impl ShmRegion {
    pub fn open(name: &str, size: usize, create: bool) -> Result<Self, BufferError> {
        let path = shm_path(name);
        let mut created = false;
        let mut fd = -1;
        if create {
            fd = unsafe {
                libc::shm_open(
                    path.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    0o600,
                )
            };
            if fd >= 0 {
                created = true;
            } else if io::Error::last_os_error().raw_os_error() != Some(libc::EEXIST) {
                return Err(BufferError::Os(io::Error::last_os_error()));
            }
        }
        if fd < 0 {
            fd = unsafe { libc::shm_open(path.as_ptr(), libc::O_RDWR, 0o600) };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOENT) {
                    return Err(BufferError::NoSuchRegion {
                        name: name.to_owned(),
                    });
                }
                return Err(BufferError::Os(err));
            }
        }
        if created && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(path.as_ptr());
            }
            return Err(BufferError::Os(err));
        }
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe {
            libc::close(fd);
        }
        if base == libc::MAP_FAILED {
            return Err(BufferError::Os(io::Error::last_os_error()));
        }
        Ok(Self {
            name: name.to_owned(),
            base: base.cast(),
            size,
            created,
        })
    }

    /// Whether this handle created the underlying object (and therefore owns
    /// mutex initialization).
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Remove the name. Existing mappings stay usable; the kernel frees the
    /// memory when the last one unmaps. Missing names are ignored.
    pub fn unlink(name: &str) {
        let path = shm_path(name);
        unsafe {
            libc::shm_unlink(path.as_ptr());
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}
