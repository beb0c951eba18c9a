//! A robust, process-shared mutex living inside a shared-memory region.
//!
//! The mutex occupies the first bytes of every buffer region and is the only
//! cross-process synchronization primitive in the runtime. It is configured
//! error-checking (double acquire reports `EDEADLK`, foreign release reports
//! `EPERM`) and robust: when a peer process dies holding the lock, the next
//! acquirer observes `EOWNERDEAD`, marks the state consistent and proceeds.

use std::mem;
use std::time::Duration;

use thiserror::Error;

/// Mutex failure modes, by the errno that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    /// `EINVAL`: the mutex memory has not been initialized yet. Seen briefly
    /// by a process that attached to a region while its creator was still
    /// setting up; callers retry.
    #[error("mutex is not initialized")]
    Uninitialized,
    /// `EDEADLK`: this thread already holds the lock.
    #[error("mutex already held by caller")]
    Deadlock,
    /// `EPERM`: releasing a lock held by someone else (or nobody).
    #[error("mutex not held by caller")]
    NotOwner,
    /// `ETIMEDOUT`: the acquire deadline passed.
    #[error("timed out acquiring mutex")]
    TimedOut,
    /// `EBUSY`: a zero-timeout acquire found the lock held.
    #[error("mutex is busy")]
    Busy,
    #[error("mutex operation failed (errno {0})")]
    Other(i32),
}

impl SyncError {
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => Self::Uninitialized,
            libc::EDEADLK => Self::Deadlock,
            libc::EPERM => Self::NotOwner,
            libc::ETIMEDOUT => Self::TimedOut,
            libc::EBUSY => Self::Busy,
            other => Self::Other(other),
        }
    }
}

/// Handle to a `pthread_mutex_t` placed at a fixed shared-memory address.
///
/// The handle does not own the memory; the region that contains it does.
#[derive(Debug, Clone, Copy)]
pub struct SharedMutex {
    mutex: *mut libc::pthread_mutex_t,
}

// Access is mediated entirely by pthreads, which is the point.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Bytes the mutex occupies at the head of a region.
    pub const fn size() -> usize {
        mem::size_of::<libc::pthread_mutex_t>()
    }

    /// Wrap the mutex at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to at least [`SharedMutex::size`] bytes of writable
    /// memory, suitably aligned, that outlive the handle.
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        Self {
            mutex: ptr.cast::<libc::pthread_mutex_t>(),
        }
    }

    /// Initialize the mutex. Only the process that created the region does
    /// this; attachers use the memory as-is.
    pub fn initialize(&self) -> Result<(), SyncError> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            let rc = libc::pthread_mutexattr_init(&mut attr);
            if rc != 0 {
                return Err(SyncError::from_errno(rc));
            }
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK);
            let rc = libc::pthread_mutex_init(self.mutex, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(SyncError::from_errno(rc));
            }
        }
        Ok(())
    }

    pub fn destroy(&self) {
        unsafe {
            libc::pthread_mutex_destroy(self.mutex);
        }
    }

    /// Acquire the lock.
    ///
    /// `None` blocks indefinitely, `Some(ZERO)` try-locks, anything else
    /// waits until the deadline. A dead previous owner (`EOWNERDEAD`) is
    /// recovered transparently.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<(), SyncError> {
        let rc = unsafe {
            match timeout {
                None => libc::pthread_mutex_lock(self.mutex),
                Some(timeout) if timeout.is_zero() => libc::pthread_mutex_trylock(self.mutex),
                Some(timeout) => {
                    let deadline = deadline_timespec(timeout);
                    libc::pthread_mutex_timedlock(self.mutex, &deadline)
                }
            }
        };
        match rc {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                unsafe {
                    libc::pthread_mutex_consistent(self.mutex);
                }
                Ok(())
            }
            errno => Err(SyncError::from_errno(errno)),
        }
    }

    pub fn release(&self) -> Result<(), SyncError> {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex) };
        if rc != 0 {
            return Err(SyncError::from_errno(rc));
        }
        Ok(())
    }
}

fn deadline_timespec(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    }
}
