use crate::error::{Result, SurveyError};

/// Longest absolute directory path we will construct, matching `PATH_MAX`.
pub const MAX_PATH: usize = 4096;

/// Longest single filename component, matching common filesystem limits.
pub const MAX_NAME: usize = 255;

/// Hard ceiling for an absolute path plus one component plus its NUL.
/// Paths that would exceed this abort only the offending subtree.
pub const MAX_PATH_TOTAL: usize = MAX_PATH + MAX_NAME + 1; // 4352

/// Kernel buffer size for batched `getdents64` reads. One read of this size
/// drains small and medium directories in a single system call.
pub const GETDENTS_BUF_SIZE: usize = 8 * 4096;

/**
An owned directory file descriptor.

Closes on drop, so a reader that bails out of a directory early can never
leak the fd. The walker opens one of these per directory request.
*/
#[derive(Debug)]
#[repr(transparent)]
pub struct FileDes(pub(crate) i32);

impl FileDes {
    /**
    Opens `path` (a NUL-free byte path) as a directory fd.

    `O_NOFOLLOW` keeps the contract that symbolic links are never followed:
    a directory request that races with a symlink swap fails here instead of
    escaping the tree.
    */
    pub fn open_dir(path: &[u8]) -> Result<Self> {
        let mut cpath = Vec::with_capacity(path.len() + 1);
        cpath.extend_from_slice(path);
        cpath.push(0);

        // SAFETY: cpath is NUL-terminated and outlives the call
        let fd = unsafe {
            libc::open(
                cpath.as_ptr().cast(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
            )
        };

        if fd < 0 {
            return Err(SurveyError::last_os_error(path));
        }

        Ok(Self(fd))
    }

    /// Returns the raw fd for syscalls that take one.
    #[must_use]
    #[inline]
    pub const fn raw(&self) -> i32 {
        self.0
    }
}

impl Drop for FileDes {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: we own the fd and close it exactly once
        unsafe { libc::close(self.0) };
    }
}

/// `lstat` on a raw byte path. Symlinks are statted, never followed.
pub(crate) fn lstat(path: &[u8]) -> Result<libc::stat> {
    let mut cpath = Vec::with_capacity(path.len() + 1);
    cpath.extend_from_slice(path);
    cpath.push(0);

    let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: cpath is NUL-terminated and st is a valid out-pointer
    let rc = unsafe { libc::lstat(cpath.as_ptr().cast(), st.as_mut_ptr()) };
    if rc != 0 {
        return Err(SurveyError::last_os_error(path));
    }

    // SAFETY: lstat succeeded, so st is initialised
    Ok(unsafe { st.assume_init() })
}

/**
Raw `getdents64` wrapper.

# Safety
`buffer_ptr` must be valid for writes of `buffer_size` bytes and `fd` must
be an open directory descriptor.

# Returns
- Positive: number of bytes of packed `dirent64` records written
- 0: end of directory
- Negative: error (consult `errno`)
*/
#[inline]
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) unsafe fn getdents64(fd: i32, buffer_ptr: *mut u8, buffer_size: usize) -> isize {
    // SAFETY: forwarded preconditions; the syscall itself has no further requirements
    unsafe { libc::syscall(libc::SYS_getdents64, fd, buffer_ptr, buffer_size) as isize }
}
