use crate::error::{Result, SurveyError};
use crate::fs::types::getdents64;
use crate::fs::{AlignedBuffer, FileDes, FileType, GETDENTS_BUF_SIZE};
use core::ffi::CStr;
use dashmap::DashMap;
use libc::{AT_SYMLINK_NOFOLLOW, dirent64};
use std::sync::Arc;

/// The kernel read buffer for one reader thread, reused across every
/// directory that thread services.
pub type SyscallBuffer = AlignedBuffer<GETDENTS_BUF_SIZE>;

/**
Resolved types of entries whose filesystem reported `DT_UNKNOWN`, keyed
by (containing directory's device, inode). Scoped to one walk so inode
reuse between walks can never serve a stale type; within a walk it
collapses the repeated `fstatat` calls hardlinks would otherwise cost.
*/
pub type TypeCache = DashMap<(u64, u64), FileType>;

/**
One raw child of a directory, before path assembly.

Only the pieces `getdents64` hands out for free: name, kernel-reported
type, inode. No stat is performed on the hot path; `DT_UNKNOWN` is the
single exception, resolved with `fstatat` against the open directory fd.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChild {
    pub name: Vec<u8>,
    pub file_type: FileType,
    pub inode: u64,
}

/**
Batched `getdents64` reader over a single open directory.

Drains the kernel a buffer at a time into a caller-owned buffer and
yields children one [`RawChild`] per call, filtering `.`, `..` and
inode-0 entries. The fd is closed when the reader drops.

The `dirent64` records in the buffer are variable-length and must never
be materialised by value; all field reads go through raw-pointer
projections of the record's start address (the same discipline std's
`read_dir` uses).
*/
pub struct DirReader<'b> {
    fd: FileDes,
    dev: u64,
    buf: &'b mut SyscallBuffer,
    type_cache: Option<Arc<TypeCache>>,
    offset: usize,
    remaining: usize,
    end_of_stream: bool,
    /// Telemetry harvested by the walker once the directory is drained.
    pub read_calls: u64,
    pub read_bytes: u64,
    pub stat_fallbacks: u64,
}

impl<'b> DirReader<'b> {
    /// Opens `path` (no trailing slash) for raw directory reads through
    /// the given reusable buffer.
    pub fn open(path: &[u8], buf: &'b mut SyscallBuffer) -> Result<Self> {
        let fd = FileDes::open_dir(path)?;

        let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is open and st is a valid out-pointer
        let rc = unsafe { libc::fstat(fd.raw(), st.as_mut_ptr()) };
        if rc != 0 {
            return Err(SurveyError::last_os_error(path));
        }
        // SAFETY: fstat succeeded, so st is initialised
        let dev = unsafe { st.assume_init() }.st_dev;

        Ok(Self {
            fd,
            dev,
            buf,
            type_cache: None,
            offset: 0,
            remaining: 0,
            end_of_stream: false,
            read_calls: 0,
            read_bytes: 0,
            stat_fallbacks: 0,
        })
    }

    /// Shares a walk-scoped cache of `DT_UNKNOWN` resolutions.
    #[must_use]
    pub fn with_type_cache(mut self, cache: Arc<TypeCache>) -> Self {
        self.type_cache = Some(cache);
        self
    }

    /// Refills the buffer. Returns false at end of directory.
    fn fill(&mut self) -> Result<bool> {
        if self.end_of_stream {
            return Ok(false);
        }

        // SAFETY: the buffer is valid for writes of its full capacity
        let n = unsafe { getdents64(self.fd.raw(), self.buf.as_mut_ptr(), self.buf.capacity()) };
        self.read_calls += 1;

        if n < 0 {
            self.end_of_stream = true;
            return Err(SurveyError::io(b"", std::io::Error::last_os_error()));
        }
        if n == 0 {
            self.end_of_stream = true;
            return Ok(false);
        }

        self.remaining = n as usize;
        self.read_bytes += n as u64;
        self.offset = 0;
        Ok(true)
    }

    /**
    Yields the next child, or `None` at end of directory.

    `.`/`..` and inode-0 (deleted-but-listed) entries are filtered here
    so callers only ever see real children.
    */
    pub fn next_child(&mut self) -> Result<Option<RawChild>> {
        loop {
            if self.offset >= self.remaining && !self.fill()? {
                return Ok(None);
            }

            while self.offset < self.remaining {
                // SAFETY: offset always sits on a record boundary within the
                // filled prefix; the kernel guarantees well-formed records
                let d = unsafe { self.buf.as_ptr().add(self.offset) } as *const dirent64;
                debug_assert!(d as usize % 8 == 0, "dirent record misaligned");

                // SAFETY: d points at a complete record (see above)
                let reclen = unsafe { (*d).d_reclen } as usize;
                self.offset += reclen;

                // SAFETY: as above
                let inode = unsafe { (*d).d_ino };
                // SAFETY: d_name is NUL-terminated within the record
                let name_ptr = unsafe { &raw const (*d).d_name }.cast::<u8>();
                // SAFETY: as above
                let name = unsafe { CStr::from_ptr(name_ptr.cast()) }.to_bytes();

                if inode == 0 || name == b"." || name == b".." {
                    continue;
                }

                // SAFETY: as above
                let dtype = unsafe { (*d).d_type };
                let file_type = match FileType::from_dtype(dtype) {
                    FileType::Unknown => self.resolve_unknown(name_ptr, inode),
                    known => known,
                };

                return Ok(Some(RawChild {
                    name: name.to_vec(),
                    file_type,
                    inode,
                }));
            }
        }
    }

    /**
    `fstatat` fallback for filesystems that report `DT_UNKNOWN`, going
    through the walk's type cache when one is attached.

    Stays `Unknown` when even the stat fails; the consumer decides what
    to do with such entries.
    */
    fn resolve_unknown(&mut self, name_ptr: *const u8, inode: u64) -> FileType {
        let key = (self.dev, inode);
        if let Some(cache) = self.type_cache.as_ref()
            && let Some(known) = cache.get(&key)
        {
            return *known;
        }

        self.stat_fallbacks += 1;

        let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: name_ptr is NUL-terminated inside the live record buffer
        // and the fd is an open directory
        let rc = unsafe {
            libc::fstatat(
                self.fd.raw(),
                name_ptr.cast(),
                st.as_mut_ptr(),
                AT_SYMLINK_NOFOLLOW,
            )
        };

        if rc != 0 {
            return FileType::Unknown;
        }

        // SAFETY: fstatat succeeded, so st is initialised
        let file_type = FileType::from_mode(unsafe { st.assume_init() }.st_mode);
        if let Some(cache) = self.type_cache.as_ref() {
            cache.insert(key, file_type);
        }
        file_type
    }
}
