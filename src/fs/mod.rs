mod buffer;
mod dir_entry;
mod file_type;
mod iter;
mod pool;
mod types;

pub use buffer::AlignedBuffer;
pub use dir_entry::Dirent;
pub use file_type::FileType;
pub use iter::{DirReader, RawChild, SyscallBuffer, TypeCache};
pub use pool::PathBufferPool;
pub(crate) use types::lstat;
pub use types::{FileDes, GETDENTS_BUF_SIZE, MAX_NAME, MAX_PATH, MAX_PATH_TOTAL};
