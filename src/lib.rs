/*!
A parallel filesystem surveyor.

Walks directory trees with raw batched `getdents64` reads on a fixed
reader pool, stats every entry, rolls the results up into per-directory
(group, user, file-type, age) summaries backed by an embedded B-tree
store, and reconciles on-disk ownership and permissions against a rules
file.

The pieces compose left to right:

```text
Walker ─→ Summariser ─→ Aggregator ─→ StoreWriter ─→ Query
   └────→ ChEngine (sibling pipeline, rule-driven chown/chmod)
```

[`survey`] runs the top pipeline end to end for one root and leaves the
queryable per-walk layout on disk.
*/

mod ch;
mod combine;
mod dguta;
mod error;
mod fs;
mod stat;
mod survey;
mod tree;
mod usergroup;
mod walk;

pub use ch::{ChEngine, OwnerSpec, PermAction, PermSpec, Rule, RuleSet};
pub use combine::{concat_stats, merge_group_files, merge_usergroup_files};
pub use dguta::{
    AgeBucket, Aggregator, CHILDREN_DB_FILE, DEFAULT_BATCH_SIZE, DgutaRow, FileTypeClass, Filter,
    GUTA_DB_FILE, GutaKey, GutaValue, Query, SENTINEL_FILE, StoreWriter, Summary, merge_db_dirs,
    write_sentinel,
};
pub use error::{Result, SurveyError};
pub use fs::{
    Dirent, DirReader, FileType, MAX_NAME, MAX_PATH, MAX_PATH_TOTAL, PathBufferPool, RawChild,
    SyscallBuffer, TypeCache,
};
pub use stat::{RowSink, RowWriter, StatRecord, Summariser};
pub use survey::{SurveyConfig, survey};
pub use tree::PrefixTree;
pub use usergroup::{GroupUserRollup, UserGroupRollup};
pub use walk::{
    CancelToken, CounterSnapshot, LogSink, OutputFiles, READER_THREADS, TelemetrySink, WalkCounters,
    Walker, WalkerBuilder,
};

#[cfg(test)]
mod test;

// mimalloc wins over jemalloc and the system allocator for this workload
#[cfg(all(
    feature = "mimalloc",
    any(target_os = "linux", target_os = "macos", target_os = "android")
))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;
