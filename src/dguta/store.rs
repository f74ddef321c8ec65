use crate::dguta::aggregate::Aggregator;
use crate::dguta::types::{GutaKey, GutaValue};
use crate::error::{Result, SurveyError};
use redb::{Database, TableDefinition};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// File names of one shard's store pair.
pub const GUTA_DB_FILE: &str = "dguta.db";
pub const CHILDREN_DB_FILE: &str = "children.db";

/// Sentinel created once a walk's databases are complete.
pub const SENTINEL_FILE: &str = ".dgut.dbs.updated";

/// Directories committed per write transaction unless overridden.
pub const DEFAULT_BATCH_SIZE: u32 = 10_000;

pub(crate) const GUTA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("guta");
pub(crate) const CHILDREN_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("children");

pub(crate) fn encode_gutas(gutas: &BTreeMap<GutaKey, GutaValue>) -> Result<Vec<u8>> {
    let tuples: Vec<(GutaKey, GutaValue)> = gutas.iter().map(|(k, v)| (*k, *v)).collect();
    bincode::serialize(&tuples).map_err(|e| SurveyError::Store(e.to_string()))
}

pub(crate) fn decode_gutas(bytes: &[u8]) -> Result<Vec<(GutaKey, GutaValue)>> {
    bincode::deserialize(bytes).map_err(|e| SurveyError::Store(e.to_string()))
}

pub(crate) fn encode_children(children: &BTreeSet<Vec<u8>>) -> Result<Vec<u8>> {
    let list: Vec<&[u8]> = children.iter().map(Vec::as_slice).collect();
    bincode::serialize(&list).map_err(|e| SurveyError::Store(e.to_string()))
}

pub(crate) fn decode_children(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    bincode::deserialize(bytes).map_err(|e| SurveyError::Store(e.to_string()))
}

/**
Writes one shard: a GUTA store and a children store under `dir`.

Both are embedded B-tree databases. Keys (directory paths) arrive from
the aggregator's ordered maps, so insertion happens in sorted order, and
commits are batched: [`DEFAULT_BATCH_SIZE`] directories per write
transaction unless configured otherwise.

Storing into a directory that already holds a GUTA file is refused with
`AlreadyExists`; merging shards is a separate operation
([`merge_db_dirs`]).
*/
pub struct StoreWriter {
    guta: Database,
    children: Database,
    batch_size: usize,
}

impl StoreWriter {
    /**
    Creates the store pair under `dir`.

    # Errors
    `AlreadyExists` when the GUTA file is already present; `Store` when
    either database cannot be created.
    */
    pub fn create(dir: &Path, batch_size: Option<u32>) -> Result<Self> {
        let guta_path = dir.join(GUTA_DB_FILE);
        if guta_path.exists() {
            return Err(SurveyError::AlreadyExists(guta_path));
        }

        Ok(Self {
            guta: Database::create(&guta_path)?,
            children: Database::create(dir.join(CHILDREN_DB_FILE))?,
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1) as usize,
        })
    }

    /// Persists the aggregator's rollups and children index.
    pub fn store(self, agg: Aggregator) -> Result<()> {
        let (dirs, children) = agg.into_parts();

        let guta_entries: Vec<(Vec<u8>, Vec<u8>)> = dirs
            .iter()
            .map(|(dir, gutas)| Ok((dir.clone(), encode_gutas(gutas)?)))
            .collect::<Result<_>>()?;
        Self::write_batched(&self.guta, GUTA_TABLE, &guta_entries, self.batch_size)?;

        let child_entries: Vec<(Vec<u8>, Vec<u8>)> = children
            .iter()
            .map(|(dir, kids)| Ok((dir.clone(), encode_children(kids)?)))
            .collect::<Result<_>>()?;
        Self::write_batched(&self.children, CHILDREN_TABLE, &child_entries, self.batch_size)?;

        log::info!(
            "stored rollups for {} directories ({} with children)",
            guta_entries.len(),
            child_entries.len()
        );

        Ok(())
    }

    fn write_batched(
        db: &Database,
        table: TableDefinition<'static, &'static [u8], &'static [u8]>,
        entries: &[(Vec<u8>, Vec<u8>)],
        batch_size: usize,
    ) -> Result<()> {
        // An empty commit still creates the table so readers can open it.
        if entries.is_empty() {
            let txn = db.begin_write()?;
            txn.open_table(table)?;
            txn.commit()?;
            return Ok(());
        }

        for batch in entries.chunks(batch_size) {
            let txn = db.begin_write()?;
            {
                let mut t = txn.open_table(table)?;
                for (key, value) in batch {
                    t.insert(key.as_slice(), value.as_slice())?;
                }
            }
            txn.commit()?;
            log::debug!("committed batch of {} keys", batch.len());
        }

        Ok(())
    }
}

/**
Creates the `.dgut.dbs.updated` sentinel in `dir`, stamped with the
minimum mtime across the walk log files (`walk.*`) there, so downstream
consumers can tell which walk the databases describe.
*/
pub fn write_sentinel(dir: &Path) -> Result<()> {
    let dir_bytes = dir.as_os_str().as_encoded_bytes();
    let mut min_mtime: Option<(i64, i64)> = None;

    for entry in std::fs::read_dir(dir).map_err(|e| SurveyError::io(dir_bytes, e))? {
        let entry = entry.map_err(|e| SurveyError::io(dir_bytes, e))?;
        if !entry.file_name().as_encoded_bytes().starts_with(b"walk.") {
            continue;
        }
        let st = crate::fs::lstat(entry.path().as_os_str().as_encoded_bytes())?;
        let stamp = (st.st_mtime, st.st_mtime_nsec);
        min_mtime = Some(min_mtime.map_or(stamp, |cur| cur.min(stamp)));
    }

    let sentinel = dir.join(SENTINEL_FILE);
    std::fs::File::create(&sentinel)
        .map_err(|e| SurveyError::io(sentinel.as_os_str().as_encoded_bytes(), e))?;

    if let Some((secs, nsecs)) = min_mtime {
        let mut cpath = sentinel.as_os_str().as_encoded_bytes().to_vec();
        cpath.push(0);
        let times = [
            libc::timespec {
                tv_sec: secs,
                tv_nsec: nsecs,
            },
            libc::timespec {
                tv_sec: secs,
                tv_nsec: nsecs,
            },
        ];
        // SAFETY: cpath is NUL-terminated and times points at two timespecs
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr().cast(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(SurveyError::last_os_error(
                sentinel.as_os_str().as_encoded_bytes(),
            ));
        }
    }

    Ok(())
}

/**
Merges the numbered shard subdirectories of `src` into `dst`.

Each numbered subdirectory of `src` is copied to a temporary name on the
destination filesystem and then renamed atomically to the next free
number in `dst`, so a concurrent reader of `dst` never observes a
half-copied shard.
*/
pub fn merge_db_dirs(src: &Path, dst: &Path) -> Result<()> {
    let dst_bytes = dst.as_os_str().as_encoded_bytes();

    let mut next = next_free_number(dst)?;
    let mut sources = numbered_subdirs(src)?;
    sources.sort_by_key(|(n, _)| *n);

    for (_, src_dir) in sources {
        let staging = dst.join(format!(".merge.{next}"));
        copy_dir_all(&src_dir, &staging)?;

        let target = dst.join(next.to_string());
        std::fs::rename(&staging, &target).map_err(|e| SurveyError::io(dst_bytes, e))?;
        log::info!(
            "merged shard {} as {}",
            src_dir.display(),
            target.display()
        );
        next += 1;
    }

    Ok(())
}

fn numbered_subdirs(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let dir_bytes = dir.as_os_str().as_encoded_bytes();
    let mut out = Vec::new();

    for entry in std::fs::read_dir(dir).map_err(|e| SurveyError::io(dir_bytes, e))? {
        let entry = entry.map_err(|e| SurveyError::io(dir_bytes, e))?;
        let name = entry.file_name();
        if let Some(n) = name.to_str().and_then(|s| s.parse::<u64>().ok())
            && entry.path().is_dir()
        {
            out.push((n, entry.path()));
        }
    }

    Ok(out)
}

fn next_free_number(dir: &Path) -> Result<u64> {
    Ok(numbered_subdirs(dir)?
        .iter()
        .map(|(n, _)| n + 1)
        .max()
        .unwrap_or(0))
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    let src_bytes = src.as_os_str().as_encoded_bytes();
    std::fs::create_dir_all(dst).map_err(|e| SurveyError::io(src_bytes, e))?;

    for entry in std::fs::read_dir(src).map_err(|e| SurveyError::io(src_bytes, e))? {
        let entry = entry.map_err(|e| SurveyError::io(src_bytes, e))?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| SurveyError::io(src_bytes, e))?;
        }
    }

    Ok(())
}
