use crate::dguta::row::DgutaRow;
use crate::dguta::types::{AgeBucket, GutaKey, GutaValue};
use std::collections::{BTreeMap, BTreeSet};

/// Strips a directory key's trailing slash; `/` stays itself.
pub(crate) fn normalise_dir(dir: &[u8]) -> &[u8] {
    match dir {
        [rest @ .., b'/'] if !rest.is_empty() => rest,
        whole => whole,
    }
}

/**
In-memory rollup of one shard's row stream.

Merges rows per directory and per (gid, uid, file-type, age) key:
count and size add, atime keeps the minimum, mtime the maximum. Rows in
the `All` bucket fan out to every threshold bucket their clocks satisfy,
measured against the aggregator's fixed reference time; rows carrying an
explicit bucket merge into exactly that bucket.

Keys are held in ordered maps so the store writer can insert them in
sorted order without a separate sort pass. The parent → children index is
maintained alongside.
*/
#[derive(Debug)]
pub struct Aggregator {
    now: i64,
    dirs: BTreeMap<Vec<u8>, BTreeMap<GutaKey, GutaValue>>,
    children: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
}

impl Aggregator {
    /// An aggregator whose age fanout is measured from the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_reference_time(chrono::Utc::now().timestamp())
    }

    /// Fixed reference time, for deterministic aggregation and tests.
    #[must_use]
    pub const fn with_reference_time(now: i64) -> Self {
        Self {
            now,
            dirs: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn reference_time(&self) -> i64 {
        self.now
    }

    /// Number of distinct directories aggregated so far.
    #[must_use]
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    /// Merges one row, fanning out `All` rows across age buckets.
    pub fn add_row(&mut self, row: &DgutaRow) {
        let dir = normalise_dir(&row.dir).to_vec();
        let value = GutaValue::new(row.count, row.size, row.atime, row.mtime);
        let gutas = self.dirs.entry(dir).or_default();

        let mut merge_into = |age: AgeBucket| {
            let key = GutaKey {
                gid: row.gid,
                uid: row.uid,
                file_type: row.file_type,
                age,
            };
            gutas
                .entry(key)
                .and_modify(|v| v.merge(&value))
                .or_insert(value);
        };

        if row.age == AgeBucket::All {
            for bucket in AgeBucket::fanout(self.now, row.atime, row.mtime) {
                merge_into(bucket);
            }
        } else {
            merge_into(row.age);
        }
    }

    /// Records `child` as an immediate child directory of `parent`.
    pub fn note_child(&mut self, parent: &[u8], child: &[u8]) {
        self.children
            .entry(normalise_dir(parent).to_vec())
            .or_default()
            .insert(normalise_dir(child).to_vec());
    }

    /// Hands the sorted rollups and children index to the store writer.
    #[must_use]
    pub(crate) fn into_parts(
        self,
    ) -> (
        BTreeMap<Vec<u8>, BTreeMap<GutaKey, GutaValue>>,
        BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
    ) {
        (self.dirs, self.children)
    }

    /// Re-serialises the current state as explicit-bucket rows, sorted.
    #[must_use]
    pub fn to_rows(&self) -> Vec<DgutaRow> {
        let mut rows = Vec::new();
        for (dir, gutas) in &self.dirs {
            for (key, value) in gutas {
                rows.push(DgutaRow {
                    dir: dir.clone(),
                    gid: key.gid,
                    uid: key.uid,
                    file_type: key.file_type,
                    age: key.age,
                    count: value.count,
                    size: value.size,
                    atime: value.atime,
                    mtime: value.mtime,
                });
            }
        }
        rows
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}
