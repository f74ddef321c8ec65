use crate::dguta::aggregate::normalise_dir;
use crate::dguta::store::{
    CHILDREN_DB_FILE, CHILDREN_TABLE, GUTA_DB_FILE, GUTA_TABLE, decode_children, decode_gutas,
};
use crate::dguta::types::{AgeBucket, FileTypeClass, GutaKey, GutaValue};
use crate::error::{Result, SurveyError};
use redb::Database;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/**
Conjunctive query filter with empty-set-means-wildcard semantics.

A tuple passes when its gid, uid and file type are each either contained
in the corresponding set or that set is empty, and its age bucket equals
the requested one (`None` means `All`). There is no negation or
disjunction by design.
*/
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub gids: Vec<u32>,
    pub uids: Vec<u32>,
    pub file_types: Vec<FileTypeClass>,
    pub age: Option<AgeBucket>,
}

impl Filter {
    #[must_use]
    fn age_bucket(&self) -> AgeBucket {
        self.age.unwrap_or(AgeBucket::All)
    }

    fn passes(&self, key: &GutaKey) -> bool {
        (self.gids.is_empty() || self.gids.contains(&key.gid))
            && (self.uids.is_empty() || self.uids.contains(&key.uid))
            && (self.file_types.is_empty() || self.file_types.contains(&key.file_type))
            && key.age == self.age_bucket()
    }
}

/// The answer to a filtered subtree query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub count: u64,
    pub size: u64,
    /// Minimum atime across surviving tuples; 0 when none survive.
    pub atime: i64,
    /// Maximum mtime across surviving tuples; 0 when none survive.
    pub mtime: i64,
    /// Sorted distinct uids surviving the filter.
    pub uids: Vec<u32>,
    /// Sorted distinct gids surviving the filter.
    pub gids: Vec<u32>,
    /// Sorted distinct file types surviving the filter.
    pub file_types: Vec<FileTypeClass>,
}

/**
Read side of the rollup index: one or more shards opened together.

Every lookup unions tuples across all shards before filtering; where
shards disagree on a key's clocks, the union keeps the minimum atime and
maximum mtime. Reads are against immutable stores and are sequentially
consistent.
*/
pub struct Query {
    shards: Vec<Shard>,
}

struct Shard {
    guta: Database,
    children: Database,
}

impl Query {
    /**
    Opens the store pairs under each given shard directory.

    # Errors
    `Store` when any database is missing or corrupt; a corrupt store is
    fatal rather than skipped.
    */
    pub fn open<P: AsRef<Path>>(shard_dirs: &[P]) -> Result<Self> {
        let mut shards = Vec::with_capacity(shard_dirs.len());
        for dir in shard_dirs {
            let dir = dir.as_ref();
            shards.push(Shard {
                guta: Database::open(dir.join(GUTA_DB_FILE))?,
                children: Database::open(dir.join(CHILDREN_DB_FILE))?,
            });
        }
        Ok(Self { shards })
    }

    /**
    Looks up `dir` across all shards, unions its tuples, applies the
    filter and summarises what survives.

    # Errors
    `NotFound` when no shard knows the directory.
    */
    pub fn dir_info(&self, dir: &[u8], filter: &Filter) -> Result<Summary> {
        let key = normalise_dir(dir);
        let mut merged: BTreeMap<GutaKey, GutaValue> = BTreeMap::new();
        let mut found = false;

        for shard in &self.shards {
            let txn = shard.guta.begin_read()?;
            let table = txn.open_table(GUTA_TABLE)?;
            let Some(value) = table.get(key)? else {
                continue;
            };
            found = true;
            for (k, v) in decode_gutas(value.value())? {
                merged.entry(k).and_modify(|cur| cur.merge(&v)).or_insert(v);
            }
        }

        if !found {
            return Err(SurveyError::NotFound(key.into()));
        }

        let mut summary = Summary::default();
        let mut uids = BTreeSet::new();
        let mut gids = BTreeSet::new();
        let mut file_types = BTreeSet::new();
        let mut first = true;

        for (k, v) in merged.iter().filter(|(k, _)| filter.passes(k)) {
            summary.count += v.count;
            summary.size += v.size;
            if first {
                summary.atime = v.atime;
                summary.mtime = v.mtime;
                first = false;
            } else {
                summary.atime = summary.atime.min(v.atime);
                summary.mtime = summary.mtime.max(v.mtime);
            }
            uids.insert(k.uid);
            gids.insert(k.gid);
            file_types.insert(k.file_type);
        }

        summary.uids = uids.into_iter().collect();
        summary.gids = gids.into_iter().collect();
        summary.file_types = file_types.into_iter().collect();
        Ok(summary)
    }

    /**
    The immediate child directories recorded for `dir`, unioned across
    shards, sorted and deduplicated. Empty when no shard knows the
    directory; unlike [`dir_info`](Self::dir_info) this is not an error.
    */
    pub fn children(&self, dir: &[u8]) -> Result<Vec<Vec<u8>>> {
        let key = normalise_dir(dir);
        let mut out = BTreeSet::new();

        for shard in &self.shards {
            let txn = shard.children.begin_read()?;
            let table = txn.open_table(CHILDREN_TABLE)?;
            if let Some(value) = table.get(key)? {
                out.extend(decode_children(value.value())?);
            }
        }

        Ok(out.into_iter().collect())
    }
}
