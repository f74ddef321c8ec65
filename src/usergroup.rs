use crate::error::{Result, SurveyError};
use crate::fs::FileType;
use crate::stat::StatRecord;
use memchr::memrchr;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

/// uid/gid → name with numeric fallback, memoised per rollup.
#[derive(Debug, Default)]
struct NameCache {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl NameCache {
    fn user(&mut self, uid: u32) -> &str {
        self.users.entry(uid).or_insert_with(|| {
            uzers::get_user_by_uid(uid)
                .map(|u| u.name().to_string_lossy().into_owned())
                .unwrap_or_else(|| uid.to_string())
        })
    }

    fn group(&mut self, gid: u32) -> &str {
        self.groups.entry(gid).or_insert_with(|| {
            uzers::get_group_by_gid(gid)
                .map(|g| g.name().to_string_lossy().into_owned())
                .unwrap_or_else(|| gid.to_string())
        })
    }
}

/// Parent directory of a slash-free path; `/a` and `/` both yield `/`.
fn parent_dir(path: &[u8]) -> &[u8] {
    match memrchr(b'/', path) {
        Some(0) | None => b"/",
        Some(pos) => &path[..pos],
    }
}

/**
Per-(user, group, directory) file rollup over a stat-record stream.

Every non-directory record contributes its count and size to each
ancestor directory from its parent up to and including the walk root.
The output is one sorted tab-separated line per key:

```text
username \t groupname \t directory \t count \t size
```

Directory bytes are written raw rather than base64: this output is for
humans and awk, and readable names matter more than newline-safety.
*/
#[derive(Debug)]
pub struct UserGroupRollup {
    root: Vec<u8>,
    totals: BTreeMap<(u32, u32, Vec<u8>), (u64, u64)>,
}

impl UserGroupRollup {
    #[must_use]
    pub fn new(root: &[u8]) -> Self {
        let mut root = root.to_vec();
        while root.len() > 1 && root.last() == Some(&b'/') {
            root.pop();
        }
        Self {
            root,
            totals: BTreeMap::new(),
        }
    }

    /// Folds one stat record in; directories themselves are not counted.
    pub fn add_record(&mut self, record: &StatRecord) {
        if record.file_type == FileType::Directory {
            return;
        }

        let path: &[u8] = match record.path.as_slice() {
            [rest @ .., b'/'] if !rest.is_empty() => rest,
            whole => whole,
        };

        let mut dir = parent_dir(path);
        if !dir.starts_with(&self.root) {
            return;
        }

        let size = record.size.max(0) as u64;
        loop {
            let key = (record.uid, record.gid, dir.to_vec());
            let entry = self.totals.entry(key).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += size;

            if dir == self.root.as_slice() || dir == b"/" {
                break;
            }
            dir = parent_dir(dir);
        }
    }

    /// Writes the sorted rollup lines.
    pub fn write<W: Write>(&self, mut out: W) -> Result<()> {
        let mut names = NameCache::default();
        for ((uid, gid, dir), (count, size)) in &self.totals {
            let user = names.user(*uid).to_owned();
            let group = names.group(*gid);
            let mut line = Vec::with_capacity(dir.len() + 64);
            line.extend_from_slice(user.as_bytes());
            line.push(b'\t');
            line.extend_from_slice(group.as_bytes());
            line.push(b'\t');
            line.extend_from_slice(dir);
            line.extend_from_slice(format!("\t{count}\t{size}\n").as_bytes());
            out.write_all(&line).map_err(|e| SurveyError::io(dir, e))?;
        }
        Ok(())
    }
}

/**
Whole-walk totals per (group, user): one sorted line per pair,

```text
groupname \t username \t count \t size
```

the compact complement of [`UserGroupRollup`] when only "who holds how
much" matters.
*/
#[derive(Debug, Default)]
pub struct GroupUserRollup {
    totals: BTreeMap<(u32, u32), (u64, u64)>,
}

impl GroupUserRollup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one stat record in; directories themselves are not counted.
    pub fn add_record(&mut self, record: &StatRecord) {
        if record.file_type == FileType::Directory {
            return;
        }
        let entry = self.totals.entry((record.gid, record.uid)).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += record.size.max(0) as u64;
    }

    /// Writes the sorted totals.
    pub fn write<W: Write>(&self, mut out: W) -> Result<()> {
        let mut names = NameCache::default();
        for ((gid, uid), (count, size)) in &self.totals {
            let group = names.group(*gid).to_owned();
            let user = names.user(*uid);
            let line = format!("{group}\t{user}\t{count}\t{size}\n");
            out.write_all(line.as_bytes()).map_err(SurveyError::from)?;
        }
        Ok(())
    }
}
