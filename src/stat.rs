use crate::dguta::{DgutaRow, FileTypeClass};
use crate::error::{Result, SurveyError};
use crate::fs::{Dirent, FileType, lstat};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use memchr::memrchr;
use std::io::Write;

/**
Full metadata for one surveyed path.

The wire form (one tab-separated, newline-terminated line) is

```text
base64(path) \t size \t uid \t gid \t atime \t mtime \t ctime \t type-char \t inode \t entry_count \t dev
```

with the path base64url-encoded (no padding) so whitespace and newlines
in names cannot corrupt the stream. `mode` and `nlink` ride along in
memory but are not part of the line format. `entry_count` is the number
of immediate children and is meaningful only for directories; a
directory's `size` is the block-reported size.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    pub path: Vec<u8>,
    pub size: i64,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub file_type: FileType,
    pub inode: u64,
    pub entry_count: u64,
    pub dev: u64,
    pub mode: u32,
    pub nlink: u32,
}

impl StatRecord {
    /// Builds a record from an entry and its `lstat` result.
    #[must_use]
    pub fn from_stat(entry: &Dirent, st: &libc::stat) -> Self {
        Self {
            path: entry.as_bytes().to_vec(),
            size: st.st_size,
            uid: st.st_uid,
            gid: st.st_gid,
            atime: st.st_atime,
            mtime: st.st_mtime,
            ctime: st.st_ctime,
            file_type: entry.file_type(),
            inode: st.st_ino,
            entry_count: 0,
            dev: st.st_dev,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u32,
        }
    }

    /// Serialises to one newline-terminated line.
    #[must_use]
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = URL_SAFE_NO_PAD.encode(&self.path).into_bytes();
        for field in [
            self.size.to_string(),
            self.uid.to_string(),
            self.gid.to_string(),
            self.atime.to_string(),
            self.mtime.to_string(),
            self.ctime.to_string(),
            char::from(self.file_type.type_char()).to_string(),
            self.inode.to_string(),
            self.entry_count.to_string(),
            self.dev.to_string(),
        ] {
            line.push(b'\t');
            line.extend_from_slice(field.as_bytes());
        }
        line.push(b'\n');
        line
    }

    /// Parses one line (with or without its trailing newline).
    /// `mode` and `nlink` are not carried by the line and parse as zero.
    pub fn parse_line(line: &str) -> Result<Self> {
        let bad = |reason: &str| SurveyError::InvalidDgutaFormat(format!("{reason}: {line:?}"));

        let fields: Vec<&str> = line.trim_end_matches('\n').split('\t').collect();
        if fields.len() != 11 {
            return Err(bad("expected 11 tab-separated fields"));
        }

        let path = URL_SAFE_NO_PAD
            .decode(fields[0])
            .map_err(|_| bad("undecodable path"))?;

        let type_char = fields[7].as_bytes();
        if type_char.len() != 1 {
            return Err(bad("bad type char"));
        }

        macro_rules! num {
            ($i:expr, $ty:ty, $what:literal) => {
                fields[$i]
                    .parse::<$ty>()
                    .map_err(|_| bad(concat!("bad ", $what)))?
            };
        }

        Ok(Self {
            path,
            size: num!(1, i64, "size"),
            uid: num!(2, u32, "uid"),
            gid: num!(3, u32, "gid"),
            atime: num!(4, i64, "atime"),
            mtime: num!(5, i64, "mtime"),
            ctime: num!(6, i64, "ctime"),
            file_type: FileType::from_type_char(type_char[0]),
            inode: num!(8, u64, "inode"),
            entry_count: num!(9, u64, "entry count"),
            dev: num!(10, u64, "dev"),
            mode: 0,
            nlink: 0,
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

/// Receives the rollup contributions the summariser derives.
///
/// The aggregator is the usual sink; a serialising adapter writes the
/// row stream instead when shards are combined on another host.
pub trait RowSink {
    fn row(&mut self, row: &DgutaRow) -> Result<()>;

    /// Called once per discovered (parent, child-directory) edge.
    fn child(&mut self, _parent: &[u8], _child: &[u8]) -> Result<()> {
        Ok(())
    }
}

impl RowSink for crate::dguta::Aggregator {
    fn row(&mut self, row: &DgutaRow) -> Result<()> {
        self.add_row(row);
        Ok(())
    }

    fn child(&mut self, parent: &[u8], child: &[u8]) -> Result<()> {
        self.note_child(parent, child);
        Ok(())
    }
}

/// Writes the row stream as TSV lines instead of aggregating in memory.
pub struct RowWriter<W: Write>(pub W);

impl<W: Write> RowSink for RowWriter<W> {
    fn row(&mut self, row: &DgutaRow) -> Result<()> {
        self.0
            .write_all(&row.to_line())
            .map_err(|e| SurveyError::io(&row.dir, e))
    }
}

/// A directory whose stat line is held back until its subtree completes,
/// so the line can carry the final child count.
struct PendingDir {
    record: StatRecord,
}

/**
Turns the walker's entry stream into stat records and rollup rows.

For every entry the summariser performs one `lstat`, writes a
[`StatRecord`] line to its output, and feeds one rollup contribution per
(ancestor directory × file-type class) to the row sink, with the entry's
raw clocks (the aggregator applies age fanout). Directory lines are
deferred on an ancestor stack until the walker leaves their subtree,
which is when their `entry_count` is known.

Relies on the walker's depth-first ordering with `include_dirs` enabled;
entries that vanish between walk and stat are logged and skipped.
*/
pub struct Summariser<W: Write, S: RowSink> {
    root: Vec<u8>,
    out: W,
    sink: S,
    stack: Vec<PendingDir>,
}

impl<W: Write, S: RowSink> Summariser<W, S> {
    /// `root` is the walk root; contributions never propagate above it.
    #[must_use]
    pub fn new(root: &[u8], out: W, sink: S) -> Self {
        let mut root = root.to_vec();
        while root.len() > 1 && root.last() == Some(&b'/') {
            root.pop();
        }
        Self {
            root,
            out,
            sink,
            stack: Vec::new(),
        }
    }

    /// Handles one walked entry. Intended as the walker's path callback.
    pub fn add(&mut self, entry: &Dirent) -> Result<()> {
        let st = match lstat(entry.path_no_slash()) {
            Ok(st) => st,
            Err(err) => {
                // Raced with a deletion; the walk itself already reported
                // anything more serious.
                log::warn!("stat failed for {entry}: {err}");
                return Ok(());
            }
        };

        self.unwind_to_parent_of(entry.as_bytes())?;

        let record = StatRecord::from_stat(entry, &st);

        if let Some(parent) = self.stack.last_mut() {
            parent.record.entry_count += 1;
        }

        if entry.is_dir() {
            if let Some(parent) = self.stack.last() {
                self.sink
                    .child(parent.record.path.as_ref(), entry.path_no_slash())?;
            }
            self.contribute(entry, &st)?;
            self.stack.push(PendingDir { record });
        } else {
            self.contribute(entry, &st)?;
            self.write_record(&record)?;
        }

        Ok(())
    }

    /// Flushes pending directory lines and the output stream, handing the
    /// row sink back to the caller.
    pub fn finish(mut self) -> Result<S> {
        while let Some(pending) = self.stack.pop() {
            self.write_record(&pending.record)?;
        }
        self.out.flush().map_err(SurveyError::from)?;
        Ok(self.sink)
    }

    /// Pops completed directories: everything on the stack that is not an
    /// ancestor of `path` has had its whole subtree delivered.
    fn unwind_to_parent_of(&mut self, path: &[u8]) -> Result<()> {
        loop {
            let is_ancestor = match self.stack.last() {
                None => break,
                Some(top) => {
                    path != top.record.path.as_slice() && path.starts_with(&top.record.path)
                }
            };
            if is_ancestor {
                break;
            }

            let Some(done) = self.stack.pop() else { break };
            self.write_record(&done.record)?;
        }
        Ok(())
    }

    fn write_record(&mut self, record: &StatRecord) -> Result<()> {
        self.out
            .write_all(&record.to_line())
            .map_err(|e| SurveyError::io(&record.path, e))
    }

    /// One rollup row per (ancestor × class). Directories contribute a
    /// `dir` row to themselves and every ancestor up to the walk root;
    /// files start at their parent. Temp membership is additive.
    fn contribute(&mut self, entry: &Dirent, st: &libc::stat) -> Result<()> {
        let (class, is_temp) = FileTypeClass::classify(entry.as_bytes(), entry.is_dir());

        let no_slash = entry.path_no_slash();
        let mut dir: &[u8] = if entry.is_dir() {
            no_slash
        } else {
            parent_dir(no_slash)
        };

        if !dir.starts_with(&self.root) {
            return Ok(());
        }

        loop {
            self.emit_row(dir, class, st)?;
            if is_temp {
                self.emit_row(dir, FileTypeClass::Temp, st)?;
            }
            if dir == self.root.as_slice() || dir == b"/" {
                break;
            }
            dir = parent_dir(dir);
        }

        Ok(())
    }

    fn emit_row(&mut self, dir: &[u8], class: FileTypeClass, st: &libc::stat) -> Result<()> {
        self.sink.row(&DgutaRow {
            dir: dir.to_vec(),
            gid: st.st_gid,
            uid: st.st_uid,
            file_type: class,
            age: crate::dguta::AgeBucket::All,
            count: 1,
            size: st.st_size.max(0) as u64,
            atime: st.st_atime,
            mtime: st.st_mtime,
        })
    }
}
