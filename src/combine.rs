use crate::error::{Result, SurveyError};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/**
Combining per-shard walk outputs into single files.

A large survey is split across shards (separate walk output directories,
possibly produced on separate machines). Stat streams just concatenate;
the user/group rollup text files merge by key with counts and sizes
summed. Database shards are combined separately with
[`merge_db_dirs`](crate::dguta::merge_db_dirs).
*/

fn open_in(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| SurveyError::io(path.as_os_str().as_encoded_bytes(), e))
}

/// Concatenates line-oriented stat files verbatim.
pub fn concat_stats<P: AsRef<Path>>(inputs: &[P], out: &Path) -> Result<()> {
    let file =
        File::create(out).map_err(|e| SurveyError::io(out.as_os_str().as_encoded_bytes(), e))?;
    let mut writer = BufWriter::new(file);

    for input in inputs {
        let mut reader = open_in(input.as_ref())?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| SurveyError::io(input.as_ref().as_os_str().as_encoded_bytes(), e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .map_err(|e| SurveyError::io(out.as_os_str().as_encoded_bytes(), e))?;
        }
    }

    writer
        .flush()
        .map_err(|e| SurveyError::io(out.as_os_str().as_encoded_bytes(), e))
}

/**
Merges tab-separated rollup files whose last two columns are count and
size, summing both for identical key prefixes and writing the result
sorted. Works for both the five-column per-directory rollup and the
four-column group totals.
*/
fn merge_counted(inputs: &[&Path], out: &Path, columns: usize) -> Result<()> {
    let mut merged: BTreeMap<Vec<u8>, (u64, u64)> = BTreeMap::new();

    for input in inputs {
        let reader = open_in(input)?;
        for line in reader.split(b'\n') {
            let line =
                line.map_err(|e| SurveyError::io(input.as_os_str().as_encoded_bytes(), e))?;
            if line.is_empty() {
                continue;
            }

            let bad = || {
                SurveyError::InvalidDgutaFormat(format!(
                    "bad rollup line in {}: {:?}",
                    input.display(),
                    String::from_utf8_lossy(&line)
                ))
            };

            // The key may contain tabs (directory names); only the last
            // two fields are numeric.
            let mut it = line.rsplitn(3, |&b| b == b'\t');
            let size = it.next().ok_or_else(bad)?;
            let count = it.next().ok_or_else(bad)?;
            let key = it.next().ok_or_else(bad)?;

            if key.iter().filter(|&&b| b == b'\t').count() < columns.saturating_sub(3) {
                return Err(bad());
            }

            let count: u64 = core::str::from_utf8(count)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(bad)?;
            let size: u64 = core::str::from_utf8(size)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(bad)?;

            let entry = merged.entry(key.to_vec()).or_insert((0, 0));
            entry.0 += count;
            entry.1 += size;
        }
    }

    let file =
        File::create(out).map_err(|e| SurveyError::io(out.as_os_str().as_encoded_bytes(), e))?;
    let mut writer = BufWriter::new(file);
    for (key, (count, size)) in &merged {
        writer
            .write_all(key)
            .and_then(|()| writer.write_all(format!("\t{count}\t{size}\n").as_bytes()))
            .map_err(|e| SurveyError::io(out.as_os_str().as_encoded_bytes(), e))?;
    }
    writer
        .flush()
        .map_err(|e| SurveyError::io(out.as_os_str().as_encoded_bytes(), e))
}

/// Merges `user\tgroup\tdir\tcount\tsize` rollup files.
pub fn merge_usergroup_files<P: AsRef<Path>>(inputs: &[P], out: &Path) -> Result<()> {
    let paths: Vec<&Path> = inputs.iter().map(AsRef::as_ref).collect();
    merge_counted(&paths, out, 5)
}

/// Merges `group\tuser\tcount\tsize` totals files.
pub fn merge_group_files<P: AsRef<Path>>(inputs: &[P], out: &Path) -> Result<()> {
    let paths: Vec<&Path> = inputs.iter().map(AsRef::as_ref).collect();
    merge_counted(&paths, out, 4)
}
