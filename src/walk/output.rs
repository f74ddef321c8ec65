use crate::error::{Result, SurveyError};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/**
The walker's numbered output files, `walk.1` … `walk.n`.

Each emitted path lands in exactly one file, chosen by an atomic
round-robin cursor, one `base64url` (no padding) encoded path per line.
The per-file distribution is unstable across re-runs; only the total
multiset of paths is.

Creating the set twice for the same directory is a duplicate submission
and is refused, since the files would silently interleave two walks.
*/
pub struct OutputFiles {
    files: Vec<Mutex<BufWriter<File>>>,
    paths: Vec<PathBuf>,
    cursor: AtomicUsize,
}

impl OutputFiles {
    /**
    Creates `n` output files under `dir`.

    # Errors
    `DuplicateJob` when any `walk.<i>` already exists; `Io` when a file
    cannot be created.
    */
    pub fn new(dir: &Path, n: u32) -> Result<Self> {
        let n = n.max(1);
        let mut files = Vec::with_capacity(n as usize);
        let mut paths = Vec::with_capacity(n as usize);

        for i in 1..=n {
            let path = dir.join(format!("walk.{i}"));
            if path.exists() {
                return Err(SurveyError::DuplicateJob(format!(
                    "output file {} already exists",
                    path.display()
                )));
            }
            let file = File::create(&path)
                .map_err(|e| SurveyError::io(path.as_os_str().as_encoded_bytes(), e))?;
            files.push(Mutex::new(BufWriter::new(file)));
            paths.push(path);
        }

        Ok(Self {
            files,
            paths,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The created file paths, in `walk.1 … walk.n` order.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Writes one path to the next file in round-robin order.
    pub fn write_path(&self, path: &[u8]) -> Result<()> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.files.len();
        let mut line = URL_SAFE_NO_PAD.encode(path).into_bytes();
        line.push(b'\n');

        let mut writer = self.files[idx]
            .lock()
            .map_err(|_| SurveyError::io(path, std::io::Error::other("output lock poisoned")))?;
        writer.write_all(&line).map_err(|e| SurveyError::io(path, e))
    }

    /// Flushes every file. Call once the walk has finished.
    pub fn finish(self) -> Result<()> {
        for (file, path) in self.files.into_iter().zip(&self.paths) {
            let mut writer = file.into_inner().map_err(|_| {
                SurveyError::io(
                    path.as_os_str().as_encoded_bytes(),
                    std::io::Error::other("output lock poisoned"),
                )
            })?;
            writer
                .flush()
                .map_err(|e| SurveyError::io(path.as_os_str().as_encoded_bytes(), e))?;
        }
        Ok(())
    }
}
