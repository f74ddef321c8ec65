use crate::dguta::{Aggregator, StoreWriter, write_sentinel};
use crate::error::{Result, SurveyError};
use crate::stat::{StatRecord, Summariser};
use crate::usergroup::{GroupUserRollup, UserGroupRollup};
use crate::walk::{OutputFiles, Walker};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

/// Construction-time options for a survey run.
#[derive(Debug, Clone)]
pub struct SurveyConfig {
    /// Number of `walk.<n>` path-list files.
    pub output_shards: u32,
    /// Directories per store commit; `None` takes the default.
    pub batch_size: Option<u32>,
    /// Drop symlinks at the source.
    pub ignore_symlinks: bool,
    /// Telemetry cadence for the walker.
    pub stats_interval: Option<Duration>,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            output_shards: 1,
            batch_size: None,
            ignore_symlinks: false,
            stats_interval: None,
        }
    }
}

/**
Runs the whole pipeline for one root: walk → stat → aggregate → store.

Leaves the per-walk layout under `out_dir`: `walk.<n>` path lists,
`walk.1.stats` stat records, `walk.1.byusergroup` and `walk.1.bygroup`
ownership rollups, the GUTA and children databases, and the
`.dgut.dbs.updated` sentinel stamped with the minimum walk-file mtime.

Per-path problems (unreadable subtrees, paths that vanish mid-walk) are
logged and skipped; anything that compromises the output as a whole is
returned as an error.
*/
pub fn survey(root: &[u8], out_dir: &Path, cfg: &SurveyConfig) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| SurveyError::io(out_dir.as_os_str().as_encoded_bytes(), e))?;

    let outputs = OutputFiles::new(out_dir, cfg.output_shards)?;

    let stats_path = out_dir.join("walk.1.stats");
    let stats_file = File::create(&stats_path)
        .map_err(|e| SurveyError::io(stats_path.as_os_str().as_encoded_bytes(), e))?;

    let mut summariser = Summariser::new(root, BufWriter::new(stats_file), Aggregator::new());

    let walker = Walker::init()
        .include_dirs(true)
        .ignore_symlinks(cfg.ignore_symlinks)
        .stats_interval(cfg.stats_interval)
        .build();

    walker.walk(
        root,
        |entry| {
            outputs.write_path(entry.as_bytes())?;
            summariser.add(entry)
        },
        |path, err| {
            log::warn!("walk error at {}: {err}", String::from_utf8_lossy(path));
        },
    )?;

    let agg = summariser.finish()?;
    outputs.finish()?;

    log::info!(
        "walk of {} complete: {} directories aggregated",
        String::from_utf8_lossy(root),
        agg.dir_count()
    );

    write_ownership_rollups(root, out_dir, &stats_path)?;

    StoreWriter::create(out_dir, cfg.batch_size)?.store(agg)?;
    write_sentinel(out_dir)
}

/// Second pass over the stat records: the per-directory user/group rollup
/// and the whole-walk group totals.
fn write_ownership_rollups(root: &[u8], out_dir: &Path, stats_path: &Path) -> Result<()> {
    let mut by_usergroup = UserGroupRollup::new(root);
    let mut by_group = GroupUserRollup::new();

    let stats = File::open(stats_path)
        .map_err(|e| SurveyError::io(stats_path.as_os_str().as_encoded_bytes(), e))?;
    for line in BufReader::new(stats).lines() {
        let line = line.map_err(|e| SurveyError::io(stats_path.as_os_str().as_encoded_bytes(), e))?;
        let record = StatRecord::parse_line(&line)?;
        by_usergroup.add_record(&record);
        by_group.add_record(&record);
    }

    let ug_path = out_dir.join("walk.1.byusergroup");
    let ug_file = File::create(&ug_path)
        .map_err(|e| SurveyError::io(ug_path.as_os_str().as_encoded_bytes(), e))?;
    let mut ug_out = BufWriter::new(ug_file);
    by_usergroup.write(&mut ug_out)?;
    ug_out.flush().map_err(SurveyError::from)?;

    let g_path = out_dir.join("walk.1.bygroup");
    let g_file = File::create(&g_path)
        .map_err(|e| SurveyError::io(g_path.as_os_str().as_encoded_bytes(), e))?;
    let mut g_out = BufWriter::new(g_file);
    by_group.write(&mut g_out)?;
    g_out.flush().map_err(SurveyError::from)?;

    Ok(())
}
