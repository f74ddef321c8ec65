//! Cross-module scenarios: whole-walk ordering, symlink handling and the
//! end-to-end survey pipeline.

use crate::dguta::{FileTypeClass, Filter, Query};
use crate::error::SurveyError;
use crate::fs::FileType;
use crate::stat::StatRecord;
use crate::survey::{SurveyConfig, survey};
use crate::walk::Walker;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::collections::BTreeSet;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn walk_collect(root: &Path, include_dirs: bool, ignore_symlinks: bool) -> Vec<(Vec<u8>, FileType)> {
    init_logging();
    let walker = Walker::init()
        .include_dirs(include_dirs)
        .ignore_symlinks(ignore_symlinks)
        .build();

    let mut out = Vec::new();
    walker
        .walk(
            root.as_os_str().as_bytes(),
            |entry| {
                out.push((entry.as_bytes().to_vec(), entry.file_type()));
                Ok(())
            },
            |path, err| panic!("walk error at {}: {err}", String::from_utf8_lossy(path)),
        )
        .unwrap();
    out
}

/// Plain recursive enumeration in sorted order, as the ordering oracle.
fn reference_dfs(dir: &Path, out: &mut Vec<Vec<u8>>) {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if entry.file_type().unwrap().is_dir() {
            let mut bytes = path.as_os_str().as_bytes().to_vec();
            bytes.push(b'/');
            out.push(bytes);
            reference_dfs(&path, out);
        } else {
            out.push(path.as_os_str().as_bytes().to_vec());
        }
    }
}

#[test]
fn three_level_tree_emits_depth_first_in_name_order() {
    let tmp = tempfile::tempdir().unwrap();
    let t = tmp.path();
    std::fs::create_dir_all(t.join("a/b/c")).unwrap();
    std::fs::write(t.join("a/f"), "").unwrap();
    std::fs::write(t.join("a/b/g"), "").unwrap();
    std::fs::write(t.join("a/b/c/h"), "").unwrap();

    let got: Vec<Vec<u8>> = walk_collect(t, true, false)
        .into_iter()
        .map(|(p, _)| p)
        .collect();

    let r = t.as_os_str().as_bytes();
    let expect = |suffix: &str| {
        let mut p = r.to_vec();
        p.extend_from_slice(suffix.as_bytes());
        p
    };

    assert_eq!(
        got,
        vec![
            expect("/"),
            expect("/a/"),
            expect("/a/b/"),
            expect("/a/b/c/"),
            expect("/a/b/c/h"),
            expect("/a/b/g"),
            expect("/a/f"),
        ]
    );
}

#[test]
fn walk_matches_reference_enumeration_exactly() {
    let tmp = tempfile::tempdir().unwrap();
    let t = tmp.path();
    // Names chosen to stress byte ordering around '/' and '.'
    std::fs::create_dir_all(t.join("a/b")).unwrap();
    std::fs::create_dir_all(t.join("a+x")).unwrap();
    std::fs::create_dir_all(t.join("zz/deep/deeper")).unwrap();
    for f in ["a/.hidden", "a/file", "a+x/1", "zz/deep/deeper/end", "top"] {
        std::fs::write(t.join(f), "x").unwrap();
    }

    let mut expected = vec![{
        let mut p = t.as_os_str().as_bytes().to_vec();
        p.push(b'/');
        p
    }];
    reference_dfs(t, &mut expected);

    let got: Vec<Vec<u8>> = walk_collect(t, true, false)
        .into_iter()
        .map(|(p, _)| p)
        .collect();

    assert_eq!(got, expected);
}

#[test]
fn include_dirs_false_suppresses_directories_only() {
    let tmp = tempfile::tempdir().unwrap();
    let t = tmp.path();
    std::fs::create_dir(t.join("sub")).unwrap();
    std::fs::write(t.join("sub/file"), "x").unwrap();

    let got = walk_collect(t, false, false);
    assert_eq!(got.len(), 1);
    assert!(got[0].0.ends_with(b"sub/file"));
    assert_eq!(got[0].1, FileType::RegularFile);
}

#[test]
fn symlinks_are_reported_or_dropped_but_never_followed() {
    let tmp = tempfile::tempdir().unwrap();
    let t = tmp.path();
    std::fs::write(t.join("real"), "x").unwrap();
    std::os::unix::fs::symlink(t.join("real"), t.join("link")).unwrap();
    // A symlinked directory must not be descended into either way
    std::fs::create_dir(t.join("sub")).unwrap();
    std::fs::write(t.join("sub/inner"), "x").unwrap();
    std::os::unix::fs::symlink(t.join("sub"), t.join("sublink")).unwrap();

    let with_links = walk_collect(t, false, false);
    let types: Vec<_> = with_links.iter().map(|(p, ft)| (p.clone(), *ft)).collect();
    assert_eq!(types.len(), 4); // real, link, sub/inner, sublink
    assert!(
        types
            .iter()
            .filter(|(_, ft)| *ft == FileType::Symlink)
            .count()
            == 2
    );
    // Nothing under sublink/ was emitted
    assert!(types.iter().all(|(p, _)| !p.ends_with(b"sublink/inner")));

    let without_links = walk_collect(t, false, true);
    assert_eq!(without_links.len(), 2); // real, sub/inner
    assert!(
        without_links
            .iter()
            .all(|(_, ft)| *ft == FileType::RegularFile)
    );
}

#[test]
fn wide_directories_need_multiple_kernel_reads() {
    let tmp = tempfile::tempdir().unwrap();
    // Enough entries that one getdents64 buffer cannot hold them all
    for i in 0..2000 {
        std::fs::write(tmp.path().join(format!("file_{i:04}")), "x").unwrap();
    }

    let got = walk_collect(tmp.path(), false, false);
    assert_eq!(got.len(), 2000);

    // Emission order is the sorted name order
    let names: Vec<_> = got
        .iter()
        .map(|(p, _)| p[p.len() - 9..].to_vec())
        .collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[test]
fn deep_trees_walk_without_wedging() {
    let tmp = tempfile::tempdir().unwrap();
    let mut path = tmp.path().to_path_buf();
    for i in 0..50 {
        path = path.join(format!("level{i:02}"));
    }
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("bottom"), "x").unwrap();

    let got = walk_collect(tmp.path(), true, false);
    // Root + 50 levels + 1 file
    assert_eq!(got.len(), 52);
    assert!(got[51].0.ends_with(b"bottom"));

    // Strictly increasing depth on the way down
    for pair in got.windows(2) {
        assert!(pair[1].0.len() > pair[0].0.len());
    }
}

#[test]
fn serialised_row_stream_aggregates_identically() {
    use crate::dguta::{Aggregator, DgutaRow};
    use crate::stat::{RowWriter, Summariser};

    let tmp = tempfile::tempdir().unwrap();
    let t = tmp.path();
    std::fs::create_dir(t.join("d")).unwrap();
    std::fs::write(t.join("d/a.bam"), "eight bs").unwrap();
    std::fs::write(t.join("top.txt"), "words").unwrap();

    let root = t.as_os_str().as_bytes();

    // Pipeline A: walker straight into an aggregator
    let mut direct = Summariser::new(root, std::io::sink(), Aggregator::with_reference_time(0));
    Walker::init()
        .build()
        .walk(root, |e| direct.add(e), |_, _| {})
        .unwrap();
    let direct_agg = direct.finish().unwrap();

    // Pipeline B: the same walk serialised to a row stream, then parsed
    // back and aggregated on "another host"
    let mut wire = Summariser::new(root, std::io::sink(), RowWriter(Vec::new()));
    Walker::init()
        .build()
        .walk(root, |e| wire.add(e), |_, _| {})
        .unwrap();
    let bytes = wire.finish().unwrap().0;

    let mut remote_agg = Aggregator::with_reference_time(0);
    for line in String::from_utf8(bytes).unwrap().lines() {
        remote_agg.add_row(&DgutaRow::parse_line(line).unwrap());
    }

    assert_eq!(direct_agg.to_rows(), remote_agg.to_rows());
    assert!(direct_agg.dir_count() > 0);
}

#[test]
fn cancellation_stops_the_walk() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), "x").unwrap();

    let walker = Walker::init().build();
    let token = walker.cancel_handle();
    token.cancel();

    let result = walker.walk(
        tmp.path().as_os_str().as_bytes(),
        |_| Ok(()),
        |_, _| {},
    );
    assert!(matches!(result, Err(SurveyError::Cancelled)));
}

#[test]
fn callback_errors_terminate_the_walk() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..20 {
        std::fs::write(tmp.path().join(format!("f{i:02}")), "x").unwrap();
    }

    let walker = Walker::init().build();
    let mut seen = 0;
    let result = walker.walk(
        tmp.path().as_os_str().as_bytes(),
        |_| {
            seen += 1;
            if seen == 3 {
                Err(SurveyError::io(
                    b"sink",
                    std::io::Error::other("downstream full"),
                ))
            } else {
                Ok(())
            }
        },
        |_, _| {},
    );

    assert!(matches!(result, Err(SurveyError::Io { .. })));
    assert_eq!(seen, 3);
}

#[test]
fn oversized_root_is_rejected_up_front() {
    let huge = vec![b'a'; 5000];
    let walker = Walker::init().build();
    let result = walker.walk(&huge, |_| Ok(()), |_, _| {});
    assert!(matches!(result, Err(SurveyError::NameTooLong { .. })));
}

#[test]
fn missing_root_is_an_io_error() {
    let walker = Walker::init().build();
    let result = walker.walk(b"/no/such/root/anywhere", |_| Ok(()), |_, _| {});
    assert!(matches!(result, Err(SurveyError::Io { .. })));
}

#[test]
fn unreadable_subtree_aborts_only_itself() {
    // Root bypasses permission checks, so this scenario needs a real uid
    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } == 0 {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let t = tmp.path();
    std::fs::create_dir(t.join("locked")).unwrap();
    std::fs::write(t.join("locked/secret"), "x").unwrap();
    std::fs::write(t.join("visible"), "x").unwrap();

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(t.join("locked"), std::fs::Permissions::from_mode(0o000)).unwrap();

    let walker = Walker::init().include_dirs(true).build();
    let mut paths = Vec::new();
    let mut errors = Vec::new();
    walker
        .walk(
            t.as_os_str().as_bytes(),
            |entry| {
                paths.push(entry.as_bytes().to_vec());
                Ok(())
            },
            |path, _| errors.push(path.to_vec()),
        )
        .unwrap();

    std::fs::set_permissions(t.join("locked"), std::fs::Permissions::from_mode(0o755)).unwrap();

    assert_eq!(errors.len(), 1);
    assert!(errors[0].ends_with(b"locked/"));
    // The locked directory itself and its sibling still arrived
    assert!(paths.iter().any(|p| p.ends_with(b"locked/")));
    assert!(paths.iter().any(|p| p.ends_with(b"visible")));
    assert!(!paths.iter().any(|p| p.ends_with(b"secret")));
}

#[test]
fn ch_engine_runs_on_the_walk_stream() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let t = tmp.path();
    std::fs::create_dir(t.join("proj")).unwrap();
    for f in ["proj/a.txt", "proj/b.txt"] {
        std::fs::write(t.join(f), "x").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(t.join(f), std::fs::Permissions::from_mode(0o600)).unwrap();
    }

    let rules = format!("{}\t*\t*\trw^rw^***\t*********\n", t.display());
    let set = crate::ch::RuleSet::from_reader(std::io::BufReader::new(rules.as_bytes())).unwrap();
    let engine = crate::ch::ChEngine::new(set);

    // The engine rides the walker's callback thread, one path at a time
    let walker = Walker::init().include_dirs(true).build();
    let mut changed = 0;
    walker
        .walk(
            t.as_os_str().as_bytes(),
            |entry| {
                if engine.apply(entry.path_no_slash())? {
                    changed += 1;
                }
                Ok(())
            },
            |_, _| {},
        )
        .unwrap();

    assert_eq!(changed, 2);

    use std::os::unix::fs::PermissionsExt;
    for f in ["proj/a.txt", "proj/b.txt"] {
        let mode = std::fs::metadata(t.join(f)).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o660);
    }
}

#[test]
fn telemetry_sink_receives_samples() {
    init_logging();

    #[derive(Default)]
    struct Capture(std::sync::Mutex<Vec<crate::walk::CounterSnapshot>>);

    impl crate::walk::TelemetrySink for Capture {
        fn sample(&self, snap: crate::walk::CounterSnapshot) {
            if let Ok(mut samples) = self.0.lock() {
                samples.push(snap);
            }
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("d")).unwrap();
    std::fs::write(tmp.path().join("d/f"), "x").unwrap();

    let sink = std::sync::Arc::new(Capture::default());
    let walker = Walker::init()
        .stats_interval(Some(std::time::Duration::from_millis(10)))
        .build_with_sink(std::sync::Arc::clone(&sink) as std::sync::Arc<dyn crate::walk::TelemetrySink>);

    walker
        .walk(tmp.path().as_os_str().as_bytes(), |_| Ok(()), |_, _| {})
        .unwrap();

    let samples = sink.0.lock().unwrap();
    let last = samples.last().expect("at least the final sample");
    assert_eq!(last.open, 2); // the root and d
    assert_eq!(last.close, 2);
    assert!(last.read_calls >= 2);
    assert!(last.read_bytes > 0);
}

#[test]
fn survey_lays_out_a_queryable_walk_directory() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("data");
    std::fs::create_dir_all(src.join("a")).unwrap();
    std::fs::create_dir_all(src.join("b")).unwrap();
    std::fs::write(src.join("a/one.bam"), "data").unwrap();
    std::fs::write(src.join("a/two.txt"), "words").unwrap();
    std::fs::write(src.join("b/three.cram"), "reads").unwrap();
    std::fs::write(src.join("four.log"), "lines").unwrap();

    let out = tmp.path().join("out");
    let cfg = SurveyConfig {
        output_shards: 2,
        ..SurveyConfig::default()
    };
    survey(src.as_os_str().as_bytes(), &out, &cfg).unwrap();

    // 7 entries: root, a, b and four files
    let mut listed = BTreeSet::new();
    for n in 1..=2 {
        let content = std::fs::read_to_string(out.join(format!("walk.{n}"))).unwrap();
        for line in content.lines() {
            listed.insert(URL_SAFE_NO_PAD.decode(line).unwrap());
        }
    }
    assert_eq!(listed.len(), 7);

    // Stat records parse and carry child counts for the directories
    let stats = std::fs::read_to_string(out.join("walk.1.stats")).unwrap();
    let records: Vec<StatRecord> = stats
        .lines()
        .map(|l| StatRecord::parse_line(l).unwrap())
        .collect();
    assert_eq!(records.len(), 7);

    let root_bytes = {
        let mut p = src.as_os_str().as_bytes().to_vec();
        p.push(b'/');
        p
    };
    let root_rec = records.iter().find(|r| r.path == root_bytes).unwrap();
    assert_eq!(root_rec.entry_count, 3); // a, b, four.log
    assert_eq!(root_rec.file_type, FileType::Directory);

    let a_rec = records
        .iter()
        .find(|r| r.path.ends_with(b"/a/"))
        .unwrap();
    assert_eq!(a_rec.entry_count, 2);

    // Ownership rollups: three directories hold files, one (gid, uid) pair
    let ug = std::fs::read_to_string(out.join("walk.1.byusergroup")).unwrap();
    assert_eq!(ug.lines().count(), 3);
    assert!(ug.lines().next().unwrap().ends_with("\t4\t19"));

    let bg = std::fs::read_to_string(out.join("walk.1.bygroup")).unwrap();
    assert_eq!(bg.lines().count(), 1);
    assert!(bg.trim_end().ends_with("\t4\t19"));

    // The sentinel exists and the store answers filtered queries
    assert!(out.join(crate::dguta::SENTINEL_FILE).exists());

    let q = Query::open(&[out.as_path()]).unwrap();
    let src_key = src.as_os_str().as_bytes();

    let everything = q.dir_info(src_key, &Filter::default()).unwrap();
    assert_eq!(everything.count, 7);

    let bams = q
        .dir_info(
            src_key,
            &Filter {
                file_types: vec![FileTypeClass::Bam],
                ..Filter::default()
            },
        )
        .unwrap();
    assert_eq!(bams.count, 1);
    assert_eq!(bams.size, 4);

    let under_a = q
        .dir_info(src.join("a").as_os_str().as_encoded_bytes(), &Filter::default())
        .unwrap();
    assert_eq!(under_a.count, 3); // the dir itself plus two files

    let kids = q.children(src_key).unwrap();
    assert_eq!(kids.len(), 2);
    assert!(kids[0].ends_with(b"/a"));
    assert!(kids[1].ends_with(b"/b"));

    assert!(matches!(
        q.dir_info(b"/absent", &Filter::default()),
        Err(SurveyError::NotFound(_))
    ));
}

#[test]
fn shard_outputs_combine_into_one() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("data");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("x"), "12345").unwrap();
    std::fs::write(src.join("y"), "123").unwrap();

    let out_a = tmp.path().join("shard_a");
    let out_b = tmp.path().join("shard_b");
    survey(src.as_os_str().as_bytes(), &out_a, &SurveyConfig::default()).unwrap();
    survey(src.as_os_str().as_bytes(), &out_b, &SurveyConfig::default()).unwrap();

    let stats_out = tmp.path().join("combined.stats");
    crate::combine::concat_stats(
        &[out_a.join("walk.1.stats"), out_b.join("walk.1.stats")],
        &stats_out,
    )
    .unwrap();
    assert_eq!(
        std::fs::read_to_string(&stats_out).unwrap().lines().count(),
        6 // two shards × (root + two files)
    );

    let ug_out = tmp.path().join("combined.byusergroup");
    crate::combine::merge_usergroup_files(
        &[
            out_a.join("walk.1.byusergroup"),
            out_b.join("walk.1.byusergroup"),
        ],
        &ug_out,
    )
    .unwrap();
    let merged = std::fs::read_to_string(&ug_out).unwrap();
    // Same tree surveyed twice: counts and sizes double up
    assert_eq!(merged.lines().count(), 1);
    assert!(merged.trim_end().ends_with("\t4\t16"));
}

#[test]
fn survey_refuses_to_overwrite_its_store() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("data");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("f"), "x").unwrap();

    let out = tmp.path().join("out");
    survey(src.as_os_str().as_bytes(), &out, &SurveyConfig::default()).unwrap();

    // The second run trips on the existing walk files first
    let err = survey(src.as_os_str().as_bytes(), &out, &SurveyConfig::default()).unwrap_err();
    assert!(matches!(err, SurveyError::DuplicateJob(_)));
}
