use crate::ch::rule::{PermAction, PermSpec, OwnerSpec, Rule, RuleSet};
use crate::error::{Result, SurveyError};
use crate::fs::{FileType, lstat};
use dashmap::DashMap;

/// Permission bit for spec position `i` (0 = user read … 8 = other exec).
const fn bit(i: usize) -> u32 {
    1 << (8 - i)
}

/**
Computes the mode a path should have under `spec`.

Set/clear/preserve resolve first; mirror positions then take the OR of
their column across all three triads, so a bit survives a mirror if it is
on anywhere after preservation. Special bits are preserved, except that
setgid is forced on for directories whose rule asks for it.
*/
fn compute_mode(current: u32, spec: &PermSpec, is_dir: bool) -> u32 {
    let mut bits = [false; 9];
    for (i, action) in spec.actions.iter().enumerate() {
        let cur = current & bit(i) != 0;
        bits[i] = match action {
            PermAction::Set => true,
            PermAction::Clear => false,
            PermAction::Preserve | PermAction::Mirror => cur,
        };
    }

    let mut mode = 0u32;
    for (i, action) in spec.actions.iter().enumerate() {
        let on = if *action == PermAction::Mirror {
            let col = i % 3;
            bits[col] || bits[col + 3] || bits[col + 6]
        } else {
            bits[i]
        };
        if on {
            mode |= bit(i);
        }
    }

    let mut special = current & 0o7000;
    if is_dir && spec.wants_setgid() {
        special |= 0o2000;
    }

    mode | special
}

fn lchown(path: &[u8], uid: u32, gid: u32) -> Result<()> {
    let mut cpath = Vec::with_capacity(path.len() + 1);
    cpath.extend_from_slice(path);
    cpath.push(0);

    // SAFETY: cpath is NUL-terminated
    let rc = unsafe { libc::lchown(cpath.as_ptr().cast(), uid, gid) };
    if rc != 0 {
        return Err(SurveyError::last_os_error(path));
    }
    Ok(())
}

fn chmod(path: &[u8], mode: u32) -> Result<()> {
    let mut cpath = Vec::with_capacity(path.len() + 1);
    cpath.extend_from_slice(path);
    cpath.push(0);

    // SAFETY: cpath is NUL-terminated
    let rc = unsafe { libc::chmod(cpath.as_ptr().cast(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(SurveyError::last_os_error(path));
    }
    Ok(())
}

fn is_enoent(err: &SurveyError) -> bool {
    matches!(err, SurveyError::Io { source, .. } if source.raw_os_error() == Some(libc::ENOENT))
}

/**
The ownership/permission reconciliation engine.

Matches every path against the rule of its longest covering directory and
rewrites ownership and mode bits to match, one conditional operation at a
time, so that a tree already conforming to the rules sees no writes at
all. Symlinks have their ownership corrected in place and their mode left
alone. Paths that have vanished are skipped silently; all other failures
are accumulated and reported together at the end of a run.
*/
pub struct ChEngine {
    rules: RuleSet,
    /// Cached (uid, gid) of rule directories, for `^` owner specs.
    dir_owners: DashMap<Vec<u8>, (u32, u32)>,
}

impl ChEngine {
    #[must_use]
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            dir_owners: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /**
    Reconciles a single path. Returns whether anything was written.

    No covering rule, or a path that no longer exists, is a quiet no-op.
    */
    pub fn apply(&self, path: &[u8]) -> Result<bool> {
        let Some(rule) = self.rules.get(path) else {
            return Ok(false);
        };

        let st = match lstat(path) {
            Ok(st) => st,
            Err(err) if is_enoent(&err) => return Ok(false),
            Err(err) => return Err(err),
        };

        let file_type = FileType::from_mode(st.st_mode);
        let mut changed = false;

        let (want_uid, want_gid) = self.desired_owner(rule, st.st_uid, st.st_gid)?;
        if want_uid != st.st_uid || want_gid != st.st_gid {
            lchown(path, want_uid, want_gid)?;
            log::info!(
                "chown {}: {}:{} -> {}:{}",
                String::from_utf8_lossy(path),
                st.st_uid,
                st.st_gid,
                want_uid,
                want_gid
            );
            changed = true;
        }

        if matches!(file_type, FileType::RegularFile | FileType::Directory) {
            let is_dir = file_type.is_dir();
            let spec = if is_dir {
                &rule.dir_perms
            } else {
                &rule.file_perms
            };

            let current = u32::from(st.st_mode) & 0o7777;
            let desired = compute_mode(current, spec, is_dir);
            if desired != current {
                chmod(path, desired)?;
                log::info!(
                    "chmod {}: {:04o} -> {:04o}",
                    String::from_utf8_lossy(path),
                    current,
                    desired
                );
                changed = true;
            }
        }

        Ok(changed)
    }

    /**
    Reconciles every path in the stream, accumulating failures.

    # Errors
    `Multiple` carrying one error per failed path; successfully handled
    paths are unaffected by failures elsewhere.

    # Returns
    The number of paths that needed at least one write.
    */
    pub fn run<'a, I>(&self, paths: I) -> Result<u64>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut errors = Vec::new();
        let mut changes = 0u64;

        for path in paths {
            match self.apply(path) {
                Ok(true) => changes += 1,
                Ok(false) => {}
                Err(err) => errors.push(err),
            }
        }

        if errors.is_empty() {
            Ok(changes)
        } else {
            Err(SurveyError::Multiple(errors))
        }
    }

    /// Resolves the rule's ownership columns against the current owner.
    fn desired_owner(&self, rule: &Rule, cur_uid: u32, cur_gid: u32) -> Result<(u32, u32)> {
        let from_dir = || -> Result<(u32, u32)> {
            if let Some(cached) = self.dir_owners.get(&rule.directory) {
                return Ok(*cached);
            }
            let st = lstat(&rule.directory)?;
            let owner = (st.st_uid, st.st_gid);
            self.dir_owners.insert(rule.directory.clone(), owner);
            Ok(owner)
        };

        let uid = match &rule.user {
            OwnerSpec::Unchanged => cur_uid,
            OwnerSpec::Named { id, .. } => *id,
            OwnerSpec::FromDir => from_dir()?.0,
        };
        let gid = match &rule.group {
            OwnerSpec::Unchanged => cur_gid,
            OwnerSpec::Named { id, .. } => *id,
            OwnerSpec::FromDir => from_dir()?.1,
        };

        Ok((uid, gid))
    }
}

#[cfg(test)]
mod tests {
    use super::{ChEngine, compute_mode};
    use crate::ch::rule::{Rule, RuleSet};
    use crate::error::SurveyError;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;

    fn ruleset(lines: &[String]) -> RuleSet {
        let mut set = RuleSet::default();
        for (i, line) in lines.iter().enumerate() {
            set.add(Rule::parse(line, i + 1).unwrap());
        }
        set
    }

    fn mode_of(path: &std::path::Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn mirror_takes_or_of_the_column() {
        let rule = Rule::parse("/x\t*\t*\trw^rw^***\t*********", 1).unwrap();
        // No execute bit anywhere: mirror resolves to off
        assert_eq!(compute_mode(0o600, &rule.file_perms, false), 0o660);
        // User execute on: both mirrors switch on
        assert_eq!(compute_mode(0o700, &rule.file_perms, false), 0o770);
        // Other execute on feeds the mirrors too (three-way OR)
        assert_eq!(compute_mode(0o601, &rule.file_perms, false), 0o771);
    }

    #[test]
    fn setgid_only_applies_to_directories() {
        let rule = Rule::parse("/x\t*\t*\trw*rws***\trw*rws***", 1).unwrap();
        assert_eq!(compute_mode(0o755, &rule.dir_perms, true) & 0o2000, 0o2000);
        assert_eq!(compute_mode(0o644, &rule.file_perms, false) & 0o2000, 0);
    }

    #[test]
    fn existing_special_bits_survive() {
        let rule = Rule::parse("/x\t*\t*\t*********\t*********", 1).unwrap();
        assert_eq!(compute_mode(0o4755, &rule.file_perms, false), 0o4755);
    }

    #[test]
    fn apply_rewrites_mode_then_goes_quiet() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("data");
        std::fs::write(&file, "x").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600)).unwrap();

        let dir_str = tmp.path().to_str().unwrap();
        let engine = ChEngine::new(ruleset(&[format!("{dir_str}\t*\t*\trw^rw^***\t*********")]));

        let path = file.as_os_str().as_bytes();
        assert!(engine.apply(path).unwrap());
        assert_eq!(mode_of(&file), 0o660);

        // Idempotent: the second pass performs no writes
        assert!(!engine.apply(path).unwrap());
        assert_eq!(mode_of(&file), 0o660);
    }

    #[test]
    fn directories_get_setgid_from_their_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("shared");
        std::fs::create_dir(&sub).unwrap();
        std::fs::set_permissions(&sub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dir_str = tmp.path().to_str().unwrap();
        let engine =
            ChEngine::new(ruleset(&[format!("{dir_str}\t*\t*\t*********\trwxrwsr-x")]));

        assert!(engine.apply(sub.as_os_str().as_bytes()).unwrap());
        assert_eq!(mode_of(&sub), 0o2775);
        assert!(!engine.apply(sub.as_os_str().as_bytes()).unwrap());
    }

    #[test]
    fn caret_owner_resolves_to_rule_directory_owner() {
        // The rule directory and the file share an owner already, so the
        // resolution path runs without requiring privileges.
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("owned");
        std::fs::write(&file, "x").unwrap();

        let dir_str = tmp.path().to_str().unwrap();
        let engine = ChEngine::new(ruleset(&[format!("{dir_str}\t^\t^\t*********\t*********")]));

        assert!(!engine.apply(file.as_os_str().as_bytes()).unwrap());
    }

    #[test]
    fn vanished_paths_are_skipped_silently() {
        let tmp = tempfile::tempdir().unwrap();
        let dir_str = tmp.path().to_str().unwrap();
        let engine = ChEngine::new(ruleset(&[format!("{dir_str}\t*\t*\trw*******\t*********")]));

        let ghost = tmp.path().join("gone");
        assert!(!engine.apply(ghost.as_os_str().as_bytes()).unwrap());
    }

    #[test]
    fn unmatched_paths_are_no_ops() {
        let engine = ChEngine::new(ruleset(&["/covered\t*\t*\tr********\t*********".to_owned()]));
        assert!(!engine.apply(b"/elsewhere/file").unwrap());
    }

    #[test]
    fn run_accumulates_errors_without_stopping() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good");
        std::fs::write(&good, "x").unwrap();
        std::fs::set_permissions(&good, std::fs::Permissions::from_mode(0o600)).unwrap();

        // A path routed through a regular file gives ENOTDIR, a real error
        let mut bad = good.clone().into_os_string();
        bad.push("/below");

        let dir_str = tmp.path().to_str().unwrap();
        let engine = ChEngine::new(ruleset(&[format!("{dir_str}\t*\t*\trw^rw^***\t*********")]));

        let paths: Vec<&[u8]> = vec![good.as_os_str().as_bytes(), bad.as_bytes()];
        let err = engine.run(paths).unwrap_err();
        match err {
            SurveyError::Multiple(errs) => assert_eq!(errs.len(), 1),
            other => panic!("wrong error: {other}"),
        }

        // The good path was still fixed
        assert_eq!(mode_of(&good), 0o660);
    }
}
