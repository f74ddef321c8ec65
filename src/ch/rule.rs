use crate::error::{Result, SurveyError};
use crate::tree::PrefixTree;
use regex::Regex;
use std::io::BufRead;
use std::sync::OnceLock;

/// POSIX user/group name pattern accepted in the user and group columns.
fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}\$?$").unwrap_or_else(|_| unreachable!()))
}

/// Nine-character permission spec: three triads, `s` only at exec slots.
fn perm_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[rwx*^-][rwx*^-][rwxs*^-]){3}$").unwrap_or_else(|_| unreachable!())
    })
}

/// What to do with one permission bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermAction {
    /// `r`/`w`/`x`/`s`: force the bit on.
    Set,
    /// `-`: force the bit off.
    Clear,
    /// `*`: keep whatever is there.
    Preserve,
    /// `^`: on iff the same column is on anywhere in the triads
    /// after preservation.
    Mirror,
}

impl PermAction {
    const fn from_char(c: u8) -> Self {
        match c {
            b'-' => Self::Clear,
            b'*' => Self::Preserve,
            b'^' => Self::Mirror,
            _ => Self::Set,
        }
    }
}

/**
A parsed nine-character permission column.

Keeps the original bytes alongside the decoded actions so a rules file
formats back byte-identically.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermSpec {
    pub(crate) actions: [PermAction; 9],
    raw: [u8; 9],
}

impl PermSpec {
    fn parse(field: &str, line_no: usize) -> Result<Self> {
        if !perm_pattern().is_match(field) {
            return Err(SurveyError::InvalidRuleFormat {
                line: line_no,
                reason: format!("bad permission spec {field:?}"),
            });
        }

        let bytes = field.as_bytes();
        let mut raw = [0u8; 9];
        raw.copy_from_slice(bytes);

        // Mirrors must line up: for each column, ^ appears in none of the
        // triads, in two of them, or in all three.
        for col in 0..3 {
            let mirrors = (0..3).filter(|triad| bytes[triad * 3 + col] == b'^').count();
            if mirrors == 1 {
                return Err(SurveyError::InvalidRuleFormat {
                    line: line_no,
                    reason: format!(
                        "^ must appear in at least two triads at the same position: {field:?}"
                    ),
                });
            }
        }

        let mut actions = [PermAction::Preserve; 9];
        for (i, &b) in bytes.iter().enumerate() {
            actions[i] = PermAction::from_char(b);
        }

        Ok(Self { actions, raw })
    }

    /// The original nine bytes, for formatting.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // raw came from a validated &str of ASCII
        core::str::from_utf8(&self.raw).unwrap_or("*********")
    }

    /// True when the group triad's exec slot is the literal `s`
    /// (setgid request, honoured on directories).
    #[must_use]
    pub const fn wants_setgid(&self) -> bool {
        self.raw[5] == b's'
    }
}

/// The user or group column of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerSpec {
    /// `*`: leave ownership alone.
    Unchanged,
    /// `^`: copy from the owner of the rule's directory, resolved lazily.
    FromDir,
    /// A literal name, resolved to its id when the rules file is loaded.
    Named { name: String, id: u32 },
}

impl OwnerSpec {
    fn format(&self) -> &str {
        match self {
            Self::Unchanged => "*",
            Self::FromDir => "^",
            Self::Named { name, .. } => name,
        }
    }
}

fn parse_owner<F>(field: &str, line_no: usize, resolve: F, what: &str) -> Result<OwnerSpec>
where
    F: Fn(&str) -> Option<u32>,
{
    match field {
        "*" => Ok(OwnerSpec::Unchanged),
        "^" => Ok(OwnerSpec::FromDir),
        name if name_pattern().is_match(name) => {
            let id = resolve(name).ok_or_else(|| SurveyError::InvalidRuleFormat {
                line: line_no,
                reason: format!("unknown {what} {name:?}"),
            })?;
            Ok(OwnerSpec::Named {
                name: name.to_owned(),
                id,
            })
        }
        other => Err(SurveyError::InvalidRuleFormat {
            line: line_no,
            reason: format!("bad {what} spec {other:?}"),
        }),
    }
}

/**
One line of the rules file: which directory it covers, the ownership to
enforce and the permission treatment for files and directories beneath it.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub directory: Vec<u8>,
    pub user: OwnerSpec,
    pub group: OwnerSpec,
    pub file_perms: PermSpec,
    pub dir_perms: PermSpec,
}

impl Rule {
    /**
    Parses one non-comment line.

    The directory column may itself contain tabs: the *last four* tabs on
    the line delimit the trailing fixed columns, everything before them is
    the directory, stored verbatim.
    */
    pub fn parse(line: &str, line_no: usize) -> Result<Self> {
        let mut rev = line.trim_end_matches('\n').rsplitn(5, '\t');
        let bad = |reason: &str| SurveyError::InvalidRuleFormat {
            line: line_no,
            reason: reason.to_owned(),
        };

        let dir_perm_field = rev.next().ok_or_else(|| bad("empty line"))?;
        let file_perm_field = rev.next().ok_or_else(|| bad("missing directory perms"))?;
        let group_field = rev.next().ok_or_else(|| bad("missing group"))?;
        let user_field = rev.next().ok_or_else(|| bad("missing user"))?;
        let directory = rev.next().ok_or_else(|| bad("missing directory"))?;

        if directory.is_empty() {
            return Err(bad("empty directory column"));
        }

        Ok(Self {
            directory: directory.as_bytes().to_vec(),
            user: parse_owner(
                user_field,
                line_no,
                |n| uzers::get_user_by_name(n).map(|u| u.uid()),
                "user",
            )?,
            group: parse_owner(
                group_field,
                line_no,
                |n| uzers::get_group_by_name(n).map(|g| g.gid()),
                "group",
            )?,
            file_perms: PermSpec::parse(file_perm_field, line_no)?,
            dir_perms: PermSpec::parse(dir_perm_field, line_no)?,
        })
    }

    /// Serialises back to the exact tab-separated line it came from.
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            String::from_utf8_lossy(&self.directory),
            self.user.format(),
            self.group.format(),
            self.file_perms.as_str(),
            self.dir_perms.as_str(),
        )
    }
}

/**
All rules of one file, loaded into a prefix tree keyed by directory.

Lookup returns the rule of the longest registered prefix; when two rules
name the same directory the later line wins.
*/
#[derive(Debug, Default)]
pub struct RuleSet {
    tree: PrefixTree<Rule>,
    len: usize,
}

impl RuleSet {
    /**
    Parses a rules TSV. Blank lines and lines starting with `#` are
    skipped.

    # Errors
    `InvalidRuleFormat` naming the first offending line.
    */
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut set = Self::default();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(SurveyError::from)?;
            let line_no = idx + 1;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            set.add(Rule::parse(&line, line_no)?);
        }

        Ok(set)
    }

    pub fn add(&mut self, rule: Rule) {
        self.tree.insert(&rule.directory.clone(), rule);
        self.len += 1;
    }

    /// The rule covering `path`, by longest registered directory prefix.
    #[must_use]
    pub fn get(&self, path: &[u8]) -> Option<&Rule> {
        self.tree.longest_prefix(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{OwnerSpec, PermAction, Rule, RuleSet};
    use crate::error::SurveyError;
    use std::io::BufReader;

    #[test]
    fn round_trips_the_reference_line() {
        let line = "/a/b\t*\t^\trw^rw^***\trw*rws***";
        let rule = Rule::parse(line, 1).unwrap();

        assert_eq!(rule.directory, b"/a/b");
        assert_eq!(rule.user, OwnerSpec::Unchanged);
        assert_eq!(rule.group, OwnerSpec::FromDir);
        assert_eq!(rule.file_perms.actions[0], PermAction::Set); // u r
        assert_eq!(rule.file_perms.actions[1], PermAction::Set); // u w
        assert_eq!(rule.file_perms.actions[2], PermAction::Mirror); // u x
        assert_eq!(rule.file_perms.actions[5], PermAction::Mirror); // g x
        assert_eq!(rule.file_perms.actions[6], PermAction::Preserve); // o r
        assert!(rule.dir_perms.wants_setgid());

        assert_eq!(rule.format(), line);
    }

    #[test]
    fn directory_column_may_contain_tabs() {
        let line = "/odd\tname\t*\t*\t*********\t*********";
        let rule = Rule::parse(line, 1).unwrap();
        assert_eq!(rule.directory, b"/odd\tname");
        assert_eq!(rule.format(), line);
    }

    #[test]
    fn lone_mirror_is_rejected() {
        let err = Rule::parse("/a\t*\t*\t^********\t*********", 3).unwrap_err();
        match err {
            SurveyError::InvalidRuleFormat { line, .. } => assert_eq!(line, 3),
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn mirrors_in_all_three_triads_are_fine() {
        assert!(Rule::parse("/a\t*\t*\t^**^**^**\t*********", 1).is_ok());
    }

    #[test]
    fn bad_perm_characters_are_rejected() {
        assert!(Rule::parse("/a\t*\t*\tqw*rw****\t*********", 1).is_err());
        // s outside an exec slot
        assert!(Rule::parse("/a\t*\t*\tsw*rw****\t*********", 1).is_err());
        // too short
        assert!(Rule::parse("/a\t*\t*\trw*\t*********", 1).is_err());
    }

    #[test]
    fn bad_owner_specs_are_rejected() {
        assert!(Rule::parse("/a\tUPPER\t*\t*********\t*********", 1).is_err());
        assert!(Rule::parse("/a\t*\t9lives\t*********\t*********", 1).is_err());
    }

    #[test]
    fn missing_columns_are_rejected() {
        assert!(Rule::parse("/a\t*\t*********\t*********", 1).is_err());
    }

    #[test]
    fn ruleset_skips_comments_and_matches_longest_prefix() {
        let tsv = "\
# ownership rules
/a\t*\t*\tr********\t*********

/a/b\t*\t*\tw********\t*********
";
        let set = RuleSet::from_reader(BufReader::new(tsv.as_bytes())).unwrap();
        assert_eq!(set.len(), 2);

        assert_eq!(
            set.get(b"/a/b/deep/file").unwrap().file_perms.as_str(),
            "w********"
        );
        assert_eq!(set.get(b"/a/other").unwrap().file_perms.as_str(), "r********");
        assert!(set.get(b"/elsewhere").is_none());
    }

    #[test]
    fn later_rule_for_same_directory_wins() {
        let tsv = "/a\t*\t*\tr********\t*********\n/a\t*\t*\tw********\t*********\n";
        let set = RuleSet::from_reader(BufReader::new(tsv.as_bytes())).unwrap();
        assert_eq!(set.get(b"/a/x").unwrap().file_perms.as_str(), "w********");
    }
}
