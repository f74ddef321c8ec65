use crate::dguta::types::{AgeBucket, FileTypeClass};
use crate::error::{Result, SurveyError};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/**
One serialised rollup contribution.

The wire form is a tab-separated line,

```text
base64(dir) \t gid \t uid \t file_type_id \t age_bucket_id \t count \t size \t atime \t mtime
```

with the directory base64url-encoded (no padding) so paths containing
tabs or newlines survive. Rows written by the summariser carry
`age_bucket_id` 0 (`All`) and are fanned out by the aggregator; rows
re-serialised from a store carry their explicit bucket.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DgutaRow {
    pub dir: Vec<u8>,
    pub gid: u32,
    pub uid: u32,
    pub file_type: FileTypeClass,
    pub age: AgeBucket,
    pub count: u64,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
}

impl DgutaRow {
    /// Serialises to one newline-terminated line.
    #[must_use]
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = URL_SAFE_NO_PAD.encode(&self.dir).into_bytes();
        for field in [
            self.gid.to_string(),
            self.uid.to_string(),
            self.file_type.id().to_string(),
            self.age.id().to_string(),
            self.count.to_string(),
            self.size.to_string(),
            self.atime.to_string(),
            self.mtime.to_string(),
        ] {
            line.push(b'\t');
            line.extend_from_slice(field.as_bytes());
        }
        line.push(b'\n');
        line
    }

    /// Parses one line (with or without its trailing newline).
    pub fn parse_line(line: &str) -> Result<Self> {
        let bad = |reason: &str| SurveyError::InvalidDgutaFormat(format!("{reason}: {line:?}"));

        let fields: Vec<&str> = line.trim_end_matches('\n').split('\t').collect();
        if fields.len() != 9 {
            return Err(bad("expected 9 tab-separated fields"));
        }

        let dir = URL_SAFE_NO_PAD
            .decode(fields[0])
            .map_err(|_| bad("undecodable directory"))?;

        let int = |i: usize, what: &str| {
            fields[i]
                .parse::<i64>()
                .map_err(|_| bad(&format!("bad {what}")))
        };

        let file_type = u8::try_from(int(3, "file type id")?)
            .ok()
            .and_then(FileTypeClass::from_id)
            .ok_or_else(|| bad("file type id out of range"))?;
        let age = u8::try_from(int(4, "age bucket id")?)
            .ok()
            .and_then(AgeBucket::from_id)
            .ok_or_else(|| bad("age bucket id out of range"))?;

        Ok(Self {
            dir,
            gid: u32::try_from(int(1, "gid")?).map_err(|_| bad("gid out of range"))?,
            uid: u32::try_from(int(2, "uid")?).map_err(|_| bad("uid out of range"))?,
            file_type,
            age,
            count: u64::try_from(int(5, "count")?).map_err(|_| bad("count out of range"))?,
            size: u64::try_from(int(6, "size")?).map_err(|_| bad("size out of range"))?,
            atime: int(7, "atime")?,
            mtime: int(8, "mtime")?,
        })
    }
}
