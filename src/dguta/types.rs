use serde::{Deserialize, Serialize};

/// Seconds in one accounting month (1/12 of a Julian year).
pub const SECONDS_PER_MONTH: i64 = 2_628_000;

/// Seconds in one Julian year.
pub const SECONDS_PER_YEAR: i64 = 31_557_600;

/**
The sixteen file-type classes a path can roll up under.

Discriminants are the wire ids of the row stream and are frozen; never
reorder. Classification works on the lower-cased basename suffix, with
`Temp` additionally derived from path structure and `Dir` from the stat
type. A temp-matching file contributes under both `Temp` and its
extension class.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileTypeClass {
    Other = 0,
    Temp = 1,
    Vcf = 2,
    VcfGz = 3,
    Bcf = 4,
    Sam = 5,
    Bam = 6,
    Cram = 7,
    Index = 8,
    Checkpoint = 9,
    Fasta = 10,
    Fastq = 11,
    Compressed = 12,
    Uncompressed = 13,
    Log = 14,
    Dir = 15,
}

impl FileTypeClass {
    pub const COUNT: usize = 16;

    #[must_use]
    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Other,
            1 => Self::Temp,
            2 => Self::Vcf,
            3 => Self::VcfGz,
            4 => Self::Bcf,
            5 => Self::Sam,
            6 => Self::Bam,
            7 => Self::Cram,
            8 => Self::Index,
            9 => Self::Checkpoint,
            10 => Self::Fasta,
            11 => Self::Fastq,
            12 => Self::Compressed,
            13 => Self::Uncompressed,
            14 => Self::Log,
            15 => Self::Dir,
            _ => return None,
        })
    }

    /**
    Classifies a path into its extension class plus an optional extra
    `Temp` membership.

    Directories are always, and only, `Dir`. Specific suffixes beat the
    generic sets: `.vcf.gz` is `VcfGz` rather than `Compressed`, `.bcf`
    is `Bcf` rather than `Index`.
    */
    #[must_use]
    pub fn classify(path: &[u8], is_dir: bool) -> (Self, bool) {
        if is_dir {
            return (Self::Dir, false);
        }

        let base = basename_lower(path);
        (Self::from_suffix(&base), is_temp(path, &base))
    }

    fn from_suffix(base: &[u8]) -> Self {
        // Double extensions first, then single ones.
        if ends_with(base, b".vcf.gz") {
            return Self::VcfGz;
        }
        if ends_with(base, b".fastq.gz") || ends_with(base, b".fq.gz") {
            return Self::Fastq;
        }

        const TABLE: &[(&[u8], FileTypeClass)] = &[
            (b".vcf", FileTypeClass::Vcf),
            (b".bcf", FileTypeClass::Bcf),
            (b".sam", FileTypeClass::Sam),
            (b".bam", FileTypeClass::Bam),
            (b".cram", FileTypeClass::Cram),
            (b".crai", FileTypeClass::Index),
            (b".bai", FileTypeClass::Index),
            (b".csi", FileTypeClass::Index),
            (b".sai", FileTypeClass::Index),
            (b".fai", FileTypeClass::Index),
            (b".tbi", FileTypeClass::Index),
            (b".gzi", FileTypeClass::Index),
            (b".jobstate", FileTypeClass::Checkpoint),
            (b".fasta", FileTypeClass::Fasta),
            (b".fa", FileTypeClass::Fasta),
            (b".fastq", FileTypeClass::Fastq),
            (b".fq", FileTypeClass::Fastq),
            (b".bz2", FileTypeClass::Compressed),
            (b".gz", FileTypeClass::Compressed),
            (b".tgz", FileTypeClass::Compressed),
            (b".zip", FileTypeClass::Compressed),
            (b".xz", FileTypeClass::Compressed),
            (b".bzip2", FileTypeClass::Compressed),
            (b".csv", FileTypeClass::Uncompressed),
            (b".tsv", FileTypeClass::Uncompressed),
            (b".txt", FileTypeClass::Uncompressed),
            (b".text", FileTypeClass::Uncompressed),
            (b".readme", FileTypeClass::Uncompressed),
            (b".log", FileTypeClass::Log),
            (b".o", FileTypeClass::Log),
            (b".e", FileTypeClass::Log),
            (b".oe", FileTypeClass::Log),
            (b".err", FileTypeClass::Log),
            (b".out", FileTypeClass::Log),
        ];

        for (suffix, class) in TABLE {
            if ends_with(base, suffix) {
                return *class;
            }
        }

        Self::Other
    }
}

fn ends_with(base: &[u8], suffix: &[u8]) -> bool {
    base.len() > suffix.len() && base.ends_with(suffix)
}

fn basename_lower(path: &[u8]) -> Vec<u8> {
    let base = memchr::memrchr(b'/', path).map_or(path, |pos| &path[pos + 1..]);
    base.to_ascii_lowercase()
}

fn is_temp(path: &[u8], base: &[u8]) -> bool {
    if ends_with(base, b".tmp") || ends_with(base, b".temp") {
        return true;
    }
    // A "/tmp/" component anywhere marks the whole subtree as scratch.
    memchr::memmem::find(path, b"/tmp/").is_some()
}

/**
The sixteen age buckets.

`All` takes every record; an `A*` bucket takes records whose atime is at
least that threshold old, an `M*` bucket likewise for mtime. Ids are the
wire numbering of the row stream: 0 is `All`, 1–7 the atime buckets
youngest-first, 8–15 the mtime buckets oldest-first so that id 15 is
`M1M`.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AgeBucket {
    All = 0,
    A1M = 1,
    A2M = 2,
    A6M = 3,
    A1Y = 4,
    A2Y = 5,
    A3Y = 6,
    A5Y = 7,
    M7Y = 8,
    M5Y = 9,
    M3Y = 10,
    M2Y = 11,
    M1Y = 12,
    M6M = 13,
    M2M = 14,
    M1M = 15,
}

impl AgeBucket {
    pub const COUNT: usize = 16;

    #[must_use]
    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::All,
            1 => Self::A1M,
            2 => Self::A2M,
            3 => Self::A6M,
            4 => Self::A1Y,
            5 => Self::A2Y,
            6 => Self::A3Y,
            7 => Self::A5Y,
            8 => Self::M7Y,
            9 => Self::M5Y,
            10 => Self::M3Y,
            11 => Self::M2Y,
            12 => Self::M1Y,
            13 => Self::M6M,
            14 => Self::M2M,
            15 => Self::M1M,
            _ => return None,
        })
    }

    /// Minimum age in seconds a record's clock must reach for this bucket.
    #[must_use]
    pub const fn threshold(self) -> i64 {
        match self {
            Self::All => 0,
            Self::A1M | Self::M1M => SECONDS_PER_MONTH,
            Self::A2M | Self::M2M => 2 * SECONDS_PER_MONTH,
            Self::A6M | Self::M6M => 6 * SECONDS_PER_MONTH,
            Self::A1Y | Self::M1Y => SECONDS_PER_YEAR,
            Self::A2Y | Self::M2Y => 2 * SECONDS_PER_YEAR,
            Self::A3Y | Self::M3Y => 3 * SECONDS_PER_YEAR,
            Self::A5Y | Self::M5Y => 5 * SECONDS_PER_YEAR,
            Self::M7Y => 7 * SECONDS_PER_YEAR,
        }
    }

    const ATIME_BUCKETS: [Self; 7] = [
        Self::A1M,
        Self::A2M,
        Self::A6M,
        Self::A1Y,
        Self::A2Y,
        Self::A3Y,
        Self::A5Y,
    ];

    const MTIME_BUCKETS: [Self; 8] = [
        Self::M1M,
        Self::M2M,
        Self::M6M,
        Self::M1Y,
        Self::M2Y,
        Self::M3Y,
        Self::M5Y,
        Self::M7Y,
    ];

    /**
    Every bucket a record with the given clocks lands in, as observed at
    `now`: `All`, each atime bucket the atime is old enough for, and each
    mtime bucket likewise.
    */
    pub fn fanout(now: i64, atime: i64, mtime: i64) -> impl Iterator<Item = Self> {
        let a_age = now.saturating_sub(atime);
        let m_age = now.saturating_sub(mtime);

        core::iter::once(Self::All)
            .chain(
                Self::ATIME_BUCKETS
                    .into_iter()
                    .filter(move |b| a_age >= b.threshold()),
            )
            .chain(
                Self::MTIME_BUCKETS
                    .into_iter()
                    .filter(move |b| m_age >= b.threshold()),
            )
    }
}

/// The aggregation key inside one directory's rollup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GutaKey {
    pub gid: u32,
    pub uid: u32,
    pub file_type: FileTypeClass,
    pub age: AgeBucket,
}

/// The aggregated value for one [`GutaKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GutaValue {
    pub count: u64,
    pub size: u64,
    /// Minimum access time seen.
    pub atime: i64,
    /// Maximum modification time seen.
    pub mtime: i64,
}

impl GutaValue {
    #[must_use]
    pub const fn new(count: u64, size: u64, atime: i64, mtime: i64) -> Self {
        Self {
            count,
            size,
            atime,
            mtime,
        }
    }

    /// Count and size add; atime keeps the minimum, mtime the maximum.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.size += other.size;
        self.atime = self.atime.min(other.atime);
        self.mtime = self.mtime.max(other.mtime);
    }
}
