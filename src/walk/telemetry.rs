use core::sync::atomic::{AtomicU64, Ordering};

/// Syscall counters shared by all reader threads of one walk.
#[derive(Debug, Default)]
pub struct WalkCounters {
    pub(crate) open: AtomicU64,
    pub(crate) read_calls: AtomicU64,
    pub(crate) read_bytes: AtomicU64,
    pub(crate) stat: AtomicU64,
    pub(crate) close: AtomicU64,
}

impl WalkCounters {
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            open: self.open.load(Ordering::Relaxed),
            read_calls: self.read_calls.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            stat: self.stat.load(Ordering::Relaxed),
            close: self.close.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the walk's syscall counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub open: u64,
    pub read_calls: u64,
    pub read_bytes: u64,
    /// `fstatat` fallbacks for `DT_UNKNOWN` entries, not ordinary stats.
    pub stat: u64,
    pub close: u64,
}

/// Receives periodic counter samples while a walk is running.
pub trait TelemetrySink: Send + Sync {
    fn sample(&self, snap: CounterSnapshot);
}

/// Default sink: one debug line per sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn sample(&self, snap: CounterSnapshot) {
        log::debug!(
            "walk telemetry: open={} reads={} read_bytes={} stat_fallbacks={} close={}",
            snap.open,
            snap.read_calls,
            snap.read_bytes,
            snap.stat,
            snap.close
        );
    }
}
