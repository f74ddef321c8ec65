mod output;
mod queue;
mod telemetry;
mod walker;

pub use output::OutputFiles;
pub use telemetry::{CounterSnapshot, LogSink, TelemetrySink, WalkCounters};
pub use walker::{CancelToken, READER_THREADS, Walker, WalkerBuilder};
