use crate::error::{Result, SurveyError};
use crate::fs::{
    DirReader, Dirent, FileType, MAX_PATH_TOTAL, PathBufferPool, RawChild, SyscallBuffer,
    TypeCache,
};
use crate::walk::queue::{DirRequest, DirResult, FlightLimiter, Node, PriorityChannel};
use crate::walk::telemetry::{LogSink, TelemetrySink, WalkCounters};
use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_channel::{Receiver, bounded};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Fixed size of the reader pool. Sixteen threads keep a metadata-heavy
/// filesystem busy without drowning it in parallel opens.
pub const READER_THREADS: usize = 16;

/// Maximum directory results in flight between readers and the consumer;
/// the walk's backpressure bound. Must exceed the deepest legal tree
/// (every ancestor of the consumer's position holds its slot until its
/// subtree is drained), and `MAX_PATH_TOTAL / 2` bounds that depth.
const FLIGHT_CAP: usize = 4096;

/**
Cooperative cancellation for a running walk.

Readers observe the flag at every scheduling boundary; the consumer
observes it between callback invocations. Buffered directory requests are
discarded on the way down.
*/
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Builder for [`Walker`]; all options are construction-time.
#[derive(Debug, Clone)]
pub struct WalkerBuilder {
    include_dirs: bool,
    ignore_symlinks: bool,
    stats_interval: Option<Duration>,
    cancel: CancelToken,
}

impl Default for WalkerBuilder {
    fn default() -> Self {
        Self {
            include_dirs: true,
            ignore_symlinks: false,
            stats_interval: None,
            cancel: CancelToken::new(),
        }
    }
}

impl WalkerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether directory entries are handed to the path callback.
    /// Directories are traversed either way.
    #[must_use]
    pub const fn include_dirs(mut self, yes: bool) -> Self {
        self.include_dirs = yes;
        self
    }

    /// Drop symlinks at the source instead of emitting them.
    /// They are never followed in either case.
    #[must_use]
    pub const fn ignore_symlinks(mut self, yes: bool) -> Self {
        self.ignore_symlinks = yes;
        self
    }

    /// Telemetry sampling cadence; `None` disables the sampler thread.
    #[must_use]
    pub const fn stats_interval(mut self, interval: Option<Duration>) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Use an externally held cancellation token.
    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn build(self) -> Walker {
        Walker {
            include_dirs: self.include_dirs,
            ignore_symlinks: self.ignore_symlinks,
            stats_interval: self.stats_interval,
            cancel: self.cancel,
            sink: Arc::new(LogSink),
        }
    }

    /// As [`build`](Self::build) with a custom telemetry sink.
    #[must_use]
    pub fn build_with_sink(self, sink: Arc<dyn TelemetrySink>) -> Walker {
        let mut walker = self.build();
        walker.sink = sink;
        walker
    }
}

/**
The parallel directory walker.

`walk` traverses a root with a fixed pool of [`READER_THREADS`] reader
threads fed from a central priority channel, and delivers every entry to
the path callback in strict depth-first order with children in ascending
lexicographic byte order of their basenames. Parents are always delivered
before their children; symbolic links are never followed.

Each directory is read in one batch and its sorted result is handed over
through a one-shot channel; the consumer replays nested results with an
explicit stack, which reconstructs the depth-first order however the
reads were interleaved across threads.

Per-path failures go to the error callback and abort only the offending
subtree. An error returned by the path callback terminates the whole walk
promptly and is returned from `walk`.
*/
pub struct Walker {
    include_dirs: bool,
    ignore_symlinks: bool,
    stats_interval: Option<Duration>,
    cancel: CancelToken,
    sink: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for Walker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Walker")
            .field("include_dirs", &self.include_dirs)
            .field("ignore_symlinks", &self.ignore_symlinks)
            .field("stats_interval", &self.stats_interval)
            .finish_non_exhaustive()
    }
}

impl Walker {
    #[must_use]
    pub fn init() -> WalkerBuilder {
        WalkerBuilder::new()
    }

    /// A clone of this walker's cancellation token.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /**
    Walks `root`, invoking `path_cb` once per entry (the root included)
    and `error_cb` once per per-path failure.

    # Errors
    Returns the first error produced by `path_cb`, `Cancelled` if the
    token fired, or an `Io` error when the root itself cannot be opened.
    */
    pub fn walk<F, E>(&self, root: &[u8], mut path_cb: F, mut error_cb: E) -> Result<()>
    where
        F: FnMut(&Dirent) -> Result<()>,
        E: FnMut(&[u8], &SurveyError),
    {
        let root_ns = normalise_root(root);
        if root_ns.len() >= MAX_PATH_TOTAL {
            let len = root_ns.len();
            return Err(SurveyError::NameTooLong {
                path: root_ns.into(),
                len,
            });
        }

        let st = crate::fs::lstat(&root_ns)?;
        if !FileType::from_mode(st.st_mode).is_dir() {
            return Err(SurveyError::io(
                &root_ns,
                std::io::Error::from_raw_os_error(libc::ENOTDIR),
            ));
        }

        let mut root_path = root_ns;
        if root_path != b"/" {
            root_path.push(b'/');
        }

        let queue = Arc::new(PriorityChannel::new());
        let limiter = FlightLimiter::new(FLIGHT_CAP);
        let counters = Arc::new(WalkCounters::default());
        let type_cache = Arc::new(TypeCache::new());
        let (root_tx, root_rx) = bounded(1);

        queue.push(DirRequest {
            path: root_path.clone(),
            tx: root_tx,
        });

        let mut readers = Vec::with_capacity(READER_THREADS);
        for _ in 0..READER_THREADS {
            let ctx = ReaderContext {
                queue: Arc::clone(&queue),
                limiter: Arc::clone(&limiter),
                counters: Arc::clone(&counters),
                type_cache: Arc::clone(&type_cache),
                cancel: self.cancel.clone(),
                ignore_symlinks: self.ignore_symlinks,
            };
            readers.push(thread::spawn(move || ctx.run()));
        }

        let sampler = self.stats_interval.map(|interval| {
            let counters = Arc::clone(&counters);
            let sink = Arc::clone(&self.sink);
            let (stop_tx, stop_rx) = bounded::<()>(0);
            let handle = thread::spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            sink.sample(counters.snapshot());
                        }
                        _ => break,
                    }
                }
            });
            (stop_tx, handle)
        });

        let root_dirent = Dirent::new(root_path, FileType::Directory, st.st_ino);
        let result = self.drive(root_dirent, root_rx, &mut path_cb, &mut error_cb);

        // Wake idle readers and anyone waiting on a flight slot.
        queue.close();
        limiter.close();
        for handle in readers {
            let _ = handle.join();
        }

        if let Some((stop_tx, handle)) = sampler {
            drop(stop_tx);
            let _ = handle.join();
            self.sink.sample(counters.snapshot());
        }

        result
    }

    /// The consumer side: replays nested one-shot directory results as one
    /// depth-first entry stream.
    fn drive<F, E>(
        &self,
        root: Dirent,
        root_rx: Receiver<DirResult>,
        path_cb: &mut F,
        error_cb: &mut E,
    ) -> Result<()>
    where
        F: FnMut(&Dirent) -> Result<()>,
        E: FnMut(&[u8], &SurveyError),
    {
        struct Frame {
            nodes: std::vec::IntoIter<Node>,
            _permit: crate::walk::queue::Permit,
        }

        let mut stack: Vec<Frame> = Vec::new();

        self.deliver(root, path_cb)?;
        match root_rx.recv() {
            Ok(result) => stack.push(Frame {
                nodes: result.nodes.into_iter(),
                _permit: result.permit,
            }),
            // Readers only vanish without answering during cancellation
            Err(_) => {
                return if self.cancel.is_cancelled() {
                    Err(SurveyError::Cancelled)
                } else {
                    Ok(())
                };
            }
        }

        while let Some(frame) = stack.last_mut() {
            if self.cancel.is_cancelled() {
                return Err(SurveyError::Cancelled);
            }

            match frame.nodes.next() {
                None => {
                    stack.pop();
                }
                Some(Node::Entry(entry)) => self.deliver(entry, path_cb)?,
                Some(Node::Error(path, err)) => error_cb(&path, &err),
                Some(Node::Subdir(entry, child_rx)) => {
                    self.deliver(entry, path_cb)?;
                    if let Ok(result) = child_rx.recv() {
                        stack.push(Frame {
                            nodes: result.nodes.into_iter(),
                            _permit: result.permit,
                        });
                    }
                    // A dead channel here means shutdown; the loop's
                    // cancellation check picks it up.
                }
            }
        }

        Ok(())
    }

    /// Invokes the callback (subject to `include_dirs`), then recycles the
    /// entry's path buffer. Callbacks must not retain borrowed views.
    fn deliver<F>(&self, entry: Dirent, path_cb: &mut F) -> Result<()>
    where
        F: FnMut(&Dirent) -> Result<()>,
    {
        let wanted = self.include_dirs || !entry.is_dir();
        if wanted {
            path_cb(&entry)?;
        }
        PathBufferPool::global().release(entry.into_path());
        Ok(())
    }
}

/// Everything a reader thread needs; owned per thread.
struct ReaderContext {
    queue: Arc<PriorityChannel>,
    limiter: Arc<FlightLimiter>,
    counters: Arc<WalkCounters>,
    type_cache: Arc<TypeCache>,
    cancel: CancelToken,
    ignore_symlinks: bool,
}

impl ReaderContext {
    fn run(self) {
        // One kernel buffer per thread, reused for every directory.
        let mut buf = Box::new(SyscallBuffer::new());

        while let Some(req) = self.queue.pop() {
            if self.cancel.is_cancelled() {
                // Dropping the sender closes the subtree's one-shot channel.
                continue;
            }
            let Some(permit) = self.limiter.acquire() else {
                break;
            };
            self.process_directory(req, permit, &mut buf);
        }
    }

    /**
    Reads one directory completely, sorts its children and hands the
    result over in a single send. Child directories are scheduled back
    into the priority channel; their receivers travel inside the parent's
    result so depth-first order survives arbitrary read interleavings.
    */
    fn process_directory(
        &self,
        req: DirRequest,
        permit: crate::walk::queue::Permit,
        buf: &mut SyscallBuffer,
    ) {
        let pool = PathBufferPool::global();
        let dir_path = req.path;

        // The request path carries its trailing slash; the open wants none.
        let open_path = if dir_path.as_slice() == b"/" {
            &dir_path[..]
        } else {
            &dir_path[..dir_path.len() - 1]
        };

        self.counters.open.fetch_add(1, Ordering::Relaxed);
        let mut reader = match DirReader::open(open_path, buf) {
            Ok(r) => r.with_type_cache(Arc::clone(&self.type_cache)),
            Err(err) => {
                let _ = req.tx.send(DirResult {
                    nodes: vec![Node::Error(dir_path.clone(), err)],
                    permit,
                });
                pool.release(dir_path);
                return;
            }
        };

        let mut children: Vec<RawChild> = Vec::new();
        let read_result = loop {
            match reader.next_child() {
                Ok(Some(child)) => {
                    if self.ignore_symlinks && child.file_type == FileType::Symlink {
                        continue;
                    }
                    children.push(child);
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.harvest(reader);

        if let Err(err) = read_result {
            let _ = req.tx.send(DirResult {
                nodes: vec![Node::Error(dir_path.clone(), err)],
                permit,
            });
            pool.release(dir_path);
            return;
        }

        children.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        let mut nodes = Vec::with_capacity(children.len());
        for child in children {
            if self.cancel.is_cancelled() {
                break;
            }

            let name_len = child.name.len();
            let base_len = dir_path.len() + name_len;
            // +1 for a directory's suffix slash, +1 for the NUL a later
            // syscall will append.
            if base_len + 2 > MAX_PATH_TOTAL {
                let mut long = dir_path.clone();
                long.extend_from_slice(&child.name);
                let len = long.len();
                nodes.push(Node::Error(
                    long.clone(),
                    SurveyError::NameTooLong {
                        path: long.into(),
                        len,
                    },
                ));
                continue;
            }

            if child.file_type.is_dir() {
                let mut emit_path = pool.acquire(base_len + 1);
                emit_path.extend_from_slice(&dir_path);
                emit_path.extend_from_slice(&child.name);
                emit_path.push(b'/');

                let mut req_path = pool.acquire(base_len + 1);
                req_path.extend_from_slice(&emit_path);

                let (child_tx, child_rx) = bounded(1);
                self.queue.push(DirRequest {
                    path: req_path,
                    tx: child_tx,
                });

                nodes.push(Node::Subdir(
                    Dirent::new(emit_path, FileType::Directory, child.inode),
                    child_rx,
                ));
            } else {
                let mut path = pool.acquire(base_len);
                path.extend_from_slice(&dir_path);
                path.extend_from_slice(&child.name);

                nodes.push(Node::Entry(Dirent::new(path, child.file_type, child.inode)));
            }
        }

        // The send cannot block: the channel holds one message and this is
        // its only sender. A dead receiver just means the walk ended.
        let _ = req.tx.send(DirResult { nodes, permit });
        pool.release(dir_path);
    }

    fn harvest(&self, reader: DirReader<'_>) {
        self.counters
            .read_calls
            .fetch_add(reader.read_calls, Ordering::Relaxed);
        self.counters
            .read_bytes
            .fetch_add(reader.read_bytes, Ordering::Relaxed);
        self.counters
            .stat
            .fetch_add(reader.stat_fallbacks, Ordering::Relaxed);
        drop(reader);
        self.counters.close.fetch_add(1, Ordering::Relaxed);
    }
}

/// Strips trailing slashes from the root argument; `/` stays itself.
fn normalise_root(root: &[u8]) -> Vec<u8> {
    let mut out = root.to_vec();
    while out.len() > 1 && out.last() == Some(&b'/') {
        out.pop();
    }
    if out.is_empty() {
        out.push(b'/');
    }
    out
}
