//! Rotating, batching event log writer.
//!
//! Records out-of-band activity between computations. Producers hand
//! lines to a single flusher task; the target file is opened only for
//! the duration of a flush so the surrounding directory can be moved
//! or deleted by other processes in between.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-stream buffer capacity; whole lines beyond this are enqueued
/// even without a trailing newline.
const STREAM_BUFFER: usize = 1024;

/// How many lines the writer queues before producers see overflow.
const QUEUE_DEPTH: usize = 256;

/// Tuning for one event log writer.
#[derive(Clone, Debug)]
pub struct EventLogConfig {
    /// Rotate once the target file grows past this many bytes.
    pub rotate_size: u64,
    /// Rotated backups to retain; 0 keeps only the primary file.
    pub file_count: usize,
    /// Flush at least this often while lines are pending.
    pub flush_interval: Duration,
    /// Flush as soon as this many bytes are pending.
    pub flush_size: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            rotate_size: 32 * 1024,
            file_count: 5,
            flush_interval: Duration::from_millis(250),
            flush_size: 1024,
        }
    }
}

/// Supplies the target file for each flush. Re-queried every time so
/// the log follows its container across moves; `None` defers the
/// flush (the host is mid-move and writing is not permitted).
pub trait LogFileSupplier: Send + Sync {
    fn target(&self) -> Option<PathBuf>;
}

impl<F> LogFileSupplier for F
where
    F: Fn() -> Option<PathBuf> + Send + Sync,
{
    fn target(&self) -> Option<PathBuf> {
        self()
    }
}

enum Command {
    /// One or more whole lines, newline-terminated.
    Lines(Vec<u8>),
    /// Stream closed; flush whatever is pending.
    Sentinel,
}

/// Multi-producer, single-consumer rotating log writer.
pub struct EventLogWriter {
    tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogWriter").finish_non_exhaustive()
    }
}

impl EventLogWriter {
    /// Spawns the flusher task. Must be called within a tokio runtime.
    pub fn new(supplier: Arc<dyn LogFileSupplier>, config: EventLogConfig) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(flusher(rx, supplier, config, shutdown.clone()));
        Self {
            tx,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Opens an ordinary write stream. Streams buffer up to 1 KiB and
    /// enqueue whole lines; enqueueing never blocks and surfaces
    /// "buffer full" on overflow.
    pub fn open_stream(&self) -> EventLogStream {
        EventLogStream {
            buf: Vec::with_capacity(STREAM_BUFFER),
            tx: self.tx.clone(),
        }
    }

    /// Flushes pending lines and stops the flusher. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!("event log flusher ended abnormally: {}", err);
        }
    }
}

/// Write half handed to producers. Dropping the stream enqueues any
/// buffered partial line followed by the close sentinel.
pub struct EventLogStream {
    buf: Vec<u8>,
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for EventLogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogStream")
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl EventLogStream {
    fn offer(&self, lines: Vec<u8>) -> io::Result<()> {
        self.tx.try_send(Command::Lines(lines)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "event log buffer full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "event log writer closed")
            }
        })
    }

    /// Enqueues every complete line currently buffered; a trailing
    /// partial line stays behind unless the buffer is over capacity.
    fn drain_lines(&mut self, force: bool) -> io::Result<()> {
        let cut = match self.buf.iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None if force && self.buf.len() > STREAM_BUFFER => self.buf.len(),
            None => return Ok(()),
        };
        let rest = self.buf.split_off(cut);
        let lines = std::mem::replace(&mut self.buf, rest);
        if lines.is_empty() {
            return Ok(());
        }
        self.offer(lines)
    }
}

impl io::Write for EventLogStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.drain_lines(true)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_lines(false)
    }
}

impl Drop for EventLogStream {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let leftover = std::mem::take(&mut self.buf);
            let _ = self.tx.try_send(Command::Lines(leftover));
        }
        let _ = self.tx.try_send(Command::Sentinel);
    }
}

struct FlushState {
    pending: Vec<u8>,
    last_flush: Instant,
    append_next_open: bool,
    logged_error: bool,
}

async fn flusher(
    mut rx: mpsc::Receiver<Command>,
    supplier: Arc<dyn LogFileSupplier>,
    config: EventLogConfig,
    shutdown: CancellationToken,
) {
    let mut state = FlushState {
        pending: Vec::new(),
        last_flush: Instant::now(),
        append_next_open: false,
        logged_error: false,
    };
    let mut ticker = interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Drain whatever producers managed to enqueue, then stop.
                while let Ok(cmd) = rx.try_recv() {
                    if let Command::Lines(lines) = cmd {
                        state.pending.extend_from_slice(&lines);
                    }
                }
                flush(&supplier, &config, &mut state).await;
                return;
            }
            cmd = rx.recv() => match cmd {
                Some(Command::Lines(lines)) => {
                    state.pending.extend_from_slice(&lines);
                    if state.pending.len() >= config.flush_size {
                        flush(&supplier, &config, &mut state).await;
                    }
                }
                Some(Command::Sentinel) => {
                    flush(&supplier, &config, &mut state).await;
                }
                None => {
                    flush(&supplier, &config, &mut state).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if !state.pending.is_empty()
                    && state.last_flush.elapsed() >= config.flush_interval
                {
                    flush(&supplier, &config, &mut state).await;
                }
            }
        }
    }
}

/// One flush: consult the supplier, rotate when due, open, drain,
/// close. I/O failures are swallowed so producers never break; the
/// first failure is logged.
async fn flush(
    supplier: &Arc<dyn LogFileSupplier>,
    config: &EventLogConfig,
    state: &mut FlushState,
) {
    if state.pending.is_empty() {
        return;
    }
    // Host said no (e.g. the container is mid-move): defer silently.
    let Some(target) = supplier.target() else {
        return;
    };

    if let Err(err) = write_out(config, state, &target).await {
        if !state.logged_error {
            warn!("event log flush to {} failed: {}", target.display(), err);
            state.logged_error = true;
        }
        return;
    }
    state.logged_error = false;
    state.pending.clear();
    state.append_next_open = true;
    state.last_flush = Instant::now();
}

async fn write_out(
    config: &EventLogConfig,
    state: &FlushState,
    target: &PathBuf,
) -> io::Result<()> {
    if let Some(parent) = target.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent).await?;
    }

    let size = match fs::metadata(target).await {
        Ok(meta) => Some(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(err),
    };
    let rotate = match size {
        Some(size) => size > config.rotate_size || !state.append_next_open,
        None => false,
    };
    if rotate {
        rotate_files(target, config.file_count).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await?;
    file.write_all(&state.pending).await?;
    file.flush().await?;
    Ok(())
}

/// Renames `f -> f.1 -> f.2 ...`, dropping anything past `file_count`.
/// With a count of zero the primary file is simply removed.
async fn rotate_files(target: &PathBuf, file_count: usize) -> io::Result<()> {
    let numbered = |n: usize| {
        let mut path = target.clone().into_os_string();
        path.push(format!(".{n}"));
        PathBuf::from(path)
    };

    if file_count == 0 {
        fs::remove_file(target).await?;
        return Ok(());
    }
    let _ = fs::remove_file(numbered(file_count)).await;
    for n in (1..file_count).rev() {
        let from = numbered(n);
        if from.exists() {
            fs::rename(&from, numbered(n + 1)).await?;
        }
    }
    fs::rename(target, numbered(1)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn fixed_supplier(path: PathBuf) -> Arc<dyn LogFileSupplier> {
        Arc::new(move || Some(path.clone()))
    }

    #[tokio::test]
    async fn whole_lines_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("events.log");
        let writer = EventLogWriter::new(fixed_supplier(target.clone()), EventLogConfig::default());

        let mut stream = writer.open_stream();
        writeln!(stream, "branch indexed: main").unwrap();
        writeln!(stream, "branch indexed: dev").unwrap();
        drop(stream);
        writer.close().await;

        let contents = std::fs::read_to_string(&target).unwrap();
        assert!(contents.contains("branch indexed: main"));
        assert!(contents.contains("branch indexed: dev"));
    }

    #[tokio::test]
    async fn partial_lines_stay_buffered_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("events.log");
        let writer = EventLogWriter::new(fixed_supplier(target.clone()), EventLogConfig::default());

        let mut stream = writer.open_stream();
        write!(stream, "no newline yet").unwrap();
        stream.flush().unwrap();
        // Nothing enqueued, nothing flushed.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!target.exists());

        drop(stream); // enqueues the partial line
        writer.close().await;
        let contents = std::fs::read_to_string(&target).unwrap();
        assert!(contents.contains("no newline yet"));
    }

    #[tokio::test]
    async fn rotation_keeps_the_configured_backups() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("events.log");
        let config = EventLogConfig {
            rotate_size: 64,
            file_count: 2,
            flush_interval: Duration::from_millis(20),
            flush_size: 32,
        };
        let writer = EventLogWriter::new(fixed_supplier(target.clone()), config);

        for round in 0..30 {
            let mut stream = writer.open_stream();
            writeln!(stream, "event {round}: some spilled payload text").unwrap();
            drop(stream);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        writer.close().await;

        assert!(target.exists());
        assert!(target.with_extension("log.1").exists());
        assert!(target.with_extension("log.2").exists());
        assert!(!target.with_extension("log.3").exists());
    }

    #[tokio::test]
    async fn supplier_refusal_defers_the_flush() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("events.log");
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let supplier = {
            let gate = gate.clone();
            let target = target.clone();
            Arc::new(move || {
                if gate.load(std::sync::atomic::Ordering::SeqCst) {
                    Some(target.clone())
                } else {
                    None
                }
            }) as Arc<dyn LogFileSupplier>
        };
        let writer = EventLogWriter::new(supplier, EventLogConfig::default());

        let mut stream = writer.open_stream();
        writeln!(stream, "deferred event").unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!target.exists());

        gate.store(true, std::sync::atomic::Ordering::SeqCst);
        writer.close().await;
        let contents = std::fs::read_to_string(&target).unwrap();
        assert!(contents.contains("deferred event"));
    }
}
