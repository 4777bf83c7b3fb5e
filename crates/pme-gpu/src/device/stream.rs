//! In-order device stream
//!
//! A host-emulated stream of device work: launches are queued to a dedicated
//! worker thread and execute strictly in issue order, so the host never has
//! to synchronize between device-only stages. The host observes completion
//! through [`GpuStream::query`], [`GpuStream::synchronize`] or a recorded
//! [`StreamEvent`].
//!
//! ```text
//! host thread                worker ("device")
//! ───────────                ─────────────────
//! enqueue(spread) ────────▶  spread
//! enqueue(fft)    ────────▶  fft
//! record_event()  ────────▶  signal(event)
//! query() → false            ...
//! synchronize()   ◀────────  queue drained
//! ```
//!
//! Errors are sticky: once a launch fails, later launches are skipped, event
//! signals still fire, and every query/synchronize reports the failure.
//!
//! Dropping a stream wakes a worker parked on a host event that will never
//! fire; the abandoned wait becomes the stream's sticky error.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use pme_core::PmeError;

/// Work executed on the stream.
pub type DeviceJob = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Command {
    Launch { label: &'static str, job: DeviceJob },
    Signal(StreamEvent),
    WaitFor(StreamEvent),
}

/// Completion token.
///
/// Recorded on a stream it fires once all previously issued work on that
/// stream has executed; created with [`StreamEvent::new`] it is a host-side
/// signal (e.g. "coordinates are ready") that streams can wait on.
#[derive(Clone, Debug)]
pub struct StreamEvent {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl StreamEvent {
    /// Unsignaled host-controlled event.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner::default()),
        }
    }

    /// Already-signaled event.
    pub fn signaled() -> Self {
        let event = Self::new();
        event.signal();
        event
    }

    pub fn signal(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.cv.notify_all();
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Blocks the calling thread until the event fires.
    pub fn synchronize(&self) {
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            self.inner.cv.wait(&mut signaled);
        }
    }

    /// Blocks until the event fires or `abort` is raised. Returns whether
    /// the event fired.
    fn synchronize_unless(&self, abort: &AtomicBool) -> bool {
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            if abort.load(Ordering::SeqCst) {
                return false;
            }
            self.inner.cv.wait(&mut signaled);
        }
        true
    }

    /// Wakes waiters without signalling.
    fn wake(&self) {
        let _guard = self.inner.signaled.lock();
        self.inner.cv.notify_all();
    }

    /// Both handles refer to the same token.
    pub fn same_as(&self, other: &StreamEvent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for StreamEvent {
    fn default() -> Self {
        Self::new()
    }
}

struct StreamShared {
    pending: Mutex<usize>,
    drained: Condvar,
    sticky_error: Mutex<Option<String>>,
    shutdown: AtomicBool,
    /// Host event the worker is currently blocked on.
    parked_on: Mutex<Option<StreamEvent>>,
}

/// Single in-order device stream.
pub struct GpuStream {
    name: String,
    shared: Arc<StreamShared>,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    query_supported: bool,
}

impl GpuStream {
    /// Creates a stream and starts its worker.
    ///
    /// `query_supported = false` models platforms where a non-blocking
    /// completion query is unavailable; completion checks then fall back to
    /// synchronizing.
    pub fn new(name: impl Into<String>, query_supported: bool) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(StreamShared {
            pending: Mutex::new(0),
            drained: Condvar::new(),
            sticky_error: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            parked_on: Mutex::new(None),
        });
        let (sender, receiver) = unbounded();

        let worker_shared = Arc::clone(&shared);
        let worker_name = name.clone();
        let worker = std::thread::Builder::new()
            .name(format!("stream-{}", name))
            .spawn(move || run_worker(worker_name, receiver, worker_shared))
            .map_err(|e| anyhow!("Failed to spawn worker for stream '{}': {}", name, e))?;

        log::debug!("Stream '{}' created (query supported: {})", name, query_supported);

        Ok(Self {
            name,
            shared,
            sender: Some(sender),
            worker: Some(worker),
            query_supported,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`GpuStream::query`] is safe to use on this platform.
    pub fn supports_query(&self) -> bool {
        self.query_supported
    }

    /// Queues a launch; returns immediately.
    pub fn enqueue<F>(&self, label: &'static str, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.submit(Command::Launch {
            label,
            job: Box::new(job),
        });
    }

    /// Records an event that fires once all work issued so far has executed.
    pub fn record_event(&self) -> StreamEvent {
        let event = StreamEvent::new();
        self.submit(Command::Signal(event.clone()));
        event
    }

    /// Makes later work on this stream wait for `event` without blocking the host.
    pub fn wait_event(&self, event: &StreamEvent) {
        if event.is_complete() {
            return;
        }
        self.submit(Command::WaitFor(event.clone()));
    }

    /// Non-blocking: true when every issued operation has executed.
    pub fn query(&self) -> Result<bool> {
        let idle = *self.shared.pending.lock() == 0;
        if idle {
            self.check_error()?;
        }
        Ok(idle)
    }

    /// Blocks until every issued operation has executed.
    pub fn synchronize(&self) -> Result<()> {
        {
            let mut pending = self.shared.pending.lock();
            while *pending > 0 {
                self.shared.drained.wait(&mut pending);
            }
        }
        self.check_error()
    }

    /// Reports the sticky error, if any, without waiting.
    pub fn check_error(&self) -> Result<()> {
        match self.shared.sticky_error.lock().as_ref() {
            Some(message) => Err(PmeError::stream(self.name.clone(), message.clone()).into()),
            None => Ok(()),
        }
    }

    fn submit(&self, command: Command) {
        *self.shared.pending.lock() += 1;
        let sent = self
            .sender
            .as_ref()
            .map(|sender| sender.send(command).is_ok())
            .unwrap_or(false);
        if !sent {
            // Worker is gone; nothing will ever execute this command.
            let mut pending = self.shared.pending.lock();
            *pending -= 1;
            self.shared
                .sticky_error
                .lock()
                .get_or_insert_with(|| "stream worker is not running".to_string());
            if *pending == 0 {
                self.shared.drained.notify_all();
            }
        }
    }
}

impl Drop for GpuStream {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(event) = self.shared.parked_on.lock().as_ref() {
            log::warn!(
                "⚠️  Stream '{}' dropped while waiting on an unsignalled event",
                self.name
            );
            event.wake();
        }
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Stream '{}' worker panicked during shutdown", self.name);
            }
        }
        log::debug!("🧹 Stream '{}' destroyed", self.name);
    }
}

fn run_worker(name: String, receiver: Receiver<Command>, shared: Arc<StreamShared>) {
    for command in receiver.iter() {
        match command {
            Command::Launch { label, job } => {
                if shared.sticky_error.lock().is_none() {
                    let outcome = catch_unwind(AssertUnwindSafe(job));
                    let failure = match outcome {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => Some(format!("{}: {:#}", label, err)),
                        Err(_) => Some(format!("{}: device job panicked", label)),
                    };
                    if let Some(message) = failure {
                        log::error!("Stream '{}' failed in {}", name, message);
                        *shared.sticky_error.lock() = Some(message);
                    }
                } else {
                    log::debug!("Stream '{}' skipping {} after earlier failure", name, label);
                }
            }
            Command::Signal(event) => event.signal(),
            Command::WaitFor(event) => {
                *shared.parked_on.lock() = Some(event.clone());
                let fired = event.synchronize_unless(&shared.shutdown);
                shared.parked_on.lock().take();
                if !fired {
                    shared
                        .sticky_error
                        .lock()
                        .get_or_insert_with(|| "stream shut down while waiting for an event".to_string());
                }
            }
        }

        let mut pending = shared.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            shared.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fifo_order() {
        let stream = GpuStream::new("fifo", true).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream.enqueue("push", move || {
                log.lock().push(i);
                Ok(())
            });
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_query_reports_pending_work() {
        let stream = GpuStream::new("query", true).unwrap();
        let gate = StreamEvent::new();
        stream.wait_event(&gate);
        let done = stream.record_event();

        assert!(!stream.query().unwrap());
        assert!(!done.is_complete());

        gate.signal();
        stream.synchronize().unwrap();
        assert!(stream.query().unwrap());
        assert!(done.is_complete());
    }

    #[test]
    fn test_sticky_error_skips_later_work() {
        let stream = GpuStream::new("sticky", true).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        stream.enqueue("fails", || Err(anyhow!("kernel fault")));
        let c = Arc::clone(&counter);
        stream.enqueue("skipped", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let marker = stream.record_event();

        let err = stream.synchronize().unwrap_err();
        assert!(err.to_string().contains("kernel fault"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(marker.is_complete());
        assert!(stream.query().is_err());
    }

    #[test]
    fn test_panicking_job_becomes_error() {
        let stream = GpuStream::new("panic", true).unwrap();
        stream.enqueue("boom", || panic!("bad index"));
        assert!(stream.synchronize().is_err());
    }

    #[test]
    fn test_drop_releases_worker_waiting_on_unsignaled_event() {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let gate = StreamEvent::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let worker_gate = gate.clone();
        let worker_ran = Arc::clone(&ran);
        std::thread::spawn(move || {
            let stream = GpuStream::new("abandoned", true).unwrap();
            stream.wait_event(&worker_gate);
            stream.enqueue("after gate", move || {
                worker_ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            drop(stream);
            let _ = done_tx.send(());
        });

        assert!(
            done_rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok(),
            "dropping the stream blocked on the unsignaled event"
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!gate.is_complete());
    }

    #[test]
    fn test_signaled_event_does_not_block() {
        let stream = GpuStream::new("signaled", true).unwrap();
        stream.wait_event(&StreamEvent::signaled());
        stream.synchronize().unwrap();
    }
}
