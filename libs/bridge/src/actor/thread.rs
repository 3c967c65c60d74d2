//! Background thread wrapper and teardown

use super::TERM;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::poller::{Poller, Wait};
use crate::registry::{RegistrationId, ResourceKind, Sweepable};
use crate::socket::{Received, Socket};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use native::{consts, Backend, RawThread};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// How often a bounded exchange re-checks that the worker is still there
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Unique background thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(Uuid);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0.simple())
    }
}

/// How [`BackgroundThread::close`] waits for the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Close {
    /// Send [`TERM`] and join, however long the worker takes
    #[default]
    Blocking,
    /// Send [`TERM`] without blocking, shut the worker's context down and
    /// join for at most the configured join timeout
    NonBlocking,
}

/// Everything a running worker holds on the spawning side
pub(crate) struct Running {
    pub frontend: Socket,
    pub worker_ctx: Context,
    pub thread: RawThread,
    pub done: Receiver<()>,
}

/// Signals worker exit when dropped, including on panic
pub(crate) struct DoneSignal(pub Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

/// Whether the worker behind `done` has returned. The signal is consumed, but
/// the sender is gone by then, so later checks still see the disconnect.
pub(crate) fn has_exited(done: &Receiver<()>) -> bool {
    !matches!(done.try_recv(), Err(TryRecvError::Empty))
}

/// Wait up to `timeout` for the worker to finish, then join it. A worker that
/// does not finish in time is detached and left running.
pub(crate) fn reap(
    backend: &dyn Backend,
    id: ThreadId,
    thread: RawThread,
    done: &Receiver<()>,
    timeout: Duration,
) -> bool {
    match done.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if let Err(err) = backend.thread_join(thread) {
                warn!(thread = %id, error = %err, "join failed");
            }
            true
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                thread = %id,
                timeout_ms = timeout.as_millis() as u64,
                "worker did not exit in time, abandoning it"
            );
            if let Err(err) = backend.thread_detach(thread) {
                warn!(thread = %id, error = %err, "detach failed");
            }
            false
        }
    }
}

/// A spawned actor, seen from the spawning side
pub struct BackgroundThread {
    inner: Arc<ThreadInner>,
}

struct ThreadInner {
    id: ThreadId,
    endpoint: String,
    running: Mutex<Option<Running>>,
    // Serialises request/reply exchanges; the poller is opened on first use.
    exchange: Mutex<Option<Poller>>,
    context: Context,
    registration: RegistrationId,
}

impl BackgroundThread {
    pub(crate) fn new(context: &Context, id: ThreadId, endpoint: String, running: Running) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ThreadInner>| {
            let weak: Weak<dyn Sweepable> = weak.clone();
            ThreadInner {
                id,
                endpoint,
                running: Mutex::new(Some(running)),
                exchange: Mutex::new(None),
                context: context.clone(),
                registration: context.registry().register(weak, ResourceKind::Thread),
            }
        });
        Self { inner }
    }

    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    /// Address of the private pipe
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Whether the worker has returned, on its own or after [`Self::close`]
    pub fn has_exited(&self) -> bool {
        self.inner.has_exited()
    }

    /// Spawning-side end of the private pipe
    pub fn pipe(&self) -> Result<Socket> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|running| running.frontend.clone())
            .ok_or(Error::Closed("background thread"))
    }

    pub fn send(&self, data: impl AsRef<[u8]>, flags: i32) -> Result<usize> {
        self.pipe()?.send(data, flags)
    }

    pub fn recv(&self, flags: i32) -> Result<Received> {
        self.pipe()?.recv(flags)
    }

    /// Send one frame without waiting for an answer. Unlike [`Self::send`]
    /// this never blocks on a worker that has returned.
    pub fn post(&self, frame: impl AsRef<[u8]>) -> Result<()> {
        let pipe = self.pipe()?;
        let mut exchange = self.inner.exchange.lock();
        self.inner.await_pipe(&pipe, &mut exchange, consts::POLLOUT)?;
        pipe.send(frame, consts::DONTWAIT)?;
        Ok(())
    }

    /// Send one frame and wait for the worker's one-frame reply. Fails with
    /// [`Error::WorkerExited`] once the worker has returned without replying.
    pub fn request(&self, frame: impl AsRef<[u8]>) -> Result<Bytes> {
        let pipe = self.pipe()?;
        let mut exchange = self.inner.exchange.lock();
        self.inner.await_pipe(&pipe, &mut exchange, consts::POLLOUT)?;
        pipe.send(frame, consts::DONTWAIT)?;
        self.inner.await_pipe(&pipe, &mut exchange, consts::POLLIN)?;
        pipe.recv_msg(consts::DONTWAIT)?.data()
    }

    /// Stop the worker and release the pipe. Idempotent, and safe on a
    /// worker that already returned.
    pub fn close(&self, mode: Close) -> Result<()> {
        self.inner.teardown(mode).map(|_| ())
    }
}

impl ThreadInner {
    fn has_exited(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(true, |running| has_exited(&running.done))
    }

    /// Wait until `pipe` is ready for `events`, checking between waits that
    /// the worker is still there to make it so
    fn await_pipe(&self, pipe: &Socket, slot: &mut Option<Poller>, events: i16) -> Result<()> {
        let poller = match slot {
            Some(poller) => {
                poller.modify(pipe, events)?;
                poller
            }
            None => {
                let poller = self.context.poller()?;
                poller.add(pipe, events)?;
                slot.insert(poller)
            }
        };
        loop {
            match poller.wait(Some(EXIT_CHECK_INTERVAL))? {
                Wait::Ready(_) => return Ok(()),
                Wait::TimedOut | Wait::Interrupted if !self.has_exited() => continue,
                // Anything the worker sent before returning is still queued.
                Wait::TimedOut | Wait::Interrupted => {
                    return match poller.wait(Some(Duration::ZERO))? {
                        Wait::Ready(_) => Ok(()),
                        _ => Err(Error::WorkerExited(self.id.to_string())),
                    };
                }
            }
        }
    }

    /// Returns `false` when the thread was already torn down
    fn teardown(&self, mode: Close) -> Result<bool> {
        let Some(running) = self.running.lock().take() else {
            return Ok(false);
        };
        let Running {
            frontend,
            worker_ctx,
            thread,
            done,
        } = running;
        let backend = worker_ctx.backend().clone();
        let exited = has_exited(&done);
        debug!(thread = %self.id, ?mode, exited, "closing background thread");

        let joined = match mode {
            Close::Blocking => {
                // A returned worker has no pipe end left to take TERM.
                if !exited {
                    let timeout = self.context.config().join_timeout();
                    self.best_effort("bound send timeout", frontend.set_send_timeout(Some(timeout)));
                    self.best_effort("send TERM", frontend.send(TERM, 0));
                }
                if let Err(err) = backend.thread_join(thread) {
                    warn!(thread = %self.id, error = %err, "join failed");
                }
                true
            }
            Close::NonBlocking => {
                if !exited {
                    self.best_effort("send TERM", frontend.send(TERM, consts::DONTWAIT));
                }
                self.best_effort("zero linger", frontend.set_linger(0));
                self.best_effort("shut down worker context", worker_ctx.shutdown());
                reap(
                    backend.as_ref(),
                    self.id,
                    thread,
                    &done,
                    self.context.config().join_timeout(),
                )
            }
        };

        match mode {
            Close::Blocking => frontend.close(),
            Close::NonBlocking => frontend.close_now(),
        }
        if let Some(poller) = self.exchange.lock().take() {
            poller.close();
        }
        if joined {
            worker_ctx.terminate()?;
        }
        debug!(thread = %self.id, joined, "background thread closed");
        Ok(true)
    }

    fn best_effort<T>(&self, step: &'static str, result: Result<T>) {
        if let Err(err) = result {
            debug!(thread = %self.id, step, error = %err, "teardown step failed");
        }
    }
}

impl Sweepable for ThreadInner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Thread
    }

    fn is_live(&self) -> bool {
        self.running.lock().is_some()
    }

    fn sweep(&self) -> bool {
        match self.teardown(Close::NonBlocking) {
            Ok(released) => released,
            Err(err) => {
                warn!(thread = %self.id, error = %err, "background thread teardown failed");
                true
            }
        }
    }
}

impl Drop for ThreadInner {
    fn drop(&mut self) {
        self.sweep();
        self.context
            .registry()
            .unregister(ResourceKind::Thread, self.registration);
    }
}

impl fmt::Debug for BackgroundThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundThread")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use native::{InprocBackend, RecordingBackend};

    #[test]
    fn thread_ids_are_unique_and_prefixed() {
        let a = ThreadId::new();
        let b = ThreadId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("thread-"));
        assert_eq!(a.to_string().len(), "thread-".len() + 32);
    }

    #[test]
    fn reap_joins_a_finished_worker() {
        let recording = RecordingBackend::new(Arc::new(InprocBackend::new()));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let thread = recording
            .thread_start(Box::new(move || {
                let _done = DoneSignal(tx);
            }))
            .unwrap();

        assert!(reap(&recording, ThreadId::new(), thread, &rx, Duration::from_secs(5)));
        assert_eq!(recording.count("thread_join"), 1);
    }

    #[test]
    fn reap_abandons_a_worker_that_overstays() {
        let recording = RecordingBackend::new(Arc::new(InprocBackend::new()));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let thread = recording
            .thread_start(Box::new(move || {
                let _done = DoneSignal(tx);
                std::thread::sleep(Duration::from_millis(200));
            }))
            .unwrap();

        assert!(!reap(&recording, ThreadId::new(), thread, &rx, Duration::from_millis(10)));
        assert_eq!(recording.count("thread_join"), 0);
        assert_eq!(recording.count("thread_detach"), 1);
    }

    #[test]
    fn exit_is_seen_by_every_check() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        assert!(!has_exited(&rx));
        drop(DoneSignal(tx));
        assert!(has_exited(&rx));
        assert!(has_exited(&rx));
    }
}
