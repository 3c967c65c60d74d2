//! Poller wrapper
//!
//! `wait` reports a timeout and an interrupted wait as outcomes, not errors.

use crate::context::Context;
use crate::error::{native, Error, Result};
use crate::handle::{Handle, ReleasePolicy, Resource};
use crate::registry::{RegistrationId, ResourceKind, Sweepable};
use crate::socket::Socket;
use native::{Backend, Errno, NativeResult, PollEvent, RawPoller, RawSocket};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

impl Resource for RawPoller {
    const KIND: ResourceKind = ResourceKind::Poller;

    fn release(self, backend: &dyn Backend, _policy: ReleasePolicy) -> NativeResult<()> {
        backend.poller_destroy(self)
    }
}

/// Outcome of a poller wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait {
    Ready(Vec<PollEvent>),
    TimedOut,
    Interrupted,
}

pub struct Poller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    handle: Handle<RawPoller>,
    sockets: Mutex<Vec<RawSocket>>,
    context: Context,
    registration: RegistrationId,
}

impl Poller {
    pub(crate) fn new(context: &Context) -> Result<Self> {
        let backend = context.backend().clone();
        let raw = backend.poller_new().map_err(native("poller_new"))?;
        let inner = Arc::new_cyclic(|weak: &Weak<PollerInner>| {
            let weak: Weak<dyn Sweepable> = weak.clone();
            PollerInner {
                handle: Handle::new(backend, raw),
                sockets: Mutex::new(Vec::new()),
                context: context.clone(),
                registration: context.registry().register(weak, ResourceKind::Poller),
            }
        });
        Ok(Self { inner })
    }

    /// Watch `socket` for `events` (`POLLIN`, `POLLOUT`)
    pub fn add(&self, socket: &Socket, events: i16) -> Result<()> {
        let raw = self.inner.handle.raw()?;
        let sock = socket.raw()?;
        self.inner
            .handle
            .backend()
            .poller_add(raw, sock, events)
            .map_err(native("poller_add"))?;
        self.inner.sockets.lock().push(sock);
        Ok(())
    }

    pub fn modify(&self, socket: &Socket, events: i16) -> Result<()> {
        let raw = self.inner.handle.raw()?;
        self.inner
            .handle
            .backend()
            .poller_modify(raw, socket.raw()?, events)
            .map_err(native("poller_modify"))
    }

    pub fn remove(&self, socket: &Socket) -> Result<()> {
        let raw = self.inner.handle.raw()?;
        let sock = socket.raw()?;
        self.inner
            .handle
            .backend()
            .poller_remove(raw, sock)
            .map_err(native("poller_remove"))?;
        self.inner.sockets.lock().retain(|s| *s != sock);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.sockets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the first ready socket. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Wait> {
        self.wait_for(1, timeout)
    }

    /// Wait for any number of ready sockets, calling `f` for each
    pub fn wait_all<F>(&self, timeout: Option<Duration>, mut f: F) -> Result<Wait>
    where
        F: FnMut(&PollEvent),
    {
        let outcome = self.wait_for(self.len().max(1), timeout)?;
        if let Wait::Ready(events) = &outcome {
            events.iter().for_each(&mut f);
        }
        Ok(outcome)
    }

    fn wait_for(&self, max_events: usize, timeout: Option<Duration>) -> Result<Wait> {
        let raw = self.inner.handle.raw()?;
        match self.inner.handle.backend().poller_wait(raw, max_events, timeout) {
            Ok(events) => Ok(Wait::Ready(events)),
            Err(err) if err.errno == Errno::ETIMEDOUT => Ok(Wait::TimedOut),
            Err(err) if err.errno == Errno::EINTR => Ok(Wait::Interrupted),
            Err(err) => Err(Error::from_native("poller_wait", err)),
        }
    }

    pub fn close(&self) {
        self.inner.handle.release(ReleasePolicy::Immediate);
    }
}

impl Sweepable for PollerInner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Poller
    }

    fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    fn sweep(&self) -> bool {
        self.handle.release(ReleasePolicy::Immediate)
    }
}

impl Drop for PollerInner {
    fn drop(&mut self) {
        self.handle.release(ReleasePolicy::Immediate);
        self.context
            .registry()
            .unregister(ResourceKind::Poller, self.registration);
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("handle", &self.inner.handle)
            .field("sockets", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use native::{consts, InprocBackend, SocketType};

    fn context() -> Context {
        Context::new(Arc::new(InprocBackend::new()), BridgeConfig::default()).unwrap()
    }

    #[test]
    fn times_out_then_reports_ready_socket() {
        let ctx = context();
        let a = ctx.socket(SocketType::Pair).unwrap();
        let b = ctx.socket(SocketType::Pair).unwrap();
        a.bind("inproc://poller-ready").unwrap();
        b.connect("inproc://poller-ready").unwrap();

        let poller = ctx.poller().unwrap();
        poller.add(&b, consts::POLLIN).unwrap();
        assert_eq!(poller.wait(Some(Duration::from_millis(20))).unwrap(), Wait::TimedOut);

        a.send("ping", 0).unwrap();
        let outcome = poller.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(
            outcome,
            Wait::Ready(vec![PollEvent {
                socket: b.raw().unwrap(),
                events: consts::POLLIN
            }])
        );
    }

    #[test]
    fn wait_all_visits_every_ready_socket() {
        let ctx = context();
        let push = ctx.socket(SocketType::Push).unwrap();
        let first = ctx.socket(SocketType::Pull).unwrap();
        let second = ctx.socket(SocketType::Pull).unwrap();
        first.bind("inproc://poller-first").unwrap();
        second.bind("inproc://poller-second").unwrap();
        push.connect("inproc://poller-first").unwrap();
        push.connect("inproc://poller-second").unwrap();
        push.send("a", 0).unwrap();
        push.send("b", 0).unwrap();

        let poller = ctx.poller().unwrap();
        poller.add(&first, consts::POLLIN).unwrap();
        poller.add(&second, consts::POLLIN).unwrap();

        let mut seen = Vec::new();
        poller
            .wait_all(Some(Duration::from_secs(1)), |event| seen.push(event.socket))
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn removed_socket_is_forgotten() {
        let ctx = context();
        let socket = ctx.socket(SocketType::Pair).unwrap();
        let poller = ctx.poller().unwrap();
        poller.add(&socket, consts::POLLIN).unwrap();
        assert_eq!(poller.len(), 1);
        poller.remove(&socket).unwrap();
        assert!(poller.is_empty());
        assert!(poller.remove(&socket).is_err());
    }

    #[test]
    fn closed_poller_fails_locally() {
        let ctx = context();
        let poller = ctx.poller().unwrap();
        poller.close();
        poller.close();
        assert!(matches!(poller.wait(None), Err(Error::Closed("poller"))));
    }
}
