//! Owned native handles
//!
//! A [`Handle`] is either live or released. Releasing takes the raw handle
//! out under the lock before the native teardown runs, so an explicit close
//! racing a sweep (or a drop) produces exactly one native release call.

use crate::error::{Error, Result};
use crate::registry::ResourceKind;
use native::{Backend, NativeResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// How long a released resource may wait for in-flight work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Keep whatever linger the resource was configured with
    Graceful,
    /// Wait at most this long
    Bounded(Duration),
    /// Discard in-flight work
    Immediate,
}

impl ReleasePolicy {
    /// Linger value to apply before release, if any
    pub fn linger_ms(&self) -> Option<i32> {
        match self {
            ReleasePolicy::Graceful => None,
            ReleasePolicy::Bounded(d) => Some(d.as_millis().min(i32::MAX as u128) as i32),
            ReleasePolicy::Immediate => Some(0),
        }
    }
}

/// A raw native handle with a release routine
pub trait Resource: Copy + Send + Sync + fmt::Display + 'static {
    const KIND: ResourceKind;

    fn release(self, backend: &dyn Backend, policy: ReleasePolicy) -> NativeResult<()>;
}

pub struct Handle<R: Resource> {
    raw: Mutex<Option<R>>,
    backend: Arc<dyn Backend>,
}

impl<R: Resource> Handle<R> {
    pub fn new(backend: Arc<dyn Backend>, raw: R) -> Self {
        Self {
            raw: Mutex::new(Some(raw)),
            backend,
        }
    }

    /// The raw handle, or [`Error::Closed`] once released
    pub fn raw(&self) -> Result<R> {
        (*self.raw.lock()).ok_or(Error::Closed(R::KIND.name()))
    }

    pub fn is_live(&self) -> bool {
        self.raw.lock().is_some()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Release the native resource. Returns `false` when it was already released.
    ///
    /// Failures are logged and swallowed: release runs during teardown.
    pub fn release(&self, policy: ReleasePolicy) -> bool {
        let Some(raw) = self.raw.lock().take() else {
            return false;
        };
        trace!(kind = %R::KIND, %raw, ?policy, "releasing");
        if let Err(err) = raw.release(self.backend.as_ref(), policy) {
            warn!(kind = %R::KIND, %raw, error = %err, "release failed");
        }
        true
    }
}

impl<R: Resource> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self.raw.lock() {
            Some(raw) => write!(f, "Handle({raw})"),
            None => write!(f, "Handle({}, released)", R::KIND),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use native::{InprocBackend, RawSocket, RecordingBackend, SocketType};

    #[test]
    fn release_runs_once() {
        let recording = Arc::new(RecordingBackend::new(Arc::new(InprocBackend::new())));
        let backend: Arc<dyn Backend> = recording.clone();
        let ctx = backend.ctx_new().unwrap();
        let raw = backend.socket(ctx, SocketType::Pair.into()).unwrap();

        let handle: Handle<RawSocket> = Handle::new(backend, raw);
        assert!(handle.release(ReleasePolicy::Immediate));
        assert!(!handle.release(ReleasePolicy::Immediate));
        assert!(!handle.release(ReleasePolicy::Graceful));

        assert_eq!(recording.count_on("close", raw.0), 1);
        assert!(matches!(handle.raw(), Err(Error::Closed("socket"))));
    }

    #[test]
    fn concurrent_release_has_one_winner() {
        let recording = Arc::new(RecordingBackend::new(Arc::new(InprocBackend::new())));
        let backend: Arc<dyn Backend> = recording.clone();
        let ctx = backend.ctx_new().unwrap();
        let raw = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        let handle = Arc::new(Handle::new(backend, raw));

        let winners: usize = (0..8)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || handle.release(ReleasePolicy::Immediate))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(recording.count("close"), 1);
    }

    #[test]
    fn linger_follows_policy() {
        assert_eq!(ReleasePolicy::Graceful.linger_ms(), None);
        assert_eq!(ReleasePolicy::Immediate.linger_ms(), Some(0));
        assert_eq!(ReleasePolicy::Bounded(Duration::from_millis(500)).linger_ms(), Some(500));
    }
}
