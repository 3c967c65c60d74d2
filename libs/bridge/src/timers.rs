use crate::context::Context;
use crate::error::{native, Error, Result};
use crate::handle::{Handle, ReleasePolicy, Resource};
use crate::registry::{RegistrationId, ResourceKind, Sweepable};
use native::{Backend, NativeResult, RawTimers, TimerId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

impl Resource for RawTimers {
    const KIND: ResourceKind = ResourceKind::Timers;

    fn release(self, backend: &dyn Backend, _policy: ReleasePolicy) -> NativeResult<()> {
        backend.timers_destroy(self)
    }
}

/// A set of timers driven by [`Timers::execute`]
pub struct Timers {
    inner: Arc<TimersInner>,
}

struct TimersInner {
    handle: Handle<RawTimers>,
    context: Context,
    registration: RegistrationId,
}

/// One armed timer
pub struct Timer {
    timers: Weak<TimersInner>,
    id: TimerId,
    cancelled: Mutex<bool>,
}

impl Timers {
    pub(crate) fn new(context: &Context) -> Result<Self> {
        let backend = context.backend().clone();
        let raw = backend.timers_new().map_err(native("timers_new"))?;
        let inner = Arc::new_cyclic(|weak: &Weak<TimersInner>| {
            let weak: Weak<dyn Sweepable> = weak.clone();
            TimersInner {
                handle: Handle::new(backend, raw),
                context: context.clone(),
                registration: context.registry().register(weak, ResourceKind::Timers),
            }
        });
        Ok(Self { inner })
    }

    /// Arm a repeating timer. `callback` runs from [`Timers::execute`].
    pub fn add<F>(&self, interval: Duration, callback: F) -> Result<Timer>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        if interval.is_zero() {
            return Err(Error::argument("timer interval must be positive"));
        }
        let raw = self.inner.handle.raw()?;
        let id = self
            .inner
            .handle
            .backend()
            .timers_add(raw, interval, Box::new(callback))
            .map_err(native("timers_add"))?;
        Ok(Timer {
            timers: Arc::downgrade(&self.inner),
            id,
            cancelled: Mutex::new(false),
        })
    }

    /// Time until the next timer fires; `None` when nothing is armed
    pub fn timeout(&self) -> Result<Option<Duration>> {
        let raw = self.inner.handle.raw()?;
        self.inner
            .handle
            .backend()
            .timers_timeout(raw)
            .map_err(native("timers_timeout"))
    }

    /// Run the callbacks of every expired timer
    pub fn execute(&self) -> Result<()> {
        let raw = self.inner.handle.raw()?;
        self.inner
            .handle
            .backend()
            .timers_execute(raw)
            .map_err(native("timers_execute"))
    }

    pub fn close(&self) {
        self.inner.handle.release(ReleasePolicy::Immediate);
    }
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn set_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::argument("timer interval must be positive"));
        }
        let (inner, raw) = self.live()?;
        inner
            .handle
            .backend()
            .timers_set_interval(raw, self.id, interval)
            .map_err(native("timers_set_interval"))
    }

    /// Restart the countdown from now
    pub fn reset(&self) -> Result<()> {
        let (inner, raw) = self.live()?;
        inner
            .handle
            .backend()
            .timers_reset(raw, self.id)
            .map_err(native("timers_reset"))
    }

    /// Disarm the timer. Idempotent, and a no-op once the set is gone. A
    /// failed cancel leaves the timer armed and may be retried.
    pub fn cancel(&self) -> Result<()> {
        let mut cancelled = self.cancelled.lock();
        if *cancelled {
            return Ok(());
        }
        let live = self
            .timers
            .upgrade()
            .and_then(|inner| inner.handle.raw().ok().map(|raw| (inner, raw)));
        if let Some((inner, raw)) = live {
            inner
                .handle
                .backend()
                .timers_cancel(raw, self.id)
                .map_err(native("timers_cancel"))?;
        }
        *cancelled = true;
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    fn live(&self) -> Result<(Arc<TimersInner>, RawTimers)> {
        if self.is_cancelled() {
            return Err(Error::Closed("timer"));
        }
        let inner = self.timers.upgrade().ok_or(Error::Closed("timers"))?;
        let raw = inner.handle.raw()?;
        Ok((inner, raw))
    }
}

impl Sweepable for TimersInner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Timers
    }

    fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    fn sweep(&self) -> bool {
        self.handle.release(ReleasePolicy::Immediate)
    }
}

impl Drop for TimersInner {
    fn drop(&mut self) {
        self.handle.release(ReleasePolicy::Immediate);
        self.context
            .registry()
            .unregister(ResourceKind::Timers, self.registration);
    }
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timers").field("handle", &self.inner.handle).finish()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
