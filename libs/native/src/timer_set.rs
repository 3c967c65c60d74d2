//! Timer sets shared by the backends
//!
//! A timer set is polled, never threaded: `execute` runs whatever is due on
//! the calling thread and re-arms it.

use crate::backend::{RawTimers, TimerFn, TimerId};
use crate::errno::{Errno, NativeError, NativeResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Timer {
    interval: Duration,
    deadline: Instant,
    // Taken while the callback runs unlocked
    callback: Option<TimerFn>,
}

#[derive(Default)]
struct TimerSet {
    next_id: TimerId,
    timers: HashMap<TimerId, Timer>,
}

#[derive(Default)]
struct TimerTable {
    next_id: u64,
    sets: HashMap<u64, TimerSet>,
}

fn positive(interval: Duration) -> NativeResult<()> {
    if interval.is_zero() {
        return Err(NativeError::with_detail(Errno::EINVAL, "timer interval must be positive"));
    }
    Ok(())
}

impl TimerTable {
    fn set_mut(&mut self, timers: RawTimers) -> NativeResult<&mut TimerSet> {
        self.sets.get_mut(&timers.0).ok_or_else(|| Errno::EFAULT.into())
    }

    fn timer_mut(&mut self, timers: RawTimers, id: TimerId) -> NativeResult<&mut Timer> {
        self.set_mut(timers)?
            .timers
            .get_mut(&id)
            .ok_or_else(|| Errno::EINVAL.into())
    }
}

/// Every timer set of one backend
#[derive(Default)]
pub(crate) struct Timers {
    table: Mutex<TimerTable>,
}

impl Timers {
    pub fn create(&self) -> RawTimers {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.sets.insert(id, TimerSet::default());
        RawTimers(id)
    }

    pub fn add(&self, timers: RawTimers, interval: Duration, callback: TimerFn) -> NativeResult<TimerId> {
        positive(interval)?;
        let mut table = self.table.lock();
        let set = table.set_mut(timers)?;
        set.next_id += 1;
        let id = set.next_id;
        set.timers.insert(
            id,
            Timer {
                interval,
                deadline: Instant::now() + interval,
                callback: Some(callback),
            },
        );
        Ok(id)
    }

    pub fn set_interval(&self, timers: RawTimers, id: TimerId, interval: Duration) -> NativeResult<()> {
        positive(interval)?;
        let mut table = self.table.lock();
        let timer = table.timer_mut(timers, id)?;
        timer.interval = interval;
        timer.deadline = Instant::now() + interval;
        Ok(())
    }

    pub fn reset(&self, timers: RawTimers, id: TimerId) -> NativeResult<()> {
        let mut table = self.table.lock();
        let timer = table.timer_mut(timers, id)?;
        timer.deadline = Instant::now() + timer.interval;
        Ok(())
    }

    pub fn cancel(&self, timers: RawTimers, id: TimerId) -> NativeResult<()> {
        let mut table = self.table.lock();
        table.set_mut(timers)?.timers.remove(&id).ok_or(Errno::EINVAL)?;
        Ok(())
    }

    pub fn timeout(&self, timers: RawTimers) -> NativeResult<Option<Duration>> {
        let mut table = self.table.lock();
        let now = Instant::now();
        Ok(table
            .set_mut(timers)?
            .timers
            .values()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min())
    }

    pub fn execute(&self, timers: RawTimers) -> NativeResult<()> {
        let due: Vec<(TimerId, TimerFn)> = {
            let mut table = self.table.lock();
            let now = Instant::now();
            table
                .set_mut(timers)?
                .timers
                .iter_mut()
                .filter(|(_, t)| t.deadline <= now)
                .filter_map(|(id, t)| {
                    t.deadline = now + t.interval;
                    t.callback.take().map(|cb| (*id, cb))
                })
                .collect()
        };
        // Callbacks may touch the timer set themselves.
        for (id, mut callback) in due {
            callback(id);
            if let Ok(timer) = self.table.lock().timer_mut(timers, id) {
                if timer.callback.is_none() {
                    timer.callback = Some(callback);
                }
            }
        }
        Ok(())
    }

    pub fn destroy(&self, timers: RawTimers) -> NativeResult<()> {
        self.table.lock().sets.remove(&timers.0).ok_or(Errno::EFAULT)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn timers_fire_and_cancel() {
        let table = Timers::default();
        let timers = table.create();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = table
            .add(
                timers,
                Duration::from_millis(5),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        table.execute(timers).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        table.cancel(timers, id).unwrap();
        assert_eq!(table.timeout(timers).unwrap(), None);
        assert_eq!(table.cancel(timers, id).unwrap_err().errno, Errno::EINVAL);
        table.destroy(timers).unwrap();
        assert_eq!(table.timeout(timers).unwrap_err().errno, Errno::EFAULT);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let table = Timers::default();
        let timers = table.create();
        let err = table.add(timers, Duration::ZERO, Box::new(|_| {})).unwrap_err();
        assert_eq!(err.errno, Errno::EINVAL);
    }
}
