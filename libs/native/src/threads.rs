//! Native thread table shared by the backends

use crate::backend::{RawThread, ThreadFn};
use crate::errno::{Errno, NativeError, NativeResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::warn;

#[derive(Default)]
pub(crate) struct ThreadTable {
    next_id: AtomicU64,
    threads: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl ThreadTable {
    pub fn start(&self, name: &str, body: ThreadFn) -> NativeResult<RawThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut threads = self.threads.lock();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(body)
            .map_err(|e| NativeError::with_detail(Errno::EMTHREAD, e))?;
        threads.insert(id, handle);
        Ok(RawThread(id))
    }

    pub fn join(&self, thread: RawThread) -> NativeResult<()> {
        let handle = self.threads.lock().remove(&thread.0).ok_or(Errno::EINVAL)?;
        if handle.join().is_err() {
            warn!(%thread, "native thread panicked");
        }
        Ok(())
    }

    pub fn detach(&self, thread: RawThread) -> NativeResult<()> {
        self.threads.lock().remove(&thread.0).ok_or(Errno::EINVAL)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn threads_start_and_join_once() {
        let table = ThreadTable::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        let thread = table
            .start(
                "worker",
                Box::new(move || {
                    flag.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        table.join(thread).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(table.join(thread).unwrap_err().errno, Errno::EINVAL);
        assert_eq!(table.detach(thread).unwrap_err().errno, Errno::EINVAL);
    }
}
