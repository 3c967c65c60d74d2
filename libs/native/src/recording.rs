//! Call-recording backend wrapper
//!
//! Forwards every call to an inner [`Backend`] and keeps an ordered log of
//! what was invoked on which handle. Failures can be injected per operation,
//! which is how error paths that the inner backend never produces are driven.

use crate::backend::{
    Backend, PollEvent, RawContext, RawMsg, RawPoller, RawSocket, RawThread, RawTimers, ThreadFn,
    TimerFn, TimerId,
};
use crate::errno::{Errno, NativeError, NativeResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// One recorded native call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCall {
    pub op: &'static str,
    pub handle: u64,
    pub detail: Option<String>,
    pub ok: bool,
}

#[derive(Default)]
struct Journal {
    calls: Vec<NativeCall>,
    failures: HashMap<&'static str, Errno>,
    open_sockets: HashSet<u64>,
    open_contexts: HashSet<u64>,
}

pub struct RecordingBackend {
    inner: Arc<dyn Backend>,
    journal: Mutex<Journal>,
}

impl RecordingBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            journal: Mutex::new(Journal::default()),
        }
    }

    /// Makes the next call to `op` fail with `errno` without reaching the inner backend
    pub fn fail_next(&self, op: &'static str, errno: Errno) {
        self.journal.lock().failures.insert(op, errno);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.journal.lock().calls.clone()
    }

    /// Recorded calls of one operation, in order
    pub fn calls_of(&self, op: &str) -> Vec<NativeCall> {
        self.journal
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.journal.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Successful calls of `op` against `handle`
    pub fn count_on(&self, op: &str, handle: u64) -> usize {
        self.journal
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.handle == handle && c.ok)
            .count()
    }

    pub fn open_sockets(&self) -> usize {
        self.journal.lock().open_sockets.len()
    }

    pub fn open_contexts(&self) -> usize {
        self.journal.lock().open_contexts.len()
    }

    pub fn clear(&self) {
        self.journal.lock().calls.clear();
    }

    fn call<T>(
        &self,
        op: &'static str,
        handle: u64,
        detail: Option<String>,
        f: impl FnOnce() -> NativeResult<T>,
    ) -> NativeResult<T> {
        // Logged before running so blocking calls keep their invocation order.
        let (index, injected) = {
            let mut journal = self.journal.lock();
            let injected = journal.failures.remove(op);
            journal.calls.push(NativeCall {
                op,
                handle,
                detail,
                ok: false,
            });
            (journal.calls.len() - 1, injected)
        };
        trace!(op, handle, "native call");
        let result = match injected {
            Some(errno) => Err(NativeError::with_detail(errno, format!("injected into {op}"))),
            None => f(),
        };
        if result.is_ok() {
            if let Some(call) = self.journal.lock().calls.get_mut(index) {
                call.ok = true;
            }
        }
        result
    }
}

impl Backend for RecordingBackend {
    fn ctx_new(&self) -> NativeResult<RawContext> {
        let ctx = self.call("ctx_new", 0, None, || self.inner.ctx_new())?;
        self.journal.lock().open_contexts.insert(ctx.0);
        Ok(ctx)
    }

    fn ctx_set(&self, ctx: RawContext, option: i32, value: i32) -> NativeResult<()> {
        self.call("ctx_set", ctx.0, Some(format!("{option}={value}")), || {
            self.inner.ctx_set(ctx, option, value)
        })
    }

    fn ctx_get(&self, ctx: RawContext, option: i32) -> NativeResult<i32> {
        self.call("ctx_get", ctx.0, Some(option.to_string()), || self.inner.ctx_get(ctx, option))
    }

    fn ctx_shutdown(&self, ctx: RawContext) -> NativeResult<()> {
        self.call("ctx_shutdown", ctx.0, None, || self.inner.ctx_shutdown(ctx))
    }

    fn ctx_term(&self, ctx: RawContext) -> NativeResult<()> {
        self.call("ctx_term", ctx.0, None, || self.inner.ctx_term(ctx))?;
        self.journal.lock().open_contexts.remove(&ctx.0);
        Ok(())
    }

    fn socket(&self, ctx: RawContext, kind: i32) -> NativeResult<RawSocket> {
        let socket = self.call("socket", ctx.0, Some(kind.to_string()), || self.inner.socket(ctx, kind))?;
        self.journal.lock().open_sockets.insert(socket.0);
        Ok(socket)
    }

    fn close(&self, socket: RawSocket) -> NativeResult<()> {
        self.call("close", socket.0, None, || self.inner.close(socket))?;
        self.journal.lock().open_sockets.remove(&socket.0);
        Ok(())
    }

    fn bind(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        self.call("bind", socket.0, Some(endpoint.to_string()), || self.inner.bind(socket, endpoint))
    }

    fn connect(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        self.call("connect", socket.0, Some(endpoint.to_string()), || {
            self.inner.connect(socket, endpoint)
        })
    }

    fn disconnect(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        self.call("disconnect", socket.0, Some(endpoint.to_string()), || {
            self.inner.disconnect(socket, endpoint)
        })
    }

    fn unbind(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        self.call("unbind", socket.0, Some(endpoint.to_string()), || {
            self.inner.unbind(socket, endpoint)
        })
    }

    fn setsockopt(&self, socket: RawSocket, option: i32, value: &[u8]) -> NativeResult<()> {
        self.call("setsockopt", socket.0, Some(option.to_string()), || {
            self.inner.setsockopt(socket, option, value)
        })
    }

    fn getsockopt(&self, socket: RawSocket, option: i32, capacity: usize) -> NativeResult<Vec<u8>> {
        self.call("getsockopt", socket.0, Some(option.to_string()), || {
            self.inner.getsockopt(socket, option, capacity)
        })
    }

    fn send(&self, socket: RawSocket, data: &[u8], flags: i32) -> NativeResult<usize> {
        self.call("send", socket.0, Some(format!("{} bytes", data.len())), || {
            self.inner.send(socket, data, flags)
        })
    }

    fn msg_init(&self) -> NativeResult<RawMsg> {
        self.call("msg_init", 0, None, || self.inner.msg_init())
    }

    fn msg_init_data(&self, data: &[u8]) -> NativeResult<RawMsg> {
        self.call("msg_init_data", 0, Some(format!("{} bytes", data.len())), || {
            self.inner.msg_init_data(data)
        })
    }

    fn msg_copy(&self, src: RawMsg) -> NativeResult<RawMsg> {
        self.call("msg_copy", src.0, None, || self.inner.msg_copy(src))
    }

    fn msg_data(&self, msg: RawMsg) -> NativeResult<Bytes> {
        self.call("msg_data", msg.0, None, || self.inner.msg_data(msg))
    }

    fn msg_more(&self, msg: RawMsg) -> NativeResult<bool> {
        self.call("msg_more", msg.0, None, || self.inner.msg_more(msg))
    }

    fn msg_send(&self, msg: RawMsg, socket: RawSocket, flags: i32) -> NativeResult<usize> {
        self.call("msg_send", socket.0, Some(msg.to_string()), || {
            self.inner.msg_send(msg, socket, flags)
        })
    }

    fn msg_recv(&self, socket: RawSocket, flags: i32) -> NativeResult<RawMsg> {
        self.call("msg_recv", socket.0, None, || self.inner.msg_recv(socket, flags))
    }

    fn msg_close(&self, msg: RawMsg) -> NativeResult<()> {
        self.call("msg_close", msg.0, None, || self.inner.msg_close(msg))
    }

    fn poller_new(&self) -> NativeResult<RawPoller> {
        self.call("poller_new", 0, None, || self.inner.poller_new())
    }

    fn poller_add(&self, poller: RawPoller, socket: RawSocket, events: i16) -> NativeResult<()> {
        self.call("poller_add", poller.0, Some(socket.to_string()), || {
            self.inner.poller_add(poller, socket, events)
        })
    }

    fn poller_modify(&self, poller: RawPoller, socket: RawSocket, events: i16) -> NativeResult<()> {
        self.call("poller_modify", poller.0, Some(socket.to_string()), || {
            self.inner.poller_modify(poller, socket, events)
        })
    }

    fn poller_remove(&self, poller: RawPoller, socket: RawSocket) -> NativeResult<()> {
        self.call("poller_remove", poller.0, Some(socket.to_string()), || {
            self.inner.poller_remove(poller, socket)
        })
    }

    fn poller_wait(
        &self,
        poller: RawPoller,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> NativeResult<Vec<PollEvent>> {
        self.call("poller_wait", poller.0, None, || {
            self.inner.poller_wait(poller, max_events, timeout)
        })
    }

    fn poller_destroy(&self, poller: RawPoller) -> NativeResult<()> {
        self.call("poller_destroy", poller.0, None, || self.inner.poller_destroy(poller))
    }

    fn timers_new(&self) -> NativeResult<RawTimers> {
        self.call("timers_new", 0, None, || self.inner.timers_new())
    }

    fn timers_add(&self, timers: RawTimers, interval: Duration, callback: TimerFn) -> NativeResult<TimerId> {
        self.call("timers_add", timers.0, Some(format!("{interval:?}")), || {
            self.inner.timers_add(timers, interval, callback)
        })
    }

    fn timers_set_interval(&self, timers: RawTimers, id: TimerId, interval: Duration) -> NativeResult<()> {
        self.call("timers_set_interval", timers.0, Some(id.to_string()), || {
            self.inner.timers_set_interval(timers, id, interval)
        })
    }

    fn timers_reset(&self, timers: RawTimers, id: TimerId) -> NativeResult<()> {
        self.call("timers_reset", timers.0, Some(id.to_string()), || {
            self.inner.timers_reset(timers, id)
        })
    }

    fn timers_cancel(&self, timers: RawTimers, id: TimerId) -> NativeResult<()> {
        self.call("timers_cancel", timers.0, Some(id.to_string()), || {
            self.inner.timers_cancel(timers, id)
        })
    }

    fn timers_timeout(&self, timers: RawTimers) -> NativeResult<Option<Duration>> {
        self.call("timers_timeout", timers.0, None, || self.inner.timers_timeout(timers))
    }

    fn timers_execute(&self, timers: RawTimers) -> NativeResult<()> {
        self.call("timers_execute", timers.0, None, || self.inner.timers_execute(timers))
    }

    fn timers_destroy(&self, timers: RawTimers) -> NativeResult<()> {
        self.call("timers_destroy", timers.0, None, || self.inner.timers_destroy(timers))
    }

    fn thread_start(&self, body: ThreadFn) -> NativeResult<RawThread> {
        self.call("thread_start", 0, None, || self.inner.thread_start(body))
    }

    fn thread_join(&self, thread: RawThread) -> NativeResult<()> {
        self.call("thread_join", thread.0, None, || self.inner.thread_join(thread))
    }

    fn thread_detach(&self, thread: RawThread) -> NativeResult<()> {
        self.call("thread_detach", thread.0, None, || self.inner.thread_detach(thread))
    }
}
