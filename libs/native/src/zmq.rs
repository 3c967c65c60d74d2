//! libzmq backend
//!
//! Binds [`Backend`] to the real library through `zmq-sys`. Native pointers
//! never leave this module: every context, socket and message lives in a
//! handle table and callers only see the `Raw*` ids. libzmq has no poller
//! object in its stable API, so a poller here is a list of items handed to
//! `zmq_poll` on every wait. Timer sets and threads are driven from Rust.

use crate::backend::{
    Backend, PollEvent, RawContext, RawMsg, RawPoller, RawSocket, RawThread, RawTimers, ThreadFn,
    TimerFn, TimerId,
};
use crate::errno::{Errno, NativeError, NativeResult};
use crate::threads::ThreadTable;
use crate::timer_set::Timers;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_int, c_void, CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use zmq_sys as sys;

/// An owned `zmq_msg_t`. Boxed so its address is stable across table moves.
struct Msg(Box<sys::zmq_msg_t>);

// A message is plain memory owned by whoever holds it.
unsafe impl Send for Msg {}

impl Msg {
    fn new() -> NativeResult<Self> {
        // SAFETY: zmq_msg_t is an opaque blob; zmq_msg_init overwrites it.
        let mut msg = Msg(Box::new(unsafe { std::mem::zeroed() }));
        check(unsafe { sys::zmq_msg_init(msg.ptr()) })?;
        Ok(msg)
    }

    fn with_data(data: &[u8]) -> NativeResult<Self> {
        let mut msg = Msg(Box::new(unsafe { std::mem::zeroed() }));
        check(unsafe { sys::zmq_msg_init_size(msg.ptr(), data.len()) })?;
        if !data.is_empty() {
            // SAFETY: the message was just sized to hold `data`.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), sys::zmq_msg_data(msg.ptr()) as *mut u8, data.len());
            }
        }
        Ok(msg)
    }

    fn ptr(&mut self) -> *mut sys::zmq_msg_t {
        &mut *self.0
    }

    fn data(&mut self) -> Bytes {
        // SAFETY: data and size describe the message body while it is alive.
        unsafe {
            let len = sys::zmq_msg_size(self.ptr());
            if len == 0 {
                return Bytes::new();
            }
            let data = sys::zmq_msg_data(self.ptr()) as *const u8;
            Bytes::copy_from_slice(std::slice::from_raw_parts(data, len))
        }
    }

    fn more(&mut self) -> bool {
        unsafe { sys::zmq_msg_more(self.ptr()) != 0 }
    }
}

impl Drop for Msg {
    fn drop(&mut self) {
        unsafe { sys::zmq_msg_close(self.ptr()) };
    }
}

fn last_error() -> NativeError {
    let code = unsafe { sys::zmq_errno() };
    match Errno::from_code(code) {
        Errno::Other(code) => {
            let text = unsafe { CStr::from_ptr(sys::zmq_strerror(code)) };
            NativeError::with_detail(Errno::Other(code), text.to_string_lossy())
        }
        errno => NativeError::new(errno),
    }
}

fn check(rc: c_int) -> NativeResult<c_int> {
    if rc < 0 {
        Err(last_error())
    } else {
        Ok(rc)
    }
}

fn c_endpoint(endpoint: &str) -> NativeResult<CString> {
    CString::new(endpoint).map_err(|_| NativeError::with_detail(Errno::EINVAL, endpoint))
}

fn addr(ptr: *mut c_void) -> usize {
    ptr as usize
}

fn ptr(addr: usize) -> *mut c_void {
    addr as *mut c_void
}

/// Messaging backend over libzmq
#[derive(Default)]
pub struct ZmqBackend {
    next_id: AtomicU64,
    contexts: Mutex<HashMap<u64, usize>>,
    sockets: Mutex<HashMap<u64, usize>>,
    msgs: Mutex<HashMap<u64, Msg>>,
    pollers: Mutex<HashMap<u64, Vec<(u64, i16)>>>,
    timers: Timers,
    threads: ThreadTable,
}

impl ZmqBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of the linked libzmq as `(major, minor, patch)`
    pub fn version() -> (i32, i32, i32) {
        let (mut major, mut minor, mut patch) = (0, 0, 0);
        unsafe { sys::zmq_version(&mut major, &mut minor, &mut patch) };
        (major, minor, patch)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn context(&self, ctx: RawContext) -> NativeResult<*mut c_void> {
        self.contexts
            .lock()
            .get(&ctx.0)
            .map(|a| ptr(*a))
            .ok_or_else(|| Errno::EFAULT.into())
    }

    fn socket_ptr(&self, socket: RawSocket) -> NativeResult<*mut c_void> {
        self.sockets
            .lock()
            .get(&socket.0)
            .map(|a| ptr(*a))
            .ok_or_else(|| Errno::ENOTSOCK.into())
    }

    fn with_msg<T>(&self, msg: RawMsg, f: impl FnOnce(&mut Msg) -> T) -> NativeResult<T> {
        let mut msgs = self.msgs.lock();
        let msg = msgs.get_mut(&msg.0).ok_or(Errno::EFAULT)?;
        Ok(f(msg))
    }

    fn store(&self, msg: Msg) -> RawMsg {
        let id = self.next_id();
        self.msgs.lock().insert(id, msg);
        RawMsg(id)
    }
}

impl Backend for ZmqBackend {
    fn ctx_new(&self) -> NativeResult<RawContext> {
        let ctx = unsafe { sys::zmq_ctx_new() };
        if ctx.is_null() {
            return Err(last_error());
        }
        let id = self.next_id();
        self.contexts.lock().insert(id, addr(ctx));
        Ok(RawContext(id))
    }

    fn ctx_set(&self, ctx: RawContext, option: i32, value: i32) -> NativeResult<()> {
        let ctx = self.context(ctx)?;
        check(unsafe { sys::zmq_ctx_set(ctx, option, value) })?;
        Ok(())
    }

    fn ctx_get(&self, ctx: RawContext, option: i32) -> NativeResult<i32> {
        let ctx = self.context(ctx)?;
        check(unsafe { sys::zmq_ctx_get(ctx, option) })
    }

    fn ctx_shutdown(&self, ctx: RawContext) -> NativeResult<()> {
        let raw = self.context(ctx)?;
        check(unsafe { sys::zmq_ctx_shutdown(raw) })?;
        debug!(%ctx, "context shut down");
        Ok(())
    }

    fn ctx_term(&self, ctx: RawContext) -> NativeResult<()> {
        let raw = self.context(ctx)?;
        loop {
            match check(unsafe { sys::zmq_ctx_term(raw) }) {
                Ok(_) => break,
                Err(err) if err.errno == Errno::EINTR => continue,
                Err(err) => return Err(err),
            }
        }
        self.contexts.lock().remove(&ctx.0);
        debug!(%ctx, "context terminated");
        Ok(())
    }

    fn socket(&self, ctx: RawContext, kind: i32) -> NativeResult<RawSocket> {
        let ctx = self.context(ctx)?;
        let socket = unsafe { sys::zmq_socket(ctx, kind) };
        if socket.is_null() {
            return Err(last_error());
        }
        let id = self.next_id();
        self.sockets.lock().insert(id, addr(socket));
        Ok(RawSocket(id))
    }

    fn close(&self, socket: RawSocket) -> NativeResult<()> {
        let raw = self.sockets.lock().remove(&socket.0).ok_or(Errno::ENOTSOCK)?;
        check(unsafe { sys::zmq_close(ptr(raw)) })?;
        Ok(())
    }

    fn bind(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        let raw = self.socket_ptr(socket)?;
        let endpoint = c_endpoint(endpoint)?;
        check(unsafe { sys::zmq_bind(raw, endpoint.as_ptr()) })?;
        Ok(())
    }

    fn connect(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        let raw = self.socket_ptr(socket)?;
        let endpoint = c_endpoint(endpoint)?;
        check(unsafe { sys::zmq_connect(raw, endpoint.as_ptr()) })?;
        Ok(())
    }

    fn disconnect(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        let raw = self.socket_ptr(socket)?;
        let endpoint = c_endpoint(endpoint)?;
        check(unsafe { sys::zmq_disconnect(raw, endpoint.as_ptr()) })?;
        Ok(())
    }

    fn unbind(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        let raw = self.socket_ptr(socket)?;
        let endpoint = c_endpoint(endpoint)?;
        check(unsafe { sys::zmq_unbind(raw, endpoint.as_ptr()) })?;
        Ok(())
    }

    fn setsockopt(&self, socket: RawSocket, option: i32, value: &[u8]) -> NativeResult<()> {
        let raw = self.socket_ptr(socket)?;
        check(unsafe { sys::zmq_setsockopt(raw, option, value.as_ptr() as *const c_void, value.len()) })?;
        Ok(())
    }

    fn getsockopt(&self, socket: RawSocket, option: i32, capacity: usize) -> NativeResult<Vec<u8>> {
        let raw = self.socket_ptr(socket)?;
        let mut value = vec![0u8; capacity];
        let mut len = capacity;
        check(unsafe { sys::zmq_getsockopt(raw, option, value.as_mut_ptr() as *mut c_void, &mut len) })?;
        value.truncate(len);
        Ok(value)
    }

    fn send(&self, socket: RawSocket, data: &[u8], flags: i32) -> NativeResult<usize> {
        let raw = self.socket_ptr(socket)?;
        let sent = check(unsafe { sys::zmq_send(raw, data.as_ptr() as *const c_void, data.len(), flags) })?;
        Ok(sent as usize)
    }

    fn msg_init(&self) -> NativeResult<RawMsg> {
        Ok(self.store(Msg::new()?))
    }

    fn msg_init_data(&self, data: &[u8]) -> NativeResult<RawMsg> {
        Ok(self.store(Msg::with_data(data)?))
    }

    fn msg_copy(&self, src: RawMsg) -> NativeResult<RawMsg> {
        let mut copy = Msg::new()?;
        self.with_msg(src, |src| check(unsafe { sys::zmq_msg_copy(copy.ptr(), src.ptr()) }))??;
        Ok(self.store(copy))
    }

    fn msg_data(&self, msg: RawMsg) -> NativeResult<Bytes> {
        self.with_msg(msg, Msg::data)
    }

    fn msg_more(&self, msg: RawMsg) -> NativeResult<bool> {
        self.with_msg(msg, Msg::more)
    }

    fn msg_send(&self, msg: RawMsg, socket: RawSocket, flags: i32) -> NativeResult<usize> {
        let raw = self.socket_ptr(socket)?;
        // Taken out of the table so a blocking send holds no lock.
        let mut owned = self.msgs.lock().remove(&msg.0).ok_or(Errno::EFAULT)?;
        let sent = check(unsafe { sys::zmq_msg_send(owned.ptr(), raw, flags) });
        // On success libzmq leaves the message empty but still valid.
        self.msgs.lock().insert(msg.0, owned);
        Ok(sent? as usize)
    }

    fn msg_recv(&self, socket: RawSocket, flags: i32) -> NativeResult<RawMsg> {
        let raw = self.socket_ptr(socket)?;
        let mut msg = Msg::new()?;
        check(unsafe { sys::zmq_msg_recv(msg.ptr(), raw, flags) })?;
        Ok(self.store(msg))
    }

    fn msg_close(&self, msg: RawMsg) -> NativeResult<()> {
        // Dropping the entry closes the native message.
        self.msgs.lock().remove(&msg.0).ok_or(Errno::EFAULT)?;
        Ok(())
    }

    fn poller_new(&self) -> NativeResult<RawPoller> {
        let id = self.next_id();
        self.pollers.lock().insert(id, Vec::new());
        Ok(RawPoller(id))
    }

    fn poller_add(&self, poller: RawPoller, socket: RawSocket, events: i16) -> NativeResult<()> {
        self.socket_ptr(socket)?;
        let mut pollers = self.pollers.lock();
        let items = pollers.get_mut(&poller.0).ok_or(Errno::EFAULT)?;
        if items.iter().any(|(s, _)| *s == socket.0) {
            return Err(NativeError::with_detail(Errno::EINVAL, format!("{socket} already registered")));
        }
        items.push((socket.0, events));
        Ok(())
    }

    fn poller_modify(&self, poller: RawPoller, socket: RawSocket, events: i16) -> NativeResult<()> {
        let mut pollers = self.pollers.lock();
        let items = pollers.get_mut(&poller.0).ok_or(Errno::EFAULT)?;
        let item = items
            .iter_mut()
            .find(|(s, _)| *s == socket.0)
            .ok_or_else(|| NativeError::with_detail(Errno::EINVAL, format!("{socket} not registered")))?;
        item.1 = events;
        Ok(())
    }

    fn poller_remove(&self, poller: RawPoller, socket: RawSocket) -> NativeResult<()> {
        let mut pollers = self.pollers.lock();
        let items = pollers.get_mut(&poller.0).ok_or(Errno::EFAULT)?;
        let before = items.len();
        items.retain(|(s, _)| *s != socket.0);
        if items.len() == before {
            return Err(NativeError::with_detail(Errno::EINVAL, format!("{socket} not registered")));
        }
        Ok(())
    }

    fn poller_wait(
        &self,
        poller: RawPoller,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> NativeResult<Vec<PollEvent>> {
        let items = self.pollers.lock().get(&poller.0).ok_or(Errno::EFAULT)?.clone();
        if items.is_empty() && timeout.is_none() {
            return Err(NativeError::with_detail(Errno::EFAULT, "poller has no items"));
        }
        let mut poll_items = {
            let sockets = self.sockets.lock();
            items
                .iter()
                .map(|(id, events)| {
                    let socket = *sockets.get(id).ok_or(Errno::ENOTSOCK)?;
                    // SAFETY: an all-zero poll item is valid; socket and events are set below.
                    let mut item: sys::zmq_pollitem_t = unsafe { std::mem::zeroed() };
                    item.socket = ptr(socket);
                    item.events = *events;
                    Ok(item)
                })
                .collect::<NativeResult<Vec<_>>>()?
        };
        let timeout_ms = timeout.map_or(-1i64, |t| t.as_millis().min(i32::MAX as u128) as i64);
        let ready = check(unsafe { sys::zmq_poll(poll_items.as_mut_ptr(), poll_items.len() as c_int, timeout_ms as _) })?;
        if ready == 0 {
            return Err(Errno::ETIMEDOUT.into());
        }
        Ok(items
            .iter()
            .zip(&poll_items)
            .filter(|(_, item)| item.revents != 0)
            .take(max_events.max(1))
            .map(|((id, _), item)| PollEvent {
                socket: RawSocket(*id),
                events: item.revents,
            })
            .collect())
    }

    fn poller_destroy(&self, poller: RawPoller) -> NativeResult<()> {
        self.pollers.lock().remove(&poller.0).ok_or(Errno::EFAULT)?;
        Ok(())
    }

    fn timers_new(&self) -> NativeResult<RawTimers> {
        Ok(self.timers.create())
    }

    fn timers_add(&self, timers: RawTimers, interval: Duration, callback: TimerFn) -> NativeResult<TimerId> {
        self.timers.add(timers, interval, callback)
    }

    fn timers_set_interval(&self, timers: RawTimers, id: TimerId, interval: Duration) -> NativeResult<()> {
        self.timers.set_interval(timers, id, interval)
    }

    fn timers_reset(&self, timers: RawTimers, id: TimerId) -> NativeResult<()> {
        self.timers.reset(timers, id)
    }

    fn timers_cancel(&self, timers: RawTimers, id: TimerId) -> NativeResult<()> {
        self.timers.cancel(timers, id)
    }

    fn timers_timeout(&self, timers: RawTimers) -> NativeResult<Option<Duration>> {
        self.timers.timeout(timers)
    }

    fn timers_execute(&self, timers: RawTimers) -> NativeResult<()> {
        self.timers.execute(timers)
    }

    fn timers_destroy(&self, timers: RawTimers) -> NativeResult<()> {
        self.timers.destroy(timers)
    }

    fn thread_start(&self, body: ThreadFn) -> NativeResult<RawThread> {
        self.threads.start("zmq-thread", body)
    }

    fn thread_join(&self, thread: RawThread) -> NativeResult<()> {
        self.threads.join(thread)
    }

    fn thread_detach(&self, thread: RawThread) -> NativeResult<()> {
        self.threads.detach(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{self, SocketType};
    use std::sync::Arc;

    fn recv_text(backend: &ZmqBackend, socket: RawSocket) -> String {
        let msg = backend.msg_recv(socket, 0).unwrap();
        let data = backend.msg_data(msg).unwrap();
        backend.msg_close(msg).unwrap();
        String::from_utf8(data.to_vec()).unwrap()
    }

    #[test]
    fn pair_round_trips_a_message() {
        let backend = ZmqBackend::new();
        let ctx = backend.ctx_new().unwrap();
        let a = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        let b = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        backend.bind(a, "inproc://zmq-pair").unwrap();
        backend.connect(b, "inproc://zmq-pair").unwrap();

        let msg = backend.msg_init_data(b"hello").unwrap();
        assert_eq!(backend.msg_send(msg, a, 0).unwrap(), 5);
        backend.msg_close(msg).unwrap();
        assert_eq!(recv_text(&backend, b), "hello");

        backend.close(a).unwrap();
        backend.close(b).unwrap();
        backend.ctx_term(ctx).unwrap();
    }

    #[test]
    fn library_errors_carry_their_errno() {
        let backend = ZmqBackend::new();
        let ctx = backend.ctx_new().unwrap();
        let a = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        let err = backend.bind(a, "bogus://nowhere").unwrap_err();
        assert_eq!(err.errno, Errno::EPROTONOSUPPORT);
        let err = backend.msg_recv(a, consts::DONTWAIT).unwrap_err();
        assert_eq!(err.errno, Errno::EAGAIN);
        backend.close(a).unwrap();
        assert_eq!(backend.close(a).unwrap_err().errno, Errno::ENOTSOCK);
        backend.ctx_term(ctx).unwrap();
    }

    #[test_log::test]
    fn shutdown_wakes_blocked_receiver() {
        let backend = Arc::new(ZmqBackend::new());
        let ctx = backend.ctx_new().unwrap();
        let socket = backend.socket(ctx, SocketType::Pull.into()).unwrap();
        let receiver = {
            let backend = backend.clone();
            std::thread::spawn(move || backend.msg_recv(socket, 0).unwrap_err().errno)
        };
        std::thread::sleep(Duration::from_millis(50));
        backend.ctx_shutdown(ctx).unwrap();
        assert_eq!(receiver.join().unwrap(), Errno::ETERM);
        backend.close(socket).unwrap();
        backend.ctx_term(ctx).unwrap();
    }

    #[test]
    fn poller_times_out_then_reports_input() {
        let backend = ZmqBackend::new();
        let ctx = backend.ctx_new().unwrap();
        let push = backend.socket(ctx, SocketType::Push.into()).unwrap();
        let pull = backend.socket(ctx, SocketType::Pull.into()).unwrap();
        backend.bind(pull, "inproc://zmq-poller").unwrap();
        backend.connect(push, "inproc://zmq-poller").unwrap();
        let poller = backend.poller_new().unwrap();
        backend.poller_add(poller, pull, consts::POLLIN).unwrap();
        let err = backend
            .poller_wait(poller, 1, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err.errno, Errno::ETIMEDOUT);

        backend.send(push, b"wake", 0).unwrap();
        let events = backend.poller_wait(poller, 1, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events, vec![PollEvent { socket: pull, events: consts::POLLIN }]);
        assert_eq!(recv_text(&backend, pull), "wake");

        backend.poller_destroy(poller).unwrap();
        for socket in [push, pull] {
            backend.setsockopt(socket, consts::LINGER, &0i32.to_ne_bytes()).unwrap();
            backend.close(socket).unwrap();
        }
        backend.ctx_term(ctx).unwrap();
    }

    #[test]
    fn last_endpoint_needs_room() {
        let backend = ZmqBackend::new();
        let ctx = backend.ctx_new().unwrap();
        let socket = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        backend.bind(socket, "inproc://zmq-last-endpoint").unwrap();
        let endpoint = backend.getsockopt(socket, consts::LAST_ENDPOINT, 256).unwrap();
        assert_eq!(endpoint, b"inproc://zmq-last-endpoint\0".to_vec());
        let err = backend.getsockopt(socket, consts::LAST_ENDPOINT, 4).unwrap_err();
        assert_eq!(err.errno, Errno::EINVAL);
        backend.close(socket).unwrap();
        backend.ctx_term(ctx).unwrap();
    }
}
