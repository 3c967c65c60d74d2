//! Messaging library boundary
//!
//! The bridge only ever talks to the messaging library through [`Backend`].
//! The API is deliberately shaped like the C library it stands for: opaque
//! raw handles in, raw handles out, every failure reported as a
//! [`NativeError`]. Ownership of the raw handles is the caller's problem.

use crate::errno::NativeResult;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

raw_handle!(
    /// Native messaging context
    RawContext,
    "ctx"
);
raw_handle!(
    /// Native socket
    RawSocket,
    "socket"
);
raw_handle!(
    /// Native message
    RawMsg,
    "msg"
);
raw_handle!(
    /// Native poller
    RawPoller,
    "poller"
);
raw_handle!(
    /// Native timer set
    RawTimers,
    "timers"
);
raw_handle!(
    /// Native thread
    RawThread,
    "thread"
);

/// Timer identifier inside a timer set
pub type TimerId = i32;

/// Body of a natively started thread
pub type ThreadFn = Box<dyn FnOnce() + Send + 'static>;

/// Callback fired by `timers_execute`
pub type TimerFn = Box<dyn FnMut(TimerId) + Send + 'static>;

/// One ready item reported by a poller wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub socket: RawSocket,
    pub events: i16,
}

/// The messaging library, as consumed by the bridge
///
/// Timeouts use `None` for "block forever". Poller waits fail with
/// `ETIMEDOUT` when nothing became ready in time.
pub trait Backend: Send + Sync + 'static {
    // Context
    fn ctx_new(&self) -> NativeResult<RawContext>;
    fn ctx_set(&self, ctx: RawContext, option: i32, value: i32) -> NativeResult<()>;
    fn ctx_get(&self, ctx: RawContext, option: i32) -> NativeResult<i32>;
    fn ctx_shutdown(&self, ctx: RawContext) -> NativeResult<()>;
    fn ctx_term(&self, ctx: RawContext) -> NativeResult<()>;

    // Sockets
    fn socket(&self, ctx: RawContext, kind: i32) -> NativeResult<RawSocket>;
    fn close(&self, socket: RawSocket) -> NativeResult<()>;
    fn bind(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()>;
    fn connect(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()>;
    fn disconnect(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()>;
    fn unbind(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()>;
    fn setsockopt(&self, socket: RawSocket, option: i32, value: &[u8]) -> NativeResult<()>;
    fn getsockopt(&self, socket: RawSocket, option: i32, capacity: usize) -> NativeResult<Vec<u8>>;
    fn send(&self, socket: RawSocket, data: &[u8], flags: i32) -> NativeResult<usize>;

    // Messages
    fn msg_init(&self) -> NativeResult<RawMsg>;
    fn msg_init_data(&self, data: &[u8]) -> NativeResult<RawMsg>;
    fn msg_copy(&self, src: RawMsg) -> NativeResult<RawMsg>;
    fn msg_data(&self, msg: RawMsg) -> NativeResult<Bytes>;
    fn msg_more(&self, msg: RawMsg) -> NativeResult<bool>;
    /// Sends the message content; on success the message is left empty
    fn msg_send(&self, msg: RawMsg, socket: RawSocket, flags: i32) -> NativeResult<usize>;
    fn msg_recv(&self, socket: RawSocket, flags: i32) -> NativeResult<RawMsg>;
    fn msg_close(&self, msg: RawMsg) -> NativeResult<()>;

    // Pollers
    fn poller_new(&self) -> NativeResult<RawPoller>;
    fn poller_add(&self, poller: RawPoller, socket: RawSocket, events: i16) -> NativeResult<()>;
    fn poller_modify(&self, poller: RawPoller, socket: RawSocket, events: i16) -> NativeResult<()>;
    fn poller_remove(&self, poller: RawPoller, socket: RawSocket) -> NativeResult<()>;
    fn poller_wait(
        &self,
        poller: RawPoller,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> NativeResult<Vec<PollEvent>>;
    fn poller_destroy(&self, poller: RawPoller) -> NativeResult<()>;

    // Timers
    fn timers_new(&self) -> NativeResult<RawTimers>;
    fn timers_add(&self, timers: RawTimers, interval: Duration, callback: TimerFn) -> NativeResult<TimerId>;
    fn timers_set_interval(&self, timers: RawTimers, id: TimerId, interval: Duration) -> NativeResult<()>;
    fn timers_reset(&self, timers: RawTimers, id: TimerId) -> NativeResult<()>;
    fn timers_cancel(&self, timers: RawTimers, id: TimerId) -> NativeResult<()>;
    /// Time until the next timer fires, `None` when no timer is armed
    fn timers_timeout(&self, timers: RawTimers) -> NativeResult<Option<Duration>>;
    fn timers_execute(&self, timers: RawTimers) -> NativeResult<()>;
    fn timers_destroy(&self, timers: RawTimers) -> NativeResult<()>;

    // Threads
    fn thread_start(&self, body: ThreadFn) -> NativeResult<RawThread>;
    fn thread_join(&self, thread: RawThread) -> NativeResult<()>;
    /// Forgets a thread without joining it
    fn thread_detach(&self, thread: RawThread) -> NativeResult<()>;
}
