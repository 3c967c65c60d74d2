//! Native messaging library surface
//!
//! The [`Backend`] trait is the whole contract between the bridge and the
//! messaging library. With the `libzmq` feature, [`ZmqBackend`] binds it to
//! libzmq. [`InprocBackend`] is an in-process double covering `inproc://`
//! PAIR, PUSH and PULL sockets; with the `testing` feature,
//! `RecordingBackend` wraps any backend and logs every call for tests that
//! care about call order.

pub mod backend;
pub mod consts;
pub mod errno;
pub mod inproc;
#[cfg(any(test, feature = "testing"))]
pub mod recording;
mod threads;
mod timer_set;
#[cfg(feature = "libzmq")]
pub mod zmq;

pub use backend::{
    Backend, PollEvent, RawContext, RawMsg, RawPoller, RawSocket, RawThread, RawTimers, ThreadFn,
    TimerFn, TimerId,
};
pub use consts::SocketType;
pub use errno::{Errno, NativeError, NativeResult};
pub use inproc::InprocBackend;
#[cfg(any(test, feature = "testing"))]
pub use recording::{NativeCall, RecordingBackend};
#[cfg(feature = "libzmq")]
pub use zmq::ZmqBackend;
