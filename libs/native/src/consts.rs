//! Messaging library constants
//!
//! Only the socket types, options and flags the bridge uses. The full
//! constant table of the library is external configuration data.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Socket pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum SocketType {
    Pair = 0,
    Pub = 1,
    Sub = 2,
    Req = 3,
    Rep = 4,
    Dealer = 5,
    Router = 6,
    Pull = 7,
    Push = 8,
}

impl SocketType {
    pub fn can_send(self) -> bool {
        !matches!(self, SocketType::Pull | SocketType::Sub)
    }

    pub fn can_recv(self) -> bool {
        !matches!(self, SocketType::Push | SocketType::Pub)
    }

    /// Whether a socket of this type may be wired to a socket of `peer` type
    pub fn compatible_with(self, peer: SocketType) -> bool {
        use SocketType::*;
        matches!(
            (self, peer),
            (Pair, Pair)
                | (Pub, Sub)
                | (Sub, Pub)
                | (Req, Rep)
                | (Req, Router)
                | (Rep, Req)
                | (Rep, Dealer)
                | (Dealer, Dealer)
                | (Dealer, Router)
                | (Dealer, Rep)
                | (Router, Dealer)
                | (Router, Router)
                | (Router, Req)
                | (Push, Pull)
                | (Pull, Push)
        )
    }
}

// Socket options
pub const AFFINITY: i32 = 4;
pub const ROUTING_ID: i32 = 5;
pub const SUBSCRIBE: i32 = 6;
pub const UNSUBSCRIBE: i32 = 7;
pub const RCVMORE: i32 = 13;
pub const TYPE: i32 = 16;
pub const LINGER: i32 = 17;
pub const MAXMSGSIZE: i32 = 22;
pub const SNDHWM: i32 = 23;
pub const RCVHWM: i32 = 24;
pub const RCVTIMEO: i32 = 27;
pub const SNDTIMEO: i32 = 28;
pub const LAST_ENDPOINT: i32 = 32;
pub const IMMEDIATE: i32 = 39;

// Context options
pub const IO_THREADS: i32 = 1;
pub const MAX_SOCKETS: i32 = 2;
pub const THREAD_PRIORITY: i32 = 3;
pub const THREAD_SCHED_POLICY: i32 = 4;
pub const MAX_MSGSZ: i32 = 5;
pub const IPV6: i32 = 42;
pub const BLOCKY: i32 = 70;

pub const IO_THREADS_DFLT: i32 = 1;
pub const MAX_SOCKETS_DFLT: i32 = 1023;
pub const THREAD_PRIORITY_DFLT: i32 = -1;
pub const THREAD_SCHED_POLICY_DFLT: i32 = -1;

// Send/recv flags
pub const DONTWAIT: i32 = 1;
pub const SNDMORE: i32 = 2;

// Poll events
pub const POLLIN: i16 = 1;
pub const POLLOUT: i16 = 2;
pub const POLLERR: i16 = 4;
pub const POLLPRI: i16 = 8;
