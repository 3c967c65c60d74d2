//! Socket wrapper and call surface

use crate::context::Context;
use crate::error::{native, Error, Result};
use crate::handle::{Handle, ReleasePolicy, Resource};
use crate::message::Message;
use crate::options::{OptionKind, OptionValue};
use crate::registry::{RegistrationId, ResourceKind, Sweepable};
use bytes::Bytes;
use native::{consts, Backend, Errno, NativeResult, RawSocket, SocketType};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Largest option value the library ever reports
const MAX_OPTION_BYTES: usize = 64 * 1024;

impl Resource for RawSocket {
    const KIND: ResourceKind = ResourceKind::Socket;

    fn release(self, backend: &dyn Backend, policy: ReleasePolicy) -> NativeResult<()> {
        if let Some(linger) = policy.linger_ms() {
            // Best effort; the close below must happen regardless.
            if let Err(err) = backend.setsockopt(self, consts::LINGER, &linger.to_ne_bytes()) {
                debug!(socket = %self, error = %err, "could not set linger before close");
            }
        }
        backend.close(self)
    }
}

/// What a receive produced: one part, or every part of a multi-part message
#[derive(Debug)]
pub enum Received {
    Single(Message),
    Multi(Vec<Message>),
}

impl Received {
    pub fn len(&self) -> usize {
        match self {
            Received::Single(_) => 1,
            Received::Multi(parts) => parts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_parts(self) -> Vec<Message> {
        match self {
            Received::Single(msg) => vec![msg],
            Received::Multi(parts) => parts,
        }
    }

    /// Content of every part, in arrival order
    pub fn to_bytes(&self) -> Result<Vec<Bytes>> {
        match self {
            Received::Single(msg) => Ok(vec![msg.data()?]),
            Received::Multi(parts) => parts.iter().map(Message::data).collect(),
        }
    }
}

/// An owned socket
///
/// Clones share the native socket; it is released when the last clone is
/// dropped (with the configured bounded linger) or when [`Socket::close`]
/// is called on any of them.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    handle: Handle<RawSocket>,
    kind: SocketType,
    context: Context,
    registration: RegistrationId,
}

impl Socket {
    pub(crate) fn new(context: &Context, kind: SocketType) -> Result<Self> {
        let backend = context.backend().clone();
        let raw = backend
            .socket(context.raw(), kind.into())
            .map_err(native("socket"))?;
        let inner = Arc::new_cyclic(|weak: &Weak<SocketInner>| {
            let weak: Weak<dyn Sweepable> = weak.clone();
            SocketInner {
                handle: Handle::new(backend, raw),
                kind,
                context: context.clone(),
                registration: context.registry().register(weak, ResourceKind::Socket),
            }
        });
        debug!(socket = %raw, ?kind, "socket opened");
        Ok(Self { inner })
    }

    pub fn kind(&self) -> SocketType {
        self.inner.kind
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Native handle, or [`Error::Closed`] once released
    pub fn raw(&self) -> Result<RawSocket> {
        self.inner.handle.raw()
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.handle.is_live()
    }

    fn backend(&self) -> &Arc<dyn Backend> {
        self.inner.handle.backend()
    }

    pub fn bind(&self, endpoint: &str) -> Result<()> {
        check_endpoint(endpoint)?;
        let raw = self.raw()?;
        self.backend().bind(raw, endpoint).map_err(native("bind"))?;
        debug!(socket = %raw, endpoint, "bound");
        Ok(())
    }

    pub fn connect(&self, endpoint: &str) -> Result<()> {
        check_endpoint(endpoint)?;
        let raw = self.raw()?;
        self.backend().connect(raw, endpoint).map_err(native("connect"))
    }

    pub fn disconnect(&self, endpoint: &str) -> Result<()> {
        check_endpoint(endpoint)?;
        let raw = self.raw()?;
        self.backend().disconnect(raw, endpoint).map_err(native("disconnect"))
    }

    pub fn unbind(&self, endpoint: &str) -> Result<()> {
        check_endpoint(endpoint)?;
        let raw = self.raw()?;
        self.backend().unbind(raw, endpoint).map_err(native("unbind"))
    }

    /// Send one frame; pass [`consts::SNDMORE`] when more parts follow
    pub fn send(&self, data: impl AsRef<[u8]>, flags: i32) -> Result<usize> {
        let raw = self.raw()?;
        self.backend()
            .send(raw, data.as_ref(), flags)
            .map_err(native("send"))
    }

    /// Send an ordered list of frames as one message
    pub fn send_multipart<I, T>(&self, parts: I, flags: i32) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let parts: Vec<T> = parts.into_iter().collect();
        let Some((last, head)) = parts.split_last() else {
            return Err(Error::argument("multi-part message needs at least one part"));
        };
        for part in head {
            self.send(part, flags | consts::SNDMORE)?;
        }
        self.send(last, flags & !consts::SNDMORE)?;
        Ok(())
    }

    pub fn send_msg(&self, msg: &Message, flags: i32) -> Result<usize> {
        msg.send(self, flags)
    }

    /// Receive one frame as a message
    pub fn recv_msg(&self, flags: i32) -> Result<Message> {
        let raw = self.raw()?;
        let msg = self
            .backend()
            .msg_recv(raw, flags)
            .map_err(native("msg_recv"))?;
        Ok(Message::from_raw(self.backend().clone(), msg))
    }

    /// Receive a whole message, following the more flag across parts
    pub fn recv(&self, flags: i32) -> Result<Received> {
        let first = self.recv_msg(flags)?;
        if !first.more()? {
            return Ok(Received::Single(first));
        }
        let mut parts = vec![first];
        loop {
            let part = self.recv_msg(flags)?;
            let more = part.more()?;
            parts.push(part);
            if !more {
                return Ok(Received::Multi(parts));
            }
        }
    }

    /// Read an option, decoded as `kind`. Byte values are read into a buffer
    /// of the configured default capacity.
    pub fn get_option(&self, option: i32, kind: OptionKind) -> Result<OptionValue> {
        self.get_option_with_capacity(option, kind, self.inner.context.config().getsockopt_capacity)
    }

    /// Read an option into a buffer of `capacity` bytes. A byte value that
    /// does not fit is an [`Error::Argument`], never truncated.
    pub fn get_option_with_capacity(
        &self,
        option: i32,
        kind: OptionKind,
        capacity: usize,
    ) -> Result<OptionValue> {
        let raw = self.raw()?;
        let capacity = match kind {
            OptionKind::Bool | OptionKind::Int => 4,
            OptionKind::Int64 => 8,
            OptionKind::Bytes => capacity,
        };
        let value = match self.backend().getsockopt(raw, option, capacity) {
            Ok(value) => value,
            Err(err) if kind == OptionKind::Bytes && err.errno == Errno::EINVAL => {
                self.oversized_option(raw, option, capacity, err)?
            }
            Err(err) => return Err(Error::from_native("getsockopt", err)),
        };
        OptionValue::decode(kind, &value)
    }

    /// `EINVAL` covers both a short buffer and an unknown option. Asking
    /// again with room for any option value tells the two apart.
    fn oversized_option(
        &self,
        raw: RawSocket,
        option: i32,
        capacity: usize,
        original: native::NativeError,
    ) -> Result<Vec<u8>> {
        if capacity >= MAX_OPTION_BYTES {
            return Err(Error::from_native("getsockopt", original));
        }
        match self.backend().getsockopt(raw, option, MAX_OPTION_BYTES) {
            Ok(value) if value.len() > capacity => Err(Error::argument(format!(
                "socket option {option} needs {} bytes, which does not fit a {capacity} byte buffer",
                value.len()
            ))),
            Ok(value) => Ok(value),
            Err(_) => Err(Error::from_native("getsockopt", original)),
        }
    }

    pub fn set_option(&self, option: i32, value: impl Into<OptionValue>) -> Result<()> {
        let value = value.into();
        let raw = self.raw()?;
        self.backend()
            .setsockopt(raw, option, &value.encode())
            .map_err(native("setsockopt"))
    }

    pub fn linger(&self) -> Result<i32> {
        self.get_option(consts::LINGER, OptionKind::Int)?.as_i32()
    }

    pub fn set_linger(&self, ms: i32) -> Result<()> {
        self.set_option(consts::LINGER, ms)
    }

    /// `None` blocks forever
    pub fn send_timeout(&self) -> Result<Option<Duration>> {
        Ok(millis_to_timeout(self.get_option(consts::SNDTIMEO, OptionKind::Int)?.as_i32()?))
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_option(consts::SNDTIMEO, timeout_to_millis(timeout))
    }

    pub fn recv_timeout(&self) -> Result<Option<Duration>> {
        Ok(millis_to_timeout(self.get_option(consts::RCVTIMEO, OptionKind::Int)?.as_i32()?))
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_option(consts::RCVTIMEO, timeout_to_millis(timeout))
    }

    pub fn routing_id(&self) -> Result<Bytes> {
        Ok(self.get_option(consts::ROUTING_ID, OptionKind::Bytes)?.as_bytes()?.clone())
    }

    pub fn set_routing_id(&self, id: &[u8]) -> Result<()> {
        if id.is_empty() || id.len() > 255 {
            return Err(Error::argument("routing id must be 1 to 255 bytes"));
        }
        self.set_option(consts::ROUTING_ID, id)
    }

    pub fn last_endpoint(&self) -> Result<String> {
        self.get_option(consts::LAST_ENDPOINT, OptionKind::Bytes)?.as_str()
    }

    /// Whether more parts of the current message are waiting
    pub fn rcvmore(&self) -> Result<bool> {
        self.get_option(consts::RCVMORE, OptionKind::Bool)?.as_bool()
    }

    pub fn max_message_size(&self) -> Result<i64> {
        self.get_option(consts::MAXMSGSIZE, OptionKind::Int64)?.as_i64()
    }

    pub fn set_max_message_size(&self, size: i64) -> Result<()> {
        self.set_option(consts::MAXMSGSIZE, size)
    }

    /// Close with the socket's own linger. Idempotent.
    pub fn close(&self) {
        self.inner.handle.release(ReleasePolicy::Graceful);
    }

    /// Close discarding unsent messages. Idempotent.
    pub fn close_now(&self) {
        self.inner.handle.release(ReleasePolicy::Immediate);
    }
}

fn check_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.is_empty() || endpoint.contains('\0') || !endpoint.contains("://") {
        return Err(Error::argument(format!("malformed endpoint {endpoint:?}")));
    }
    Ok(())
}

fn timeout_to_millis(timeout: Option<Duration>) -> i32 {
    timeout.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as i32)
}

fn millis_to_timeout(ms: i32) -> Option<Duration> {
    (ms >= 0).then(|| Duration::from_millis(ms as u64))
}

impl SocketInner {
    fn release_policy(&self) -> ReleasePolicy {
        ReleasePolicy::Bounded(self.context.config().release_linger())
    }
}

impl Sweepable for SocketInner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Socket
    }

    fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    fn sweep(&self) -> bool {
        self.handle.release(self.release_policy())
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.handle.release(self.release_policy());
        self.context
            .registry()
            .unregister(ResourceKind::Socket, self.registration);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("kind", &self.inner.kind)
            .field("handle", &self.inner.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use native::{InprocBackend, RecordingBackend};

    fn context() -> (Arc<RecordingBackend>, Context) {
        let recording = Arc::new(RecordingBackend::new(Arc::new(InprocBackend::new())));
        let backend: Arc<dyn Backend> = recording.clone();
        (recording, Context::new(backend, BridgeConfig::default()).unwrap())
    }

    fn pair(ctx: &Context, endpoint: &str) -> (Socket, Socket) {
        let a = ctx.socket(SocketType::Pair).unwrap();
        let b = ctx.socket(SocketType::Pair).unwrap();
        a.bind(endpoint).unwrap();
        b.connect(endpoint).unwrap();
        (a, b)
    }

    #[test]
    fn close_is_idempotent() {
        let (recording, ctx) = context();
        let socket = ctx.socket(SocketType::Pair).unwrap();
        let raw = socket.raw().unwrap();

        socket.close();
        socket.close();
        socket.close_now();
        drop(socket);

        assert_eq!(recording.count_on("close", raw.0), 1);
    }

    #[test]
    fn close_now_sets_zero_linger() {
        let (recording, ctx) = context();
        let socket = ctx.socket(SocketType::Pair).unwrap();
        socket.close_now();
        let linger = recording.calls_of("setsockopt");
        assert_eq!(linger.len(), 1);
        assert_eq!(linger[0].detail.as_deref(), Some("17"));
    }

    #[test]
    fn operations_on_closed_socket_fail_locally() {
        let (recording, ctx) = context();
        let socket = ctx.socket(SocketType::Pair).unwrap();
        socket.close();
        recording.clear();
        assert!(matches!(socket.send(b"x", 0), Err(Error::Closed("socket"))));
        assert!(recording.calls().is_empty());
    }

    #[test]
    fn malformed_endpoint_never_reaches_native() {
        let (recording, ctx) = context();
        let socket = ctx.socket(SocketType::Pair).unwrap();
        recording.clear();
        assert!(matches!(socket.bind("no-scheme"), Err(Error::Argument(_))));
        assert!(matches!(socket.connect(""), Err(Error::Argument(_))));
        assert_eq!(recording.count("bind") + recording.count("connect"), 0);
    }

    #[test]
    fn single_and_multi_part_receive() {
        let (_, ctx) = context();
        let (a, b) = pair(&ctx, "inproc://socket-recv");

        a.send("solo", 0).unwrap();
        assert!(matches!(b.recv(0).unwrap(), Received::Single(_)));

        a.send_multipart(["one", "two", "three"], 0).unwrap();
        let received = b.recv(0).unwrap();
        assert_eq!(received.len(), 3);
        assert_eq!(
            received.to_bytes().unwrap(),
            vec![Bytes::from("one"), Bytes::from("two"), Bytes::from("three")]
        );
    }

    #[test]
    fn empty_multipart_is_an_argument_error() {
        let (_, ctx) = context();
        let socket = ctx.socket(SocketType::Pair).unwrap();
        let parts: Vec<&[u8]> = Vec::new();
        assert!(matches!(socket.send_multipart(parts, 0), Err(Error::Argument(_))));
    }

    #[test]
    fn typed_options_round_trip() {
        let (_, ctx) = context();
        let (a, _b) = pair(&ctx, "inproc://socket-options");

        a.set_linger(250).unwrap();
        assert_eq!(a.linger().unwrap(), 250);
        a.set_recv_timeout(Some(Duration::from_millis(40))).unwrap();
        assert_eq!(a.recv_timeout().unwrap(), Some(Duration::from_millis(40)));
        assert_eq!(a.send_timeout().unwrap(), None);
        a.set_max_message_size(1 << 20).unwrap();
        assert_eq!(a.max_message_size().unwrap(), 1 << 20);
        assert_eq!(a.last_endpoint().unwrap(), "inproc://socket-options");
        assert!(!a.rcvmore().unwrap());
    }

    #[test]
    fn oversized_byte_option_is_an_argument_error() {
        let (_, ctx) = context();
        let (a, _b) = pair(&ctx, "inproc://a-rather-long-endpoint-name");
        let err = a
            .get_option_with_capacity(consts::LAST_ENDPOINT, OptionKind::Bytes, 8)
            .unwrap_err();
        assert!(matches!(err, Error::Argument(_)), "{err:?}");
        assert!(err.to_string().contains("needs 37 bytes"), "{err}");
    }

    #[test]
    fn unknown_byte_option_is_a_native_error() {
        let (recording, ctx) = context();
        let socket = ctx.socket(SocketType::Pair).unwrap();
        recording.clear();
        let err = socket
            .get_option_with_capacity(9999, OptionKind::Bytes, 8)
            .unwrap_err();
        match err {
            Error::Native { op, errno, .. } => {
                assert_eq!(op, "getsockopt");
                assert_eq!(errno, Errno::EINVAL);
            }
            other => panic!("expected a native error, got {other:?}"),
        }
        assert_eq!(recording.count("getsockopt"), 2);
    }

    #[test]
    fn recv_after_shutdown_is_terminated() {
        let (_, ctx) = context();
        let (_a, b) = pair(&ctx, "inproc://socket-shutdown");
        ctx.shutdown().unwrap();
        let err = b.recv(0).unwrap_err();
        assert!(err.is_terminated(), "{err:?}");
    }
}
