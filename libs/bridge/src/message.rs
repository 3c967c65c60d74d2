use crate::context::Context;
use crate::error::{native, Result};
use crate::handle::{Handle, ReleasePolicy, Resource};
use crate::registry::ResourceKind;
use crate::socket::Socket;
use bytes::Bytes;
use native::{Backend, NativeResult, RawMsg};
use std::fmt;
use std::sync::Arc;

impl Resource for RawMsg {
    const KIND: ResourceKind = ResourceKind::Message;

    fn release(self, backend: &dyn Backend, _policy: ReleasePolicy) -> NativeResult<()> {
        backend.msg_close(self)
    }
}

/// One native message part
///
/// Messages are plain values: they are not registered with their context and
/// are closed when dropped.
pub struct Message {
    handle: Handle<RawMsg>,
}

impl Message {
    pub fn new(context: &Context) -> Result<Self> {
        let backend = context.backend().clone();
        let raw = backend.msg_init().map_err(native("msg_init"))?;
        Ok(Self::from_raw(backend, raw))
    }

    pub fn from_bytes(context: &Context, data: &[u8]) -> Result<Self> {
        let backend = context.backend().clone();
        let raw = backend.msg_init_data(data).map_err(native("msg_init_data"))?;
        Ok(Self::from_raw(backend, raw))
    }

    pub(crate) fn from_raw(backend: Arc<dyn Backend>, raw: RawMsg) -> Self {
        Self {
            handle: Handle::new(backend, raw),
        }
    }

    /// Native copy sharing the same content
    pub fn try_clone(&self) -> Result<Self> {
        let raw = self.handle.raw()?;
        let backend = self.handle.backend().clone();
        let copy = backend.msg_copy(raw).map_err(native("msg_copy"))?;
        Ok(Self::from_raw(backend, copy))
    }

    pub fn data(&self) -> Result<Bytes> {
        let raw = self.handle.raw()?;
        self.handle.backend().msg_data(raw).map_err(native("msg_data"))
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.data()?.len())
    }

    /// Whether more parts follow this one
    pub fn more(&self) -> Result<bool> {
        let raw = self.handle.raw()?;
        self.handle.backend().msg_more(raw).map_err(native("msg_more"))
    }

    /// Send through `socket`; on success the message is left empty
    pub fn send(&self, socket: &Socket, flags: i32) -> Result<usize> {
        let raw = self.handle.raw()?;
        let sock = socket.raw()?;
        self.handle
            .backend()
            .msg_send(raw, sock, flags)
            .map_err(native("msg_send"))
    }

    pub fn is_closed(&self) -> bool {
        !self.handle.is_live()
    }

    pub fn close(&self) {
        self.handle.release(ReleasePolicy::Immediate);
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        match (self.data(), other.data()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.handle.release(ReleasePolicy::Immediate);
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data() {
            Ok(data) => write!(f, "Message({data:?})"),
            Err(_) => write!(f, "Message(closed)"),
        }
    }
}
