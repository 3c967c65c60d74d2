//! In-process test double
//!
//! Implements [`Backend`] for `inproc://` endpoints and PAIR, PUSH and PULL
//! sockets only, so lifecycle code can be tested without the real library.
//! Every context created by one `InprocBackend` shares the same endpoint
//! namespace, the way every context in one process would. Multi-part
//! messages are delivered to the peer atomically once the final part is sent.
//!
//! Blocking operations wait on crossbeam channels so that a context shutdown
//! (which drops the context's shutdown sender) wakes them with `ETERM`.

use crate::backend::{
    Backend, PollEvent, RawContext, RawMsg, RawPoller, RawSocket, RawThread, RawTimers, ThreadFn,
    TimerFn, TimerId,
};
use crate::consts::{self, SocketType};
use crate::errno::{Errno, NativeError, NativeResult};
use crate::threads::ThreadTable;
use crate::timer_set::Timers;
use bytes::Bytes;
use crossbeam_channel::{self as channel, select, Receiver, Select, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

const INPROC_SCHEME: &str = "inproc://";

/// Upper bound on a single poller sleep, so send-readiness changes are seen
const POLL_SLICE: Duration = Duration::from_millis(10);

struct Delivery {
    parts: Vec<Bytes>,
}

struct ContextState {
    options: HashMap<i32, i32>,
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
    sockets: HashSet<u64>,
}

impl ContextState {
    fn is_shutdown(&self) -> bool {
        self.shutdown_tx.is_none()
    }
}

struct SocketState {
    ctx: u64,
    kind: SocketType,
    inbox_tx: Sender<Delivery>,
    inbox_rx: Receiver<Delivery>,
    // Dropped together with the socket; wakes receivers blocked on it.
    _closed_tx: Sender<()>,
    closed_rx: Receiver<()>,
    peers: Vec<u64>,
    next_peer: usize,
    bound: Vec<String>,
    connected: Vec<(String, u64)>,
    outgoing: Vec<Bytes>,
    incoming: VecDeque<Bytes>,
    rcvmore: bool,
    routing_id: Option<Bytes>,
    last_endpoint: String,
    linger: i32,
    sndtimeo: i32,
    rcvtimeo: i32,
    maxmsgsize: i64,
}

impl SocketState {
    fn new(ctx: u64, kind: SocketType) -> Self {
        let (inbox_tx, inbox_rx) = channel::unbounded();
        let (closed_tx, closed_rx) = channel::bounded(1);
        Self {
            ctx,
            kind,
            inbox_tx,
            inbox_rx,
            _closed_tx: closed_tx,
            closed_rx,
            peers: Vec::new(),
            next_peer: 0,
            bound: Vec::new(),
            connected: Vec::new(),
            outgoing: Vec::new(),
            incoming: VecDeque::new(),
            rcvmore: false,
            routing_id: None,
            last_endpoint: String::new(),
            linger: -1,
            sndtimeo: -1,
            rcvtimeo: -1,
            maxmsgsize: -1,
        }
    }

    fn has_input(&self) -> bool {
        !self.incoming.is_empty() || !self.inbox_rx.is_empty()
    }

    fn can_deliver(&self) -> bool {
        self.kind.can_send() && !self.peers.is_empty()
    }
}

struct MsgState {
    data: Bytes,
    more: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    contexts: HashMap<u64, ContextState>,
    sockets: HashMap<u64, SocketState>,
    endpoints: HashMap<String, u64>,
    msgs: HashMap<u64, MsgState>,
    pollers: HashMap<u64, Vec<(u64, i16)>>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn socket(&self, id: u64) -> NativeResult<&SocketState> {
        self.sockets.get(&id).ok_or_else(|| Errno::ENOTSOCK.into())
    }

    fn socket_mut(&mut self, id: u64) -> NativeResult<&mut SocketState> {
        self.sockets.get_mut(&id).ok_or_else(|| Errno::ENOTSOCK.into())
    }

    fn context(&self, id: u64) -> NativeResult<&ContextState> {
        self.contexts.get(&id).ok_or_else(|| Errno::EFAULT.into())
    }

    fn ensure_running(&self, socket: u64) -> NativeResult<()> {
        let ctx = self.socket(socket)?.ctx;
        if self.context(ctx)?.is_shutdown() {
            return Err(Errno::ETERM.into());
        }
        Ok(())
    }

    fn link(&mut self, a: u64, b: u64) {
        if let Some(sock) = self.sockets.get_mut(&a) {
            sock.peers.push(b);
        }
        if let Some(sock) = self.sockets.get_mut(&b) {
            sock.peers.push(a);
        }
    }

    fn unlink(&mut self, a: u64, b: u64) {
        if let Some(sock) = self.sockets.get_mut(&a) {
            sock.peers.retain(|p| *p != b);
        }
        if let Some(sock) = self.sockets.get_mut(&b) {
            sock.peers.retain(|p| *p != a);
        }
    }
}

fn inproc_name(endpoint: &str) -> NativeResult<&str> {
    match endpoint.strip_prefix(INPROC_SCHEME) {
        Some(name) if !name.is_empty() => Ok(name),
        Some(_) => Err(NativeError::with_detail(Errno::EINVAL, endpoint)),
        None if endpoint.contains("://") => Err(NativeError::with_detail(Errno::EPROTONOSUPPORT, endpoint)),
        None => Err(NativeError::with_detail(Errno::EINVAL, endpoint)),
    }
}

fn timeout_from_millis(ms: i32, flags: i32) -> Option<Duration> {
    if flags & consts::DONTWAIT != 0 {
        Some(Duration::ZERO)
    } else if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

fn decode_i32(value: &[u8]) -> NativeResult<i32> {
    let raw: [u8; 4] = value.try_into().map_err(|_| NativeError::new(Errno::EINVAL))?;
    Ok(i32::from_ne_bytes(raw))
}

fn decode_i64(value: &[u8]) -> NativeResult<i64> {
    let raw: [u8; 8] = value.try_into().map_err(|_| NativeError::new(Errno::EINVAL))?;
    Ok(i64::from_ne_bytes(raw))
}

/// In-process messaging backend for tests
#[derive(Default)]
pub struct InprocBackend {
    state: Mutex<State>,
    changed: Condvar,
    timers: Timers,
    threads: ThreadTable,
}

impl InprocBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sockets currently open across every context
    pub fn open_sockets(&self) -> usize {
        self.state.lock().sockets.len()
    }

    fn send_frame(&self, id: u64, frame: Bytes, flags: i32) -> NativeResult<usize> {
        let len = frame.len();
        let mut state = self.state.lock();
        {
            let sock = state.socket(id)?;
            if !sock.kind.can_send() {
                return Err(Errno::ENOTSUP.into());
            }
        }
        state.ensure_running(id)?;

        if flags & consts::SNDMORE != 0 {
            state.socket_mut(id)?.outgoing.push(frame);
            return Ok(len);
        }

        let timeout = timeout_from_millis(state.socket(id)?.sndtimeo, flags);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut frame = Some(frame);

        loop {
            state.ensure_running(id)?;
            let sock = state.socket(id)?;

            if !sock.peers.is_empty() {
                let peer = if sock.kind == SocketType::Pair {
                    sock.peers[0]
                } else {
                    sock.peers[sock.next_peer % sock.peers.len()]
                };
                let sock = state.socket_mut(id)?;
                sock.next_peer = sock.next_peer.wrapping_add(1);
                let mut parts = std::mem::take(&mut sock.outgoing);
                parts.extend(frame.take());
                if let Some(peer_sock) = state.sockets.get(&peer) {
                    let _ = peer_sock.inbox_tx.send(Delivery { parts });
                }
                self.changed.notify_all();
                return Ok(len);
            }

            match deadline {
                Some(d) if Instant::now() >= d => return Err(Errno::EAGAIN.into()),
                Some(d) => {
                    self.changed.wait_until(&mut state, d);
                }
                None => self.changed.wait(&mut state),
            }
        }
    }

    fn recv_frame(&self, id: u64, flags: i32) -> NativeResult<(Bytes, bool)> {
        let (inbox, closed, shutdown, timeout) = {
            let mut state = self.state.lock();
            let sock = state.socket_mut(id)?;
            if !sock.kind.can_recv() {
                return Err(Errno::ENOTSUP.into());
            }
            if let Some(part) = sock.incoming.pop_front() {
                sock.rcvmore = !sock.incoming.is_empty();
                return Ok((part, sock.rcvmore));
            }
            state.ensure_running(id)?;
            let sock = state.socket(id)?;
            let ctx = state.context(sock.ctx)?;
            (
                sock.inbox_rx.clone(),
                sock.closed_rx.clone(),
                ctx.shutdown_rx.clone(),
                timeout_from_millis(sock.rcvtimeo, flags),
            )
        };

        let delivery = if timeout == Some(Duration::ZERO) {
            inbox.try_recv().map_err(|_| NativeError::new(Errno::EAGAIN))?
        } else {
            let timer = match timeout {
                Some(t) => channel::after(t),
                None => channel::never(),
            };
            select! {
                recv(inbox) -> delivery => delivery.map_err(|_| NativeError::new(Errno::ENOTSOCK))?,
                recv(shutdown) -> _ => return Err(Errno::ETERM.into()),
                recv(closed) -> _ => return Err(Errno::ENOTSOCK.into()),
                recv(timer) -> _ => return Err(Errno::EAGAIN.into()),
            }
        };

        let mut state = self.state.lock();
        let sock = state.socket_mut(id)?;
        sock.incoming.extend(delivery.parts);
        let part = sock.incoming.pop_front().unwrap_or_default();
        sock.rcvmore = !sock.incoming.is_empty();
        Ok((part, sock.rcvmore))
    }
}

impl Backend for InprocBackend {
    fn ctx_new(&self) -> NativeResult<RawContext> {
        let mut state = self.state.lock();
        let id = state.next_id();
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        state.contexts.insert(
            id,
            ContextState {
                options: HashMap::new(),
                shutdown_tx: Some(shutdown_tx),
                shutdown_rx,
                sockets: HashSet::new(),
            },
        );
        Ok(RawContext(id))
    }

    fn ctx_set(&self, ctx: RawContext, option: i32, value: i32) -> NativeResult<()> {
        let mut state = self.state.lock();
        let context = state.contexts.get_mut(&ctx.0).ok_or(Errno::EFAULT)?;
        match option {
            consts::IO_THREADS | consts::MAX_SOCKETS | consts::MAX_MSGSZ if value < 0 => {
                Err(NativeError::with_detail(Errno::EINVAL, format!("option {option} = {value}")))
            }
            consts::IO_THREADS
            | consts::MAX_SOCKETS
            | consts::THREAD_PRIORITY
            | consts::THREAD_SCHED_POLICY
            | consts::MAX_MSGSZ
            | consts::IPV6
            | consts::BLOCKY => {
                context.options.insert(option, value);
                Ok(())
            }
            _ => Err(NativeError::with_detail(Errno::EINVAL, format!("context option {option}"))),
        }
    }

    fn ctx_get(&self, ctx: RawContext, option: i32) -> NativeResult<i32> {
        let state = self.state.lock();
        let context = state.context(ctx.0)?;
        if let Some(value) = context.options.get(&option) {
            return Ok(*value);
        }
        match option {
            consts::IO_THREADS => Ok(consts::IO_THREADS_DFLT),
            consts::MAX_SOCKETS => Ok(consts::MAX_SOCKETS_DFLT),
            consts::THREAD_PRIORITY => Ok(consts::THREAD_PRIORITY_DFLT),
            consts::THREAD_SCHED_POLICY => Ok(consts::THREAD_SCHED_POLICY_DFLT),
            consts::MAX_MSGSZ => Ok(i32::MAX),
            consts::IPV6 => Ok(0),
            consts::BLOCKY => Ok(1),
            _ => Err(NativeError::with_detail(Errno::EINVAL, format!("context option {option}"))),
        }
    }

    fn ctx_shutdown(&self, ctx: RawContext) -> NativeResult<()> {
        let mut state = self.state.lock();
        let context = state.contexts.get_mut(&ctx.0).ok_or(Errno::EFAULT)?;
        context.shutdown_tx = None;
        self.changed.notify_all();
        debug!(%ctx, "context shut down");
        Ok(())
    }

    fn ctx_term(&self, ctx: RawContext) -> NativeResult<()> {
        let mut state = self.state.lock();
        state.contexts.get_mut(&ctx.0).ok_or(Errno::EFAULT)?.shutdown_tx = None;
        self.changed.notify_all();
        while state
            .contexts
            .get(&ctx.0)
            .map_or(false, |c| !c.sockets.is_empty())
        {
            self.changed.wait(&mut state);
        }
        state.contexts.remove(&ctx.0);
        debug!(%ctx, "context terminated");
        Ok(())
    }

    fn socket(&self, ctx: RawContext, kind: i32) -> NativeResult<RawSocket> {
        let kind = SocketType::try_from(kind)
            .map_err(|_| NativeError::with_detail(Errno::EINVAL, format!("socket type {kind}")))?;
        if !matches!(
            kind,
            SocketType::Pair | SocketType::Push | SocketType::Pull
        ) {
            return Err(NativeError::with_detail(
                Errno::EINVAL,
                format!("{kind:?} sockets are not supported in-process"),
            ));
        }
        let mut state = self.state.lock();
        let context = state.context(ctx.0)?;
        if context.is_shutdown() {
            return Err(Errno::ETERM.into());
        }
        let id = state.next_id();
        state.sockets.insert(id, SocketState::new(ctx.0, kind));
        if let Some(context) = state.contexts.get_mut(&ctx.0) {
            context.sockets.insert(id);
        }
        Ok(RawSocket(id))
    }

    fn close(&self, socket: RawSocket) -> NativeResult<()> {
        let mut state = self.state.lock();
        let sock = state.sockets.remove(&socket.0).ok_or(Errno::ENOTSOCK)?;
        for endpoint in &sock.bound {
            state.endpoints.remove(endpoint);
        }
        for peer in &sock.peers {
            if let Some(peer_sock) = state.sockets.get_mut(peer) {
                peer_sock.peers.retain(|p| *p != socket.0);
                peer_sock.connected.retain(|(_, p)| *p != socket.0);
            }
        }
        if let Some(context) = state.contexts.get_mut(&sock.ctx) {
            context.sockets.remove(&socket.0);
        }
        self.changed.notify_all();
        Ok(())
    }

    fn bind(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        inproc_name(endpoint)?;
        let mut state = self.state.lock();
        state.ensure_running(socket.0)?;
        if state.endpoints.contains_key(endpoint) {
            return Err(NativeError::with_detail(Errno::EADDRINUSE, endpoint));
        }
        state.endpoints.insert(endpoint.to_string(), socket.0);
        let sock = state.socket_mut(socket.0)?;
        sock.bound.push(endpoint.to_string());
        sock.last_endpoint = endpoint.to_string();
        Ok(())
    }

    fn connect(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        inproc_name(endpoint)?;
        let mut state = self.state.lock();
        state.ensure_running(socket.0)?;
        let peer = *state
            .endpoints
            .get(endpoint)
            .ok_or_else(|| NativeError::with_detail(Errno::ECONNREFUSED, endpoint))?;
        let (kind, peer_kind) = (state.socket(socket.0)?.kind, state.socket(peer)?.kind);
        if !kind.compatible_with(peer_kind) {
            return Err(NativeError::with_detail(
                Errno::ENOCOMPATPROTO,
                format!("{kind:?} cannot talk to {peer_kind:?}"),
            ));
        }
        let pair_taken = kind == SocketType::Pair
            && (!state.socket(socket.0)?.peers.is_empty() || !state.socket(peer)?.peers.is_empty());
        if !pair_taken {
            state.link(socket.0, peer);
        }
        let sock = state.socket_mut(socket.0)?;
        sock.connected.push((endpoint.to_string(), peer));
        sock.last_endpoint = endpoint.to_string();
        self.changed.notify_all();
        Ok(())
    }

    fn disconnect(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        let mut state = self.state.lock();
        let sock = state.socket_mut(socket.0)?;
        let index = sock
            .connected
            .iter()
            .position(|(e, _)| e == endpoint)
            .ok_or_else(|| NativeError::with_detail(Errno::ENOENT, endpoint))?;
        let (_, peer) = sock.connected.remove(index);
        state.unlink(socket.0, peer);
        Ok(())
    }

    fn unbind(&self, socket: RawSocket, endpoint: &str) -> NativeResult<()> {
        let mut state = self.state.lock();
        let sock = state.socket_mut(socket.0)?;
        let index = sock
            .bound
            .iter()
            .position(|e| e == endpoint)
            .ok_or_else(|| NativeError::with_detail(Errno::ENOENT, endpoint))?;
        sock.bound.remove(index);
        state.endpoints.remove(endpoint);
        let connected: Vec<u64> = state
            .sockets
            .iter()
            .filter(|(_, s)| s.connected.iter().any(|(e, p)| e == endpoint && *p == socket.0))
            .map(|(id, _)| *id)
            .collect();
        for peer in connected {
            if let Some(peer_sock) = state.sockets.get_mut(&peer) {
                peer_sock.connected.retain(|(e, _)| e != endpoint);
            }
            state.unlink(socket.0, peer);
        }
        Ok(())
    }

    fn setsockopt(&self, socket: RawSocket, option: i32, value: &[u8]) -> NativeResult<()> {
        let mut state = self.state.lock();
        let sock = state.socket_mut(socket.0)?;
        match option {
            consts::LINGER => sock.linger = decode_i32(value)?,
            consts::SNDTIMEO => sock.sndtimeo = decode_i32(value)?,
            consts::RCVTIMEO => sock.rcvtimeo = decode_i32(value)?,
            consts::MAXMSGSIZE => sock.maxmsgsize = decode_i64(value)?,
            consts::ROUTING_ID if !value.is_empty() && value.len() <= 255 => {
                sock.routing_id = Some(Bytes::copy_from_slice(value));
            }
            _ => return Err(NativeError::with_detail(Errno::EINVAL, format!("socket option {option}"))),
        }
        Ok(())
    }

    fn getsockopt(&self, socket: RawSocket, option: i32, capacity: usize) -> NativeResult<Vec<u8>> {
        let state = self.state.lock();
        let sock = state.socket(socket.0)?;
        let value = match option {
            consts::LINGER => sock.linger.to_ne_bytes().to_vec(),
            consts::SNDTIMEO => sock.sndtimeo.to_ne_bytes().to_vec(),
            consts::RCVTIMEO => sock.rcvtimeo.to_ne_bytes().to_vec(),
            consts::TYPE => i32::from(sock.kind).to_ne_bytes().to_vec(),
            consts::RCVMORE => (sock.rcvmore as i32).to_ne_bytes().to_vec(),
            consts::MAXMSGSIZE => sock.maxmsgsize.to_ne_bytes().to_vec(),
            consts::ROUTING_ID => sock.routing_id.as_ref().map(|id| id.to_vec()).unwrap_or_default(),
            consts::LAST_ENDPOINT => {
                let mut endpoint = sock.last_endpoint.clone().into_bytes();
                endpoint.push(0);
                endpoint
            }
            _ => return Err(NativeError::with_detail(Errno::EINVAL, format!("socket option {option}"))),
        };
        if value.len() > capacity {
            return Err(NativeError::with_detail(
                Errno::EINVAL,
                format!("option {option} needs {} bytes, buffer holds {capacity}", value.len()),
            ));
        }
        Ok(value)
    }

    fn send(&self, socket: RawSocket, data: &[u8], flags: i32) -> NativeResult<usize> {
        self.send_frame(socket.0, Bytes::copy_from_slice(data), flags)
    }

    fn msg_init(&self) -> NativeResult<RawMsg> {
        self.msg_init_data(&[])
    }

    fn msg_init_data(&self, data: &[u8]) -> NativeResult<RawMsg> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.msgs.insert(
            id,
            MsgState {
                data: Bytes::copy_from_slice(data),
                more: false,
            },
        );
        Ok(RawMsg(id))
    }

    fn msg_copy(&self, src: RawMsg) -> NativeResult<RawMsg> {
        let mut state = self.state.lock();
        let data = state.msgs.get(&src.0).ok_or(Errno::EFAULT)?.data.clone();
        let id = state.next_id();
        state.msgs.insert(id, MsgState { data, more: false });
        Ok(RawMsg(id))
    }

    fn msg_data(&self, msg: RawMsg) -> NativeResult<Bytes> {
        let state = self.state.lock();
        Ok(state.msgs.get(&msg.0).ok_or(Errno::EFAULT)?.data.clone())
    }

    fn msg_more(&self, msg: RawMsg) -> NativeResult<bool> {
        let state = self.state.lock();
        Ok(state.msgs.get(&msg.0).ok_or(Errno::EFAULT)?.more)
    }

    fn msg_send(&self, msg: RawMsg, socket: RawSocket, flags: i32) -> NativeResult<usize> {
        let data = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.msgs.get_mut(&msg.0).ok_or(Errno::EFAULT)?.data)
        };
        match self.send_frame(socket.0, data.clone(), flags) {
            Ok(len) => Ok(len),
            Err(err) => {
                if let Some(m) = self.state.lock().msgs.get_mut(&msg.0) {
                    m.data = data;
                }
                Err(err)
            }
        }
    }

    fn msg_recv(&self, socket: RawSocket, flags: i32) -> NativeResult<RawMsg> {
        let (data, more) = self.recv_frame(socket.0, flags)?;
        let mut state = self.state.lock();
        let id = state.next_id();
        state.msgs.insert(id, MsgState { data, more });
        Ok(RawMsg(id))
    }

    fn msg_close(&self, msg: RawMsg) -> NativeResult<()> {
        let mut state = self.state.lock();
        state.msgs.remove(&msg.0).ok_or(Errno::EFAULT)?;
        Ok(())
    }

    fn poller_new(&self) -> NativeResult<RawPoller> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.pollers.insert(id, Vec::new());
        Ok(RawPoller(id))
    }

    fn poller_add(&self, poller: RawPoller, socket: RawSocket, events: i16) -> NativeResult<()> {
        let mut state = self.state.lock();
        state.socket(socket.0)?;
        let items = state.pollers.get_mut(&poller.0).ok_or(Errno::EFAULT)?;
        if items.iter().any(|(s, _)| *s == socket.0) {
            return Err(NativeError::with_detail(Errno::EINVAL, format!("{socket} already registered")));
        }
        items.push((socket.0, events));
        Ok(())
    }

    fn poller_modify(&self, poller: RawPoller, socket: RawSocket, events: i16) -> NativeResult<()> {
        let mut state = self.state.lock();
        let items = state.pollers.get_mut(&poller.0).ok_or(Errno::EFAULT)?;
        let item = items
            .iter_mut()
            .find(|(s, _)| *s == socket.0)
            .ok_or_else(|| NativeError::with_detail(Errno::EINVAL, format!("{socket} not registered")))?;
        item.1 = events;
        Ok(())
    }

    fn poller_remove(&self, poller: RawPoller, socket: RawSocket) -> NativeResult<()> {
        let mut state = self.state.lock();
        let items = state.pollers.get_mut(&poller.0).ok_or(Errno::EFAULT)?;
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
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let state = self.state.lock();
            let items = state.pollers.get(&poller.0).ok_or(Errno::EFAULT)?.clone();
            let mut ready = Vec::new();
            let mut watch = Vec::new();
            for (id, events) in &items {
                let Some(sock) = state.sockets.get(id) else { continue };
                let ctx = state.context(sock.ctx)?;
                if ctx.is_shutdown() {
                    return Err(Errno::ETERM.into());
                }
                let mut revents = 0;
                if events & consts::POLLIN != 0 && sock.has_input() {
                    revents |= consts::POLLIN;
                }
                if events & consts::POLLOUT != 0 && sock.can_deliver() {
                    revents |= consts::POLLOUT;
                }
                if revents != 0 {
                    ready.push(PollEvent {
                        socket: RawSocket(*id),
                        events: revents,
                    });
                }
                if events & consts::POLLIN != 0 {
                    watch.push(sock.inbox_rx.clone());
                }
            }
            let shutdowns: Vec<Receiver<()>> = items
                .iter()
                .filter_map(|(id, _)| state.sockets.get(id))
                .filter_map(|s| state.contexts.get(&s.ctx))
                .map(|c| c.shutdown_rx.clone())
                .collect();
            drop(state);

            if !ready.is_empty() {
                ready.truncate(max_events.max(1));
                return Ok(ready);
            }
            if items.is_empty() && deadline.is_none() {
                return Err(NativeError::with_detail(Errno::EFAULT, "poller has no items"));
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(Errno::ETIMEDOUT.into());
            }
            let slice = remaining.map_or(POLL_SLICE, |r| r.min(POLL_SLICE));
            let mut select = Select::new();
            for rx in &watch {
                select.recv(rx);
            }
            for rx in &shutdowns {
                select.recv(rx);
            }
            let _ = select.ready_timeout(slice);
        }
    }

    fn poller_destroy(&self, poller: RawPoller) -> NativeResult<()> {
        let mut state = self.state.lock();
        state.pollers.remove(&poller.0).ok_or(Errno::EFAULT)?;
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
        self.threads.start("inproc-thread", body)
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pair(backend: &InprocBackend, endpoint: &str) -> (RawContext, RawSocket, RawSocket) {
        let ctx = backend.ctx_new().unwrap();
        let a = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        let b = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        backend.bind(a, endpoint).unwrap();
        backend.connect(b, endpoint).unwrap();
        (ctx, a, b)
    }

    fn recv_all(backend: &InprocBackend, socket: RawSocket) -> Vec<Vec<u8>> {
        let mut parts = Vec::new();
        loop {
            let msg = backend.msg_recv(socket, 0).unwrap();
            parts.push(backend.msg_data(msg).unwrap().to_vec());
            let more = backend.msg_more(msg).unwrap();
            backend.msg_close(msg).unwrap();
            if !more {
                return parts;
            }
        }
    }

    #[test]
    fn pair_delivers_multipart_in_order() {
        let backend = InprocBackend::new();
        let (_, a, b) = pair(&backend, "inproc://pair-order");
        backend.send(a, b"one", consts::SNDMORE).unwrap();
        backend.send(a, b"two", consts::SNDMORE).unwrap();
        backend.send(a, b"three", 0).unwrap();
        assert_eq!(recv_all(&backend, b), vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn partial_multipart_is_not_visible() {
        let backend = InprocBackend::new();
        let (_, a, b) = pair(&backend, "inproc://pair-partial");
        backend.send(a, b"head", consts::SNDMORE).unwrap();
        let err = backend.msg_recv(b, consts::DONTWAIT).unwrap_err();
        assert_eq!(err.errno, Errno::EAGAIN);
    }

    #[test]
    fn bind_collision_reports_addr_in_use() {
        let backend = InprocBackend::new();
        let ctx = backend.ctx_new().unwrap();
        let a = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        let b = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        backend.bind(a, "inproc://taken").unwrap();
        assert_eq!(backend.bind(b, "inproc://taken").unwrap_err().errno, Errno::EADDRINUSE);
        assert_eq!(backend.bind(b, "tcp://127.0.0.1:5555").unwrap_err().errno, Errno::EPROTONOSUPPORT);
    }

    #[test]
    fn endpoint_namespace_is_shared_between_contexts() {
        let backend = InprocBackend::new();
        let first = backend.ctx_new().unwrap();
        let second = backend.ctx_new().unwrap();
        let a = backend.socket(first, SocketType::Pair.into()).unwrap();
        let b = backend.socket(second, SocketType::Pair.into()).unwrap();
        backend.bind(a, "inproc://shared").unwrap();
        backend.connect(b, "inproc://shared").unwrap();
        backend.send(b, b"hi", 0).unwrap();
        assert_eq!(recv_all(&backend, a), vec![b"hi".to_vec()]);
    }

    #[test]
    fn incompatible_socket_types_are_rejected() {
        let backend = InprocBackend::new();
        let ctx = backend.ctx_new().unwrap();
        let push = backend.socket(ctx, SocketType::Push.into()).unwrap();
        let pair = backend.socket(ctx, SocketType::Pair.into()).unwrap();
        backend.bind(pair, "inproc://mismatch").unwrap();
        assert_eq!(
            backend.connect(push, "inproc://mismatch").unwrap_err().errno,
            Errno::ENOCOMPATPROTO
        );
    }

    #[test_log::test]
    fn shutdown_wakes_blocked_receiver() {
        let backend = Arc::new(InprocBackend::new());
        let (ctx, _, b) = pair(&backend, "inproc://pair-shutdown");
        let receiver = {
            let backend = backend.clone();
            std::thread::spawn(move || backend.msg_recv(b, 0).unwrap_err().errno)
        };
        std::thread::sleep(Duration::from_millis(50));
        backend.ctx_shutdown(ctx).unwrap();
        assert_eq!(receiver.join().unwrap(), Errno::ETERM);
    }

    #[test_log::test]
    fn term_waits_for_sockets_to_close() {
        let backend = Arc::new(InprocBackend::new());
        let (ctx, a, b) = pair(&backend, "inproc://pair-term");
        let closer = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                backend.close(a).unwrap();
                backend.close(b).unwrap();
            })
        };
        backend.ctx_term(ctx).unwrap();
        assert_eq!(backend.open_sockets(), 0);
        closer.join().unwrap();
        assert_eq!(backend.socket(ctx, SocketType::Pair.into()).unwrap_err().errno, Errno::EFAULT);
    }

    #[test]
    fn send_timeout_without_peer() {
        let backend = InprocBackend::new();
        let ctx = backend.ctx_new().unwrap();
        let push = backend.socket(ctx, SocketType::Push.into()).unwrap();
        backend.setsockopt(push, consts::SNDTIMEO, &20i32.to_ne_bytes()).unwrap();
        assert_eq!(backend.send(push, b"x", 0).unwrap_err().errno, Errno::EAGAIN);
    }

    #[test]
    fn getsockopt_respects_capacity() {
        let backend = InprocBackend::new();
        let (_, a, _) = pair(&backend, "inproc://capacity");
        let endpoint = backend.getsockopt(a, consts::LAST_ENDPOINT, 64).unwrap();
        assert_eq!(endpoint, b"inproc://capacity\0".to_vec());
        assert_eq!(
            backend.getsockopt(a, consts::LAST_ENDPOINT, 4).unwrap_err().errno,
            Errno::EINVAL
        );
    }

    #[test]
    fn poller_reports_readable_socket() {
        let backend = InprocBackend::new();
        let (_, a, b) = pair(&backend, "inproc://poller");
        let poller = backend.poller_new().unwrap();
        backend.poller_add(poller, b, consts::POLLIN).unwrap();
        assert_eq!(
            backend
                .poller_wait(poller, 1, Some(Duration::from_millis(20)))
                .unwrap_err()
                .errno,
            Errno::ETIMEDOUT
        );
        backend.send(a, b"wake", 0).unwrap();
        let events = backend.poller_wait(poller, 1, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events, vec![PollEvent { socket: b, events: consts::POLLIN }]);
        backend.poller_destroy(poller).unwrap();
    }

    #[test]
    fn router_sockets_are_not_supported() {
        let backend = InprocBackend::new();
        let ctx = backend.ctx_new().unwrap();
        let err = backend.socket(ctx, SocketType::Router.into()).unwrap_err();
        assert_eq!(err.errno, Errno::EINVAL);
    }

    #[test]
    fn threads_run_through_the_backend() {
        let backend = InprocBackend::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        let thread = backend
            .thread_start(Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        backend.thread_join(thread).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
