//! Steerable proxy
//!
//! Forwards whole messages between a frontend and a backend socket on a
//! background thread. The spawning side steers it over the pipe: `PAUSE`
//! stops forwarding (messages queue up in the sockets), `RESUME` restarts it
//! and closing the thread terminates it.

use super::{Actor, BackgroundThread, Close, Spawner, Worker};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::poller::{Poller, Wait};
use crate::socket::Socket;
use anyhow::Context as _;
use native::{consts, Errno, SocketType};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PAUSE: &[u8] = b"PAUSE";
const RESUME: &[u8] = b"RESUME";
const ACK: &[u8] = b"OK";

/// One side of a proxy: a socket type and the endpoint it binds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub socket_type: i32,
    pub endpoint: String,
}

impl ProxyEndpoint {
    pub fn new(kind: SocketType, endpoint: impl Into<String>) -> Self {
        Self {
            socket_type: kind.into(),
            endpoint: endpoint.into(),
        }
    }

    fn open(&self, context: &Context) -> anyhow::Result<Socket> {
        let kind = SocketType::try_from(self.socket_type)
            .map_err(|_| Error::argument(format!("unknown socket type {}", self.socket_type)))?;
        let socket = context.socket(kind)?;
        socket.bind(&self.endpoint)?;
        Ok(socket)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyArgs {
    pub frontend: ProxyEndpoint,
    pub backend: ProxyEndpoint,
}

/// Worker side of [`Proxy`]
pub struct ProxyActor {
    worker: Worker,
    frontend: Socket,
    backend: Socket,
}

impl Actor for ProxyActor {
    type Args = ProxyArgs;
    type Runtime = ();

    fn init(args: ProxyArgs, _runtime: (), worker: Worker) -> anyhow::Result<Self> {
        let frontend = args
            .frontend
            .open(worker.context())
            .with_context(|| format!("cannot bind proxy frontend {}", args.frontend.endpoint))?;
        let backend = args
            .backend
            .open(worker.context())
            .with_context(|| format!("cannot bind proxy backend {}", args.backend.endpoint))?;
        Ok(Self {
            worker,
            frontend,
            backend,
        })
    }

    fn run(self) -> anyhow::Result<()> {
        let poller = self.worker.context().poller()?;
        poller.add(self.worker.pipe(), consts::POLLIN)?;
        self.watch(&poller)?;

        let pipe = self.worker.pipe().raw()?;
        let frontend = self.frontend.raw()?;
        let mut paused = false;
        loop {
            let Wait::Ready(events) = poller.wait_all(None, |_| {})? else {
                continue;
            };
            for event in events {
                if event.socket == pipe {
                    let Some(parts) = self.worker.next()? else {
                        debug!(thread = %self.worker.id(), "proxy terminated");
                        return Ok(());
                    };
                    let command: &[u8] = parts.first().map(|part| &part[..]).unwrap_or_default();
                    match command {
                        PAUSE if !paused => {
                            self.unwatch(&poller)?;
                            paused = true;
                        }
                        RESUME if paused => {
                            self.watch(&poller)?;
                            paused = false;
                        }
                        PAUSE | RESUME => {}
                        other => {
                            warn!(
                                thread = %self.worker.id(),
                                command = %String::from_utf8_lossy(other),
                                "unknown proxy command"
                            );
                            let reply = format!("unknown command {:?}", String::from_utf8_lossy(other));
                            self.worker.pipe().send(reply, 0)?;
                            continue;
                        }
                    }
                    self.worker.pipe().send(ACK, 0)?;
                } else if !paused {
                    let (from, to) = if event.socket == frontend {
                        (&self.frontend, &self.backend)
                    } else {
                        (&self.backend, &self.frontend)
                    };
                    forward(from, to)?;
                }
            }
        }
    }
}

impl ProxyActor {
    fn sides(&self) -> impl Iterator<Item = &Socket> + '_ {
        [&self.frontend, &self.backend]
            .into_iter()
            .filter(|socket| socket.kind().can_recv())
    }

    fn watch(&self, poller: &Poller) -> Result<()> {
        self.sides().try_for_each(|socket| poller.add(socket, consts::POLLIN))
    }

    fn unwatch(&self, poller: &Poller) -> Result<()> {
        self.sides().try_for_each(|socket| poller.remove(socket))
    }
}

fn forward(from: &Socket, to: &Socket) -> Result<()> {
    let received = match from.recv(consts::DONTWAIT) {
        Ok(received) => received,
        Err(err) if err.errno() == Some(Errno::EAGAIN) => return Ok(()),
        Err(err) => return Err(err),
    };
    to.send_multipart(received.to_bytes()?, 0)
}

/// Spawning side of a running proxy
#[derive(Debug)]
pub struct Proxy {
    thread: BackgroundThread,
}

impl Proxy {
    pub fn spawn(context: &Context, args: &ProxyArgs) -> Result<Self> {
        let thread = Spawner::new(context).spawn::<ProxyActor>(args)?;
        Ok(Self { thread })
    }

    /// Stop forwarding. Returns once the proxy has acknowledged.
    pub fn pause(&self) -> Result<()> {
        self.steer(PAUSE)
    }

    pub fn resume(&self) -> Result<()> {
        self.steer(RESUME)
    }

    /// Stop the proxy thread and release its sockets. Idempotent.
    pub fn terminate(&self) -> Result<()> {
        self.thread.close(Close::Blocking)
    }

    pub fn thread(&self) -> &BackgroundThread {
        &self.thread
    }

    fn steer(&self, command: &[u8]) -> Result<()> {
        let reply = self.thread.request(command)?;
        if reply.as_ref() == ACK {
            Ok(())
        } else {
            Err(Error::Remote(String::from_utf8_lossy(&reply).into_owned()))
        }
    }
}
