//! Background actor threads
//!
//! An actor runs on its own native thread in its own context, and talks to
//! the spawning side only through a private `inproc` pipe. Its arguments
//! cross that boundary serialised; nothing else is shared.
//!
//! Spawning blocks until the worker reports whether it initialised. Closing
//! sends [`TERM`] down the pipe and joins the worker; a worker that already
//! returned is just joined.

mod endpoint;
pub mod proxy;
pub mod service;
mod spawn;
mod thread;

pub use endpoint::{pipe_address, RandomSuffix, SuffixSource, PIPE_PREFIX};
pub use proxy::{Proxy, ProxyActor, ProxyArgs, ProxyEndpoint};
pub use service::{InstanceId, Service, ServiceActor, ServiceHandle, ServiceHost};
pub use spawn::{SpawnState, Spawner};
pub use thread::{BackgroundThread, Close, ThreadId};

use crate::context::Context;
use crate::error::Result;
use crate::socket::{Received, Socket};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Sentinel asking a worker to stop
pub const TERM: &[u8] = b"TERM$";

/// The isolated runtime a worker opens before building its actor
pub trait Isolate: Sized {
    fn open() -> anyhow::Result<Self>;
}

impl Isolate for () {
    fn open() -> anyhow::Result<()> {
        Ok(())
    }
}

/// User code run on a background thread
pub trait Actor: Sized + 'static {
    /// Initial arguments, serialised across the thread boundary
    type Args: Serialize + DeserializeOwned;
    type Runtime: Isolate;

    /// Build the actor on the worker thread. The spawning side only
    /// proceeds once this has returned `Ok`.
    fn init(args: Self::Args, runtime: Self::Runtime, worker: Worker) -> anyhow::Result<Self>;

    fn run(self) -> anyhow::Result<()>;

    /// Runs on the spawning side once the worker is up, with the original
    /// arguments. An error tears the worker down and fails the spawn.
    fn on_ready(_thread: &BackgroundThread, _args: &Self::Args) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Worker-side environment of an actor
pub struct Worker {
    id: ThreadId,
    pipe: Socket,
    context: Context,
}

impl Worker {
    pub(crate) fn new(id: ThreadId, pipe: Socket, context: Context) -> Self {
        Self { id, pipe, context }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Worker end of the private pipe
    pub fn pipe(&self) -> &Socket {
        &self.pipe
    }

    /// The worker's own context; sockets the actor opens belong here
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Next message from the spawning side, or `None` once [`TERM`] arrives
    pub fn next(&self) -> Result<Option<Vec<Bytes>>> {
        let received = self.pipe.recv(0)?;
        let parts = received.to_bytes()?;
        if matches!(received, Received::Single(_)) && parts[0].as_ref() == TERM {
            return Ok(None);
        }
        Ok(Some(parts))
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("id", &self.id).finish()
    }
}
