//! Spawn and handshake
//!
//! The spawning side binds a fresh pipe in a new child context, starts a
//! native thread and blocks until the worker writes a one-byte status. Once
//! the worker is up, [`Actor::on_ready`] runs on the spawning side with the
//! original arguments. Whatever goes wrong on the way, everything acquired
//! so far is released before the error surfaces.

use super::endpoint::{bind_unique, RandomSuffix, SuffixSource};
use super::thread::{reap, BackgroundThread, Close, DoneSignal, Running, ThreadId};
use super::{Actor, Isolate, Worker};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::socket::Socket;
use anyhow::Context as _;
use crossbeam_channel::Receiver;
use native::{RawThread, SocketType, ThreadFn};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

const HANDSHAKE_OK: &[u8] = &[1];
const HANDSHAKE_FAILED: &[u8] = &[0];

/// Where a spawn currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    Init,
    ChannelBound,
    WorkerSpawned,
    HandshakeWait,
    Ready,
    Failed,
}

type Observer = Arc<dyn Fn(ThreadId, SpawnState) + Send + Sync>;

/// Starts actors on background threads
#[derive(Clone)]
pub struct Spawner {
    context: Context,
    suffixes: Arc<dyn SuffixSource>,
    observer: Option<Observer>,
}

impl Spawner {
    /// Threads spawned here are registered with, and swept by, `context`
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            suffixes: Arc::new(RandomSuffix),
            observer: None,
        }
    }

    pub fn with_suffixes(mut self, suffixes: Arc<dyn SuffixSource>) -> Self {
        self.suffixes = suffixes;
        self
    }

    /// Call `f` on every state transition
    pub fn on_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(ThreadId, SpawnState) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(f));
        self
    }

    /// Start `A` on a new thread and wait for it to initialise
    pub fn spawn<A: Actor>(&self, args: &A::Args) -> Result<BackgroundThread> {
        if self.context.is_terminated() {
            return Err(Error::Closed("context"));
        }
        let id = ThreadId::new();
        self.enter(id, SpawnState::Init);
        let payload = bincode::serialize(args)?;
        let worker_ctx = self.context.child()?;

        let (frontend, pipe, endpoint) = match self.open_channel(&worker_ctx) {
            Ok(channel) => channel,
            Err(err) => return Err(self.fail(id, &worker_ctx, None, None, err)),
        };
        self.enter(id, SpawnState::ChannelBound);

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let worker_context = worker_ctx.clone();
        let body: ThreadFn = Box::new(move || {
            let _done = DoneSignal(done_tx);
            worker_main::<A>(id, pipe, worker_context, payload);
        });
        let thread = match worker_ctx.backend().thread_start(body) {
            Ok(thread) => thread,
            Err(err) => {
                let err = Error::from_native("thread_start", err);
                return Err(self.fail(id, &worker_ctx, Some(frontend), None, err));
            }
        };
        self.enter(id, SpawnState::WorkerSpawned);

        self.enter(id, SpawnState::HandshakeWait);
        let status = frontend.recv_msg(0).and_then(|msg| msg.data());
        let failure = match status {
            Ok(data) if data.as_ref() == HANDSHAKE_OK => None,
            Ok(_) => Some(Error::worker_init(format!("cannot initialize worker {id}"))),
            Err(err) if err.is_terminated() => Some(err),
            Err(err) => Some(Error::worker_init(format!(
                "cannot initialize worker {id}: handshake failed: {err}"
            ))),
        };
        if let Some(err) = failure {
            return Err(self.fail(id, &worker_ctx, Some(frontend), Some((thread, done_rx)), err));
        }

        let thread = BackgroundThread::new(
            &self.context,
            id,
            endpoint,
            Running {
                frontend,
                worker_ctx,
                thread,
                done: done_rx,
            },
        );
        if let Err(err) = A::on_ready(&thread, args) {
            self.enter(id, SpawnState::Failed);
            warn!(thread = %id, error = ?err, "spawning-side initializer failed");
            if let Err(close_err) = thread.close(Close::NonBlocking) {
                debug!(thread = %id, error = %close_err, "teardown after failed initializer");
            }
            return Err(Error::worker_init(format!("cannot initialize worker {id}: {err:#}")));
        }

        self.enter(id, SpawnState::Ready);
        debug!(thread = %id, endpoint = thread.endpoint(), "background thread ready");
        Ok(thread)
    }

    fn open_channel(&self, worker_ctx: &Context) -> Result<(Socket, Socket, String)> {
        let frontend = worker_ctx.socket(SocketType::Pair)?;
        let endpoint = bind_unique(
            &frontend,
            self.suffixes.as_ref(),
            self.context.config().bind_attempts,
        )?;
        let pipe = worker_ctx.socket(SocketType::Pair)?;
        pipe.connect(&endpoint)?;
        Ok((frontend, pipe, endpoint))
    }

    fn fail(
        &self,
        id: ThreadId,
        worker_ctx: &Context,
        frontend: Option<Socket>,
        started: Option<(RawThread, Receiver<()>)>,
        err: Error,
    ) -> Error {
        self.enter(id, SpawnState::Failed);
        warn!(thread = %id, error = %err, "spawn failed");
        if let Some(frontend) = frontend {
            frontend.close_now();
        }
        let joined = match started {
            Some((thread, done)) => {
                if let Err(err) = worker_ctx.shutdown() {
                    debug!(thread = %id, error = %err, "worker context shutdown failed");
                }
                reap(
                    worker_ctx.backend().as_ref(),
                    id,
                    thread,
                    &done,
                    self.context.config().join_timeout(),
                )
            }
            None => true,
        };
        if joined {
            if let Err(err) = worker_ctx.terminate() {
                warn!(thread = %id, error = %err, "worker context teardown failed");
            }
        }
        err
    }

    fn enter(&self, id: ThreadId, state: SpawnState) {
        debug!(thread = %id, ?state, "spawn");
        if let Some(observer) = &self.observer {
            observer(id, state);
        }
    }
}

impl fmt::Debug for Spawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawner")
            .field("context", &self.context)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

/// Writes the failure status unless [`Handshake::succeed`] ran first, so a
/// worker that errors or panics during init never leaves the spawner waiting
struct Handshake {
    pipe: Option<Socket>,
}

impl Handshake {
    fn new(pipe: Socket) -> Self {
        Self { pipe: Some(pipe) }
    }

    fn succeed(mut self) -> Result<()> {
        match self.pipe.take() {
            Some(pipe) => pipe.send(HANDSHAKE_OK, 0).map(|_| ()),
            None => Ok(()),
        }
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            if let Err(err) = pipe.send(HANDSHAKE_FAILED, 0) {
                debug!(error = %err, "failure status not delivered");
            }
        }
    }
}

/// Body of every worker thread. Whatever the actor leaves open is swept when
/// the spawning side terminates the worker context after the join.
fn worker_main<A: Actor>(id: ThreadId, pipe: Socket, context: Context, payload: Vec<u8>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        drive::<A>(id, pipe, context, &payload);
    }));
    if let Err(payload) = outcome {
        error!(thread = %id, panic = panic_message(payload.as_ref()), "worker panicked");
    }
    debug!(thread = %id, "worker exiting");
}

fn drive<A: Actor>(id: ThreadId, pipe: Socket, context: Context, payload: &[u8]) {
    let handshake = Handshake::new(pipe.clone());
    match init_actor::<A>(id, pipe, context, payload) {
        Ok(actor) => match handshake.succeed() {
            Ok(()) => {
                if let Err(err) = actor.run() {
                    report(id, "run", &err);
                }
            }
            Err(err) => report(id, "handshake", &err.into()),
        },
        Err(err) => {
            report(id, "init", &err);
            drop(handshake);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn init_actor<A: Actor>(
    id: ThreadId,
    pipe: Socket,
    context: Context,
    payload: &[u8],
) -> anyhow::Result<A> {
    let runtime = A::Runtime::open().context("cannot open worker runtime")?;
    let args: A::Args = bincode::deserialize(payload).map_err(Error::from)?;
    A::init(args, runtime, Worker::new(id, pipe, context))
}

fn report(id: ThreadId, stage: &'static str, err: &anyhow::Error) {
    let terminated = err
        .chain()
        .any(|cause| cause.downcast_ref::<Error>().is_some_and(Error::is_terminated));
    if terminated {
        debug!(thread = %id, stage, "worker stopped by context shutdown");
    } else {
        error!(thread = %id, stage, error = ?err, "worker failed");
    }
}
