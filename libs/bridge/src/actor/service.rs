//! Request/response actors
//!
//! A [`ServiceHost`] is a background thread hosting any number of instances
//! of one [`Service`]. Each instance is reached through its own
//! [`ServiceHandle`]; dropping the handle finalizes the remote instance.
//! Requests and replies travel the private pipe as bincode frames, and a
//! failing request comes back as [`Error::Remote`].

use super::{Actor, BackgroundThread, Close, Spawner, Worker};
use crate::context::Context;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, warn};

pub trait Service: Sized + 'static {
    type Args: Serialize + DeserializeOwned;
    type Request: Serialize + DeserializeOwned;
    type Response: Serialize + DeserializeOwned;

    fn new(args: Self::Args, worker: &Worker) -> anyhow::Result<Self>;

    fn handle(&mut self, request: Self::Request) -> anyhow::Result<Self::Response>;

    /// Runs once the instance is released, or when the host stops
    fn finalize(&mut self) {}
}

/// Identifies one instance inside its host
pub type InstanceId = u64;

#[derive(Debug, Serialize, Deserialize)]
enum Envelope<A, R> {
    Create(A),
    Call { instance: InstanceId, request: R },
    Cast { instance: InstanceId, request: R },
    Finalize(InstanceId),
}

type Reply<T> = std::result::Result<T, String>;

/// Worker side: owns the instances and serves the pipe until
/// [`super::TERM`] arrives
pub struct ServiceActor<S: Service> {
    worker: Worker,
    instances: BTreeMap<InstanceId, S>,
    next_instance: InstanceId,
}

impl<S: Service> Actor for ServiceActor<S> {
    type Args = ();
    type Runtime = ();

    fn init(_args: (), _runtime: (), worker: Worker) -> anyhow::Result<Self> {
        Ok(Self {
            worker,
            instances: BTreeMap::new(),
            next_instance: 0,
        })
    }

    fn run(mut self) -> anyhow::Result<()> {
        let outcome = self.serve();
        for (_, mut instance) in std::mem::take(&mut self.instances) {
            instance.finalize();
        }
        outcome
    }
}

impl<S: Service> ServiceActor<S> {
    fn serve(&mut self) -> anyhow::Result<()> {
        while let Some(parts) = self.worker.next()? {
            let Some(frame) = parts.first() else {
                continue;
            };
            let envelope: Envelope<S::Args, S::Request> = match bincode::deserialize(frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(thread = %self.worker.id(), error = %err, "dropping undecodable request");
                    continue;
                }
            };
            match envelope {
                Envelope::Create(args) => {
                    let reply = self.create(args);
                    self.reply(&reply)?;
                }
                Envelope::Call { instance, request } => {
                    let reply = self.handle(instance, request);
                    self.reply(&reply)?;
                }
                Envelope::Cast { instance, request } => {
                    if let Err(err) = self.handle(instance, request) {
                        debug!(thread = %self.worker.id(), instance, error = %err, "cast failed");
                    }
                }
                Envelope::Finalize(instance) => {
                    if let Some(mut service) = self.instances.remove(&instance) {
                        service.finalize();
                    }
                }
            }
        }
        Ok(())
    }

    fn create(&mut self, args: S::Args) -> Reply<InstanceId> {
        let service = S::new(args, &self.worker).map_err(|err| format!("{err:#}"))?;
        self.next_instance += 1;
        self.instances.insert(self.next_instance, service);
        Ok(self.next_instance)
    }

    fn handle(&mut self, instance: InstanceId, request: S::Request) -> Reply<S::Response> {
        let service = self
            .instances
            .get_mut(&instance)
            .ok_or_else(|| format!("no such instance {instance}"))?;
        service.handle(request).map_err(|err| format!("{err:#}"))
    }

    fn reply<T: Serialize>(&self, reply: &Reply<T>) -> anyhow::Result<()> {
        let frame = bincode::serialize(reply).map_err(Error::from)?;
        self.worker.pipe().send(frame, 0)?;
        Ok(())
    }
}

/// Spawning side of a thread hosting [`Service`] instances
pub struct ServiceHost<S: Service> {
    thread: BackgroundThread,
    _service: PhantomData<fn() -> S>,
}

impl<S: Service> ServiceHost<S> {
    pub fn spawn(context: &Context) -> Result<Self> {
        Ok(Self::from_thread(
            Spawner::new(context).spawn::<ServiceActor<S>>(&())?,
        ))
    }

    pub(crate) fn from_thread(thread: BackgroundThread) -> Self {
        Self {
            thread,
            _service: PhantomData,
        }
    }

    /// Build a new instance on the host thread
    pub fn create(&self, args: &S::Args) -> Result<ServiceHandle<'_, S>> {
        let envelope: Envelope<&S::Args, ()> = Envelope::Create(args);
        let frame = self.thread.request(bincode::serialize(&envelope)?)?;
        let reply: Reply<InstanceId> = bincode::deserialize(&frame)?;
        let instance = reply.map_err(Error::Remote)?;
        debug!(thread = %self.thread.id(), instance, "service instance created");
        Ok(ServiceHandle {
            host: self,
            instance,
            finalized: false,
        })
    }

    /// Stop the host; every remaining instance is finalized on its thread
    pub fn close(&self, mode: Close) -> Result<()> {
        self.thread.close(mode)
    }

    pub fn thread(&self) -> &BackgroundThread {
        &self.thread
    }

    fn call(&self, instance: InstanceId, request: &S::Request) -> Result<S::Response> {
        let envelope: Envelope<(), &S::Request> = Envelope::Call { instance, request };
        let frame = self.thread.request(bincode::serialize(&envelope)?)?;
        let reply: Reply<S::Response> = bincode::deserialize(&frame)?;
        reply.map_err(Error::Remote)
    }

    fn cast(&self, instance: InstanceId, request: &S::Request) -> Result<()> {
        let envelope: Envelope<(), &S::Request> = Envelope::Cast { instance, request };
        self.thread.post(bincode::serialize(&envelope)?)
    }

    fn release(&self, instance: InstanceId) -> Result<()> {
        let envelope: Envelope<(), ()> = Envelope::Finalize(instance);
        self.thread.post(bincode::serialize(&envelope)?)
    }
}

impl<S: Service> fmt::Debug for ServiceHost<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHost").field("thread", &self.thread).finish()
    }
}

/// One remote instance. Dropping it finalizes the instance on the host.
pub struct ServiceHandle<'h, S: Service> {
    host: &'h ServiceHost<S>,
    instance: InstanceId,
    finalized: bool,
}

impl<S: Service> ServiceHandle<'_, S> {
    pub fn id(&self) -> InstanceId {
        self.instance
    }

    /// Send a request and wait for its response
    pub fn call(&self, request: &S::Request) -> Result<S::Response> {
        self.host.call(self.instance, request)
    }

    /// Send a request without waiting for it to be handled
    pub fn cast(&self, request: &S::Request) -> Result<()> {
        self.host.cast(self.instance, request)
    }

    /// Release the remote instance now
    pub fn finalize(mut self) -> Result<()> {
        self.finalized = true;
        self.host.release(self.instance)
    }
}

impl<S: Service> Drop for ServiceHandle<'_, S> {
    fn drop(&mut self) {
        if self.finalized || !self.host.thread.is_running() {
            return;
        }
        if let Err(err) = self.host.release(self.instance) {
            debug!(instance = self.instance, error = %err, "instance not finalized");
        }
    }
}

impl<S: Service> fmt::Debug for ServiceHandle<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("thread", &self.host.thread.id())
            .field("instance", &self.instance)
            .finish()
    }
}
