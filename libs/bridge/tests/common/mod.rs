#![allow(dead_code)]

use native::{Backend, InprocBackend, RecordingBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zmq_bridge::{Actor, BackgroundThread, BridgeConfig, Context, Isolate, Module, Worker};

pub fn recording() -> Arc<RecordingBackend> {
    Arc::new(RecordingBackend::new(Arc::new(InprocBackend::new())))
}

pub fn context(recording: &Arc<RecordingBackend>) -> Context {
    let backend: Arc<dyn Backend> = recording.clone();
    Context::new(backend, BridgeConfig::default()).unwrap()
}

pub fn module(recording: &Arc<RecordingBackend>) -> Module {
    let backend: Arc<dyn Backend> = recording.clone();
    Module::with_config(backend, BridgeConfig::default()).unwrap()
}

/// Waits on its pipe until told to stop
pub struct Idle {
    worker: Worker,
}

impl Actor for Idle {
    type Args = ();
    type Runtime = ();

    fn init(_args: (), _runtime: (), worker: Worker) -> anyhow::Result<Self> {
        Ok(Self { worker })
    }

    fn run(self) -> anyhow::Result<()> {
        while self.worker.next()?.is_some() {}
        Ok(())
    }
}

/// Blocks on a socket nobody ever writes to, ignoring its pipe
pub struct Stuck {
    worker: Worker,
    address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StuckArgs {
    pub address: String,
}

impl Actor for Stuck {
    type Args = StuckArgs;
    type Runtime = ();

    fn init(args: StuckArgs, _runtime: (), worker: Worker) -> anyhow::Result<Self> {
        Ok(Self {
            worker,
            address: args.address,
        })
    }

    fn run(self) -> anyhow::Result<()> {
        let sink = self.worker.context().socket(native::SocketType::Pull)?;
        sink.bind(&self.address)?;
        sink.recv(0)?;
        Ok(())
    }
}

pub struct NoInterpreter;

impl Isolate for NoInterpreter {
    fn open() -> anyhow::Result<Self> {
        anyhow::bail!("interpreter could not be created")
    }
}

/// Fails before its initializer ever runs
pub struct Unopenable;

impl Actor for Unopenable {
    type Args = ();
    type Runtime = NoInterpreter;

    fn init(_args: (), _runtime: NoInterpreter, _worker: Worker) -> anyhow::Result<Self> {
        Ok(Self)
    }

    fn run(self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Rejects its arguments
pub struct Refuses;

impl Actor for Refuses {
    type Args = u32;
    type Runtime = ();

    fn init(limit: u32, _runtime: (), _worker: Worker) -> anyhow::Result<Self> {
        anyhow::bail!("limit {limit} is out of range")
    }

    fn run(self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Returns as soon as it starts, without reading its pipe
pub struct Quits;

impl Actor for Quits {
    type Args = ();
    type Runtime = ();

    fn init(_args: (), _runtime: (), _worker: Worker) -> anyhow::Result<Self> {
        Ok(Self)
    }

    fn run(self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Panics while building itself
pub struct PanicsInInit;

impl Actor for PanicsInInit {
    type Args = ();
    type Runtime = ();

    fn init(_args: (), _runtime: (), _worker: Worker) -> anyhow::Result<Self> {
        panic!("initializer blew up")
    }

    fn run(self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Echoes every frame back; the spawning side greets it with its own arguments
pub struct Greeter {
    worker: Worker,
}

impl Actor for Greeter {
    type Args = String;
    type Runtime = ();

    fn init(_greeting: String, _runtime: (), worker: Worker) -> anyhow::Result<Self> {
        Ok(Self { worker })
    }

    fn run(self) -> anyhow::Result<()> {
        while let Some(parts) = self.worker.next()? {
            for part in &parts {
                self.worker.pipe().send(part, 0)?;
            }
        }
        Ok(())
    }

    fn on_ready(thread: &BackgroundThread, greeting: &String) -> anyhow::Result<()> {
        thread.post(greeting)?;
        Ok(())
    }
}

/// Starts fine but is refused by its spawning side
pub struct Unwelcome {
    worker: Worker,
}

impl Actor for Unwelcome {
    type Args = String;
    type Runtime = ();

    fn init(_greeting: String, _runtime: (), worker: Worker) -> anyhow::Result<Self> {
        Ok(Self { worker })
    }

    fn run(self) -> anyhow::Result<()> {
        while self.worker.next()?.is_some() {}
        Ok(())
    }

    fn on_ready(_thread: &BackgroundThread, greeting: &String) -> anyhow::Result<()> {
        anyhow::bail!("greeting {greeting:?} refused")
    }
}
