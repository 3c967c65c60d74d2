//! # zmq-bridge
//!
//! Owned lifecycles for the native resources of a messaging library:
//! contexts, sockets, messages, pollers, timer sets and background actor
//! threads.
//!
//! Every native handle is held by exactly one wrapper and released exactly
//! once, whether by an explicit close, by `Drop`, or by the context-wide sweep
//! that runs at termination. Termination order is fixed: the context is shut
//! down first, background threads are torn down next, remaining sockets are
//! force-closed after that and the native context is terminated last.
//!
//! ```no_run
//! use std::sync::Arc;
//! use native::{InprocBackend, SocketType};
//! use zmq_bridge::{BridgeConfig, Module};
//!
//! # fn main() -> zmq_bridge::Result<()> {
//! let module = Module::with_config(Arc::new(InprocBackend::new()), BridgeConfig::default())?;
//! let socket = module.context().socket(SocketType::Pair)?;
//! socket.bind("inproc://example")?;
//! module.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod message;
pub mod module;
pub mod options;
pub mod poller;
pub mod registry;
pub mod socket;
pub mod timers;

pub use actor::{
    Actor, BackgroundThread, Close, InstanceId, Isolate, Proxy, ProxyArgs, ProxyEndpoint, Service,
    ServiceActor, ServiceHandle, ServiceHost, SpawnState, Spawner, ThreadId, Worker, TERM,
};
pub use config::{BridgeConfig, ContextConfig};
pub use context::Context;
pub use error::{Error, Result};
pub use handle::{Handle, ReleasePolicy, Resource};
pub use message::Message;
pub use module::Module;
pub use options::{OptionKind, OptionValue};
pub use poller::{Poller, Wait};
pub use registry::{Registry, ResourceKind, Sweepable};
pub use socket::{Received, Socket};
pub use timers::{Timer, Timers};

pub use native::{consts, Errno, SocketType};
