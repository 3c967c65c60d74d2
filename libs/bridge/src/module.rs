//! Process-wide bridge lifecycle
//!
//! A [`Module`] owns the shared context. Finalizing it shuts the context down,
//! tears down every background thread, force-releases the remaining sockets
//! and terminates the native context last.

use crate::actor::{Actor, BackgroundThread, Proxy, ProxyArgs, Service, ServiceHost, Spawner};
use crate::config::BridgeConfig;
use crate::context::Context;
use crate::error::Result;
use native::Backend;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Module {
    context: Context,
}

impl Module {
    /// Initialise from the process environment
    pub fn init(backend: Arc<dyn Backend>) -> Result<Self> {
        Self::with_config(backend, BridgeConfig::from_env()?)
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: BridgeConfig) -> Result<Self> {
        let context = Context::new(backend, config)?;
        info!(ctx = %context.raw(), "bridge module initialised");
        Ok(Self { context })
    }

    /// The shared context every resource of this module is created against
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn spawner(&self) -> Spawner {
        Spawner::new(&self.context)
    }

    pub fn spawn<A: Actor>(&self, args: &A::Args) -> Result<BackgroundThread> {
        self.spawner().spawn::<A>(args)
    }

    /// Start a thread hosting instances of `S`
    pub fn service<S: Service>(&self) -> Result<ServiceHost<S>> {
        ServiceHost::spawn(&self.context)
    }

    pub fn proxy(&self, args: &ProxyArgs) -> Result<Proxy> {
        Proxy::spawn(&self.context, args)
    }

    /// Shut down, join threads, release sockets, terminate. Idempotent.
    pub fn finalize(&self) -> Result<()> {
        if self.context.is_terminated() {
            return Ok(());
        }
        self.context.terminate()?;
        info!(ctx = %self.context.raw(), "bridge module finalized");
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.context.is_terminated()
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            warn!(error = %err, "bridge module finalization failed");
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("context", &self.context).finish()
    }
}
