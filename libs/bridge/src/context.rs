//! Messaging context
//!
//! Every socket, poller, timer set and background thread is created against
//! a [`Context`] and registered with it. Terminating the context shuts it
//! down, force-releases whatever is still registered (threads first) and only
//! then terminates the native context.

use crate::config::BridgeConfig;
use crate::error::{native, Error, Result};
use crate::message::Message;
use crate::poller::Poller;
use crate::registry::{Registry, ResourceKind};
use crate::socket::Socket;
use crate::timers::Timers;
use native::{Backend, RawContext, SocketType};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    backend: Arc<dyn Backend>,
    raw: RawContext,
    config: BridgeConfig,
    registry: Registry,
    shut_down: AtomicBool,
    terminated: AtomicBool,
    teardown: Mutex<()>,
}

impl Context {
    /// Create a native context and apply the configured tuning
    pub fn new(backend: Arc<dyn Backend>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let raw = backend.ctx_new().map_err(native("ctx_new"))?;
        for (option, value) in config.context.options() {
            if let Err(err) = backend.ctx_set(raw, option, value) {
                if let Err(term) = backend.ctx_term(raw) {
                    warn!(ctx = %raw, error = %term, "failed to terminate half-configured context");
                }
                return Err(Error::from_native("ctx_set", err));
            }
        }
        debug!(ctx = %raw, "context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                backend,
                raw,
                config,
                registry: Registry::new(),
                shut_down: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                teardown: Mutex::new(()),
            }),
        })
    }

    /// A fresh context on the same backend with the same configuration
    pub fn child(&self) -> Result<Context> {
        Context::new(self.inner.backend.clone(), self.inner.config.clone())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn raw(&self) -> RawContext {
        self.inner.raw
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn socket(&self, kind: SocketType) -> Result<Socket> {
        self.ensure_open()?;
        Socket::new(self, kind)
    }

    pub fn poller(&self) -> Result<Poller> {
        self.ensure_open()?;
        Poller::new(self)
    }

    pub fn timers(&self) -> Result<Timers> {
        self.ensure_open()?;
        Timers::new(self)
    }

    pub fn message(&self, data: &[u8]) -> Result<Message> {
        Message::from_bytes(self, data)
    }

    /// Read a native context option
    pub fn get(&self, option: i32) -> Result<i32> {
        self.ensure_open()?;
        self.inner
            .backend
            .ctx_get(self.inner.raw, option)
            .map_err(native("ctx_get"))
    }

    /// Set a native context option
    pub fn set(&self, option: i32, value: i32) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .backend
            .ctx_set(self.inner.raw, option, value)
            .map_err(native("ctx_set"))
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Make every blocked and future operation on this context fail with
    /// [`Error::Terminated`]. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }

    /// Force-release every registered resource, threads first
    pub fn release_all(&self) -> usize {
        self.inner.registry.sweep_all()
    }

    /// Shut down, release everything still registered and terminate the
    /// native context. Idempotent.
    pub fn terminate(&self) -> Result<()> {
        self.inner.terminate()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::Closed("context"));
        }
        Ok(())
    }
}

impl ContextInner {
    fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(ctx = %self.raw, "shutting down context");
        self.backend.ctx_shutdown(self.raw).map_err(native("ctx_shutdown"))
    }

    fn terminate(&self) -> Result<()> {
        let _teardown = self.teardown.lock();
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.shutdown() {
            warn!(ctx = %self.raw, error = %err, "context shutdown failed");
        }
        // Workers must be gone before their sockets and the context go.
        let threads = self.registry.sweep(ResourceKind::Thread);
        let rest: usize = ResourceKind::SWEEP_ORDER[1..]
            .iter()
            .map(|kind| self.registry.sweep(*kind))
            .sum();
        self.backend.ctx_term(self.raw).map_err(native("ctx_term"))?;
        self.terminated.store(true, Ordering::SeqCst);
        debug!(ctx = %self.raw, threads, released = rest, "context terminated");
        Ok(())
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            warn!(ctx = %self.raw, error = %err, "context teardown failed");
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("raw", &self.inner.raw)
            .field("shut_down", &self.is_shut_down())
            .field("terminated", &self.is_terminated())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use native::{consts, Errno, InprocBackend, RecordingBackend};

    fn recording() -> (Arc<RecordingBackend>, Arc<dyn Backend>) {
        let recording = Arc::new(RecordingBackend::new(Arc::new(InprocBackend::new())));
        let backend: Arc<dyn Backend> = recording.clone();
        (recording, backend)
    }

    #[test]
    fn tuning_is_applied_at_creation() {
        let (_, backend) = recording();
        let config = BridgeConfig {
            context: ContextConfig {
                io_threads: Some(3),
                ..ContextConfig::default()
            },
            ..BridgeConfig::default()
        };
        let ctx = Context::new(backend, config).unwrap();
        assert_eq!(ctx.get(consts::IO_THREADS).unwrap(), 3);
        assert_eq!(ctx.get(consts::THREAD_PRIORITY).unwrap(), consts::THREAD_PRIORITY_DFLT);
    }

    #[test]
    fn failed_tuning_terminates_the_context() {
        let (recording, backend) = recording();
        recording.fail_next("ctx_set", Errno::EINVAL);
        let config = BridgeConfig {
            context: ContextConfig {
                io_threads: Some(2),
                ..ContextConfig::default()
            },
            ..BridgeConfig::default()
        };
        assert!(Context::new(backend, config).is_err());
        assert_eq!(recording.open_contexts(), 0);
    }

    #[test]
    fn terminate_closes_leaked_sockets_then_terminates() {
        let (recording, backend) = recording();
        let ctx = Context::new(backend, BridgeConfig::default()).unwrap();
        let socket = ctx.socket(SocketType::Pair).unwrap();

        ctx.terminate().unwrap();
        ctx.terminate().unwrap();

        assert!(socket.is_closed());
        assert_eq!(recording.open_sockets(), 0);
        assert_eq!(recording.count("ctx_term"), 1);
        assert_eq!(recording.calls().last().map(|c| c.op), Some("ctx_term"));
        assert!(matches!(ctx.socket(SocketType::Pair), Err(Error::Closed("context"))));
    }

    #[test]
    fn dropping_the_last_clone_terminates() {
        let (recording, backend) = recording();
        let ctx = Context::new(backend, BridgeConfig::default()).unwrap();
        let clone = ctx.clone();
        drop(ctx);
        assert_eq!(recording.count("ctx_term"), 0);
        drop(clone);
        assert_eq!(recording.count("ctx_term"), 1);
        assert_eq!(recording.open_contexts(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (recording, backend) = recording();
        let ctx = Context::new(backend, BridgeConfig::default()).unwrap();
        ctx.shutdown().unwrap();
        ctx.shutdown().unwrap();
        assert_eq!(recording.count("ctx_shutdown"), 1);
        assert!(ctx.is_shut_down());
    }
}
