//! Live resource registry
//!
//! Tracks every wrapper created against a context so teardown can force-close
//! whatever user code leaked. Entries are weak: the registry never keeps a
//! resource alive, and an entry whose owner is gone is skipped.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Thread,
    Poller,
    Timers,
    Socket,
    Message,
}

impl ResourceKind {
    /// Order in which kinds are force-released before the context terminates.
    /// Threads go first so no worker touches a socket being torn down.
    pub const SWEEP_ORDER: [ResourceKind; 4] = [
        ResourceKind::Thread,
        ResourceKind::Poller,
        ResourceKind::Timers,
        ResourceKind::Socket,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Thread => "background thread",
            ResourceKind::Poller => "poller",
            ResourceKind::Timers => "timers",
            ResourceKind::Socket => "socket",
            ResourceKind::Message => "message",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resource the registry can force-release
pub trait Sweepable: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn is_live(&self) -> bool;

    /// Release now. Returns `false` when something else released it first.
    fn sweep(&self) -> bool;
}

/// Registration token, used to unregister on drop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ResourceKind, BTreeMap<RegistrationId, Weak<dyn Sweepable>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource: Weak<dyn Sweepable>, kind: ResourceKind) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().entry(kind).or_default().insert(id, resource);
        id
    }

    pub fn unregister(&self, kind: ResourceKind, id: RegistrationId) {
        if let Some(entries) = self.entries.lock().get_mut(&kind) {
            entries.remove(&id);
        }
    }

    /// Number of registered resources of `kind` that are still live
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.snapshot(kind).iter().filter(|r| r.is_live()).count()
    }

    /// Force-release every live resource of `kind`. Never fails.
    pub fn sweep(&self, kind: ResourceKind) -> usize {
        // Released outside the lock: a sweep may drop wrappers that unregister.
        let live = self.snapshot(kind);
        let released = live.iter().filter(|resource| resource.sweep()).count();
        if released > 0 {
            debug!(%kind, released, "swept");
        }
        released
    }

    /// Sweep every kind in [`ResourceKind::SWEEP_ORDER`]
    pub fn sweep_all(&self) -> usize {
        ResourceKind::SWEEP_ORDER.iter().map(|kind| self.sweep(*kind)).sum()
    }

    fn snapshot(&self, kind: ResourceKind) -> Vec<Arc<dyn Sweepable>> {
        let mut guard = self.entries.lock();
        let Some(entries) = guard.get_mut(&kind) else {
            return Vec::new();
        };
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.values().filter_map(Weak::upgrade).collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        let mut map = f.debug_map();
        for (kind, items) in entries.iter() {
            map.entry(kind, &items.len());
        }
        map.finish()
    }
}
