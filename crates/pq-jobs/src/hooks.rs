//! In-process lifecycle event bus.
//!
//! Listeners are registered per event kind or for all events. Delivery is
//! synchronous and at-most-once with no replay. A listener that returns an
//! error or panics is logged and counted; the remaining listeners still run
//! and the job outcome is unaffected.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use pq_common::{QueueEventKind, QueueEventPayload};
use tracing::{error, warn};

use crate::telemetry;

pub type Listener = Arc<dyn Fn(&QueueEventPayload) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned on registration, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct MetricsHookBus {
    next_id: AtomicU64,
    by_kind: RwLock<HashMap<QueueEventKind, Vec<(ListenerId, Listener)>>>,
    global: RwLock<Vec<(ListenerId, Listener)>>,
    failures: AtomicU64,
}

impl MetricsHookBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: QueueEventKind, listener: F) -> ListenerId
    where
        F: Fn(&QueueEventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for every event kind.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueEventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.global.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove one listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut global = self.global.write();
        let before = global.len();
        global.retain(|(lid, _)| *lid != id);
        if global.len() != before {
            return true;
        }
        drop(global);

        let mut by_kind = self.by_kind.write();
        for listeners in by_kind.values_mut() {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            if listeners.len() != before {
                return true;
            }
        }
        false
    }

    /// Remove every listener registered for `kind`. Global listeners stay.
    pub fn clear(&self, kind: QueueEventKind) {
        self.by_kind.write().remove(&kind);
    }

    pub fn clear_all(&self) {
        self.by_kind.write().clear();
        self.global.write().clear();
    }

    pub fn listener_count(&self, kind: QueueEventKind) -> usize {
        let specific = self.by_kind.read().get(&kind).map(Vec::len).unwrap_or(0);
        specific + self.global.read().len()
    }

    /// Listener errors and panics seen so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver `payload` to kind listeners, then global listeners. Returns
    /// the number of listeners that completed without error.
    pub fn emit(&self, payload: &QueueEventPayload) -> usize {
        // Snapshot so listeners may register or remove listeners themselves
        let listeners: Vec<(ListenerId, Listener)> = {
            let by_kind = self.by_kind.read();
            let global = self.global.read();
            by_kind
                .get(&payload.kind)
                .into_iter()
                .flatten()
                .chain(global.iter())
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        listener = ?id,
                        event = %payload.kind,
                        job_id = %payload.job_id,
                        error = %e,
                        "Hook listener failed"
                    );
                    self.record_failure(payload.kind);
                }
                Err(_) => {
                    error!(
                        listener = ?id,
                        event = %payload.kind,
                        job_id = %payload.job_id,
                        "Hook listener panicked"
                    );
                    self.record_failure(payload.kind);
                }
            }
        }
        delivered
    }

    fn record_failure(&self, kind: QueueEventKind) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        telemetry::record_hook_failure(kind.as_str());
    }
}
