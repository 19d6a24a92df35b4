//! Hotpatch event surface
//!
//! Components publish [`HotpatchEvent`]s on a shared [`EventBus`]; any number
//! of subscribers receive every event emitted after they subscribed.

use crate::metrics::{MetricsRegistry, METRICS};
use crate::outcome::PatchLayer;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// Events emitted by the hotpatch layers
#[derive(Debug, Clone, PartialEq)]
pub enum HotpatchEvent {
    ModelAttached { layer: PatchLayer, size: usize },
    ModelDetached { layer: PatchLayer },
    PatchApplied { layer: PatchLayer, name: String },
    PatchReverted { layer: PatchLayer, name: String },
    PatchConflict { existing: String, incoming: String, reason: String },
    IntegrityCheckFailed { layer: PatchLayer, detail: String },
    BackupRestored { layer: PatchLayer },
    ModelLoaded { path: PathBuf, size: usize },
    ModelSaved { path: PathBuf },
    RuleApplied { layer: PatchLayer, rule: String },
    StreamTerminated { layer: PatchLayer, chunk_index: usize },
    CacheHit { key: String },
    ValidationFailed { rule: String, reason: String },
    PresetSaved { name: String },
    PresetLoaded { name: String },
    OptimizationComplete { operation: String, succeeded: usize, total: usize },
    Error { layer: PatchLayer, code: i32, message: String },
}

/// Fan-out bus over crossbeam channels
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<HotpatchEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> Receiver<HotpatchEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to all live subscribers, dropping disconnected ones
    pub fn emit(&self, event: HotpatchEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Shared state handed to every component in place of global singletons
#[derive(Debug, Clone)]
pub struct HotpatchContext {
    pub events: Arc<EventBus>,
    pub metrics: MetricsRegistry,
}

impl HotpatchContext {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            events: Arc::new(EventBus::new()),
            metrics,
        }
    }

    /// Context with its own metrics registry
    pub fn isolated() -> Self {
        Self::new(MetricsRegistry::new())
    }

    pub fn emit(&self, event: HotpatchEvent) {
        self.events.emit(event);
    }
}

impl Default for HotpatchContext {
    fn default() -> Self {
        Self::new(METRICS.clone())
    }
}
