//! Handler registry.
//!
//! Maps a job-class name to a factory producing fresh handler
//! instances, plus the class's static metadata. Registration is
//! explicit; there is no reflective auto-discovery.

use crate::handler::{AnyHandler, HandlerMetadata, JobHandler};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

type HandlerFactory = Box<dyn Fn() -> Box<dyn AnyHandler> + Send + Sync>;

struct RegisteredHandler {
    metadata: HandlerMetadata,
    factory: HandlerFactory,
}

static GLOBAL: Lazy<Arc<HandlerRegistry>> = Lazy::new(|| Arc::new(HandlerRegistry::new()));

/// Returns the process-wide registry.
///
/// User code populates it at init time; the CLI hands it to the
/// dispatcher. Library users may instead build their own registry and
/// inject it through the dispatcher constructor.
pub fn global() -> Arc<HandlerRegistry> {
    GLOBAL.clone()
}

/// Registry of job handlers keyed by class name.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, RegisteredHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a handler type with an explicit factory.
    ///
    /// Re-registering a name replaces the previous entry.
    pub fn register<H, F>(&self, factory: F)
    where
        H: JobHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let entry = RegisteredHandler {
            metadata: HandlerMetadata::of::<H>(),
            factory: Box::new(move || Box::new(factory())),
        };
        self.entries.write().insert(H::NAME.to_string(), entry);
        info!(class = H::NAME, queue = H::QUEUE, "registered job handler");
    }

    /// Registers a handler type constructed via `Default`.
    pub fn register_default<H: JobHandler + Default>(&self) {
        self.register::<H, _>(H::default);
    }

    /// Produces a fresh handler instance and the class metadata.
    pub(crate) fn resolve(&self, class: &str) -> Option<(Box<dyn AnyHandler>, HandlerMetadata)> {
        let entries = self.entries.read();
        let entry = entries.get(class)?;
        Some(((entry.factory)(), entry.metadata.clone()))
    }

    /// Metadata for a class, if registered.
    pub fn metadata(&self, class: &str) -> Option<HandlerMetadata> {
        self.entries.read().get(class).map(|e| e.metadata.clone())
    }

    /// Queue a class routes to, if registered.
    pub fn queue_of(&self, class: &str) -> Option<String> {
        self.metadata(class).map(|m| m.queue)
    }

    /// True when a handler is registered under `class`.
    pub fn contains(&self, class: &str) -> bool {
        self.entries.read().contains_key(class)
    }

    /// Registered class names.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Removes every registration. Intended for tests.
    pub fn reset(&self) {
        self.entries.write().clear();
    }
}
