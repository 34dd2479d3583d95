//! Handler registry: the explicit mapping from task type to handler.
//!
//! Registration is the trust boundary. A task type that was never registered
//! cannot execute anything, no matter what gets written into the store — the
//! registry never discovers handlers from the database or the filesystem.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::task::Task;

/// Boxed future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A registered handler. Receives the claimed task and a cancellation token
/// that fires on forced engine stop; honoring it is cooperative.
pub type Handler = Arc<dyn Fn(Task, CancellationToken) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    handler: Handler,
    description: String,
    version: String,
}

/// Metadata about a registration, for listings and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    pub task_type: String,
    pub description: String,
    pub version: String,
}

/// Thread-safe `task_type → handler` map.
///
/// Intended use: construct one per process (or take [`HandlerRegistry::global`]),
/// register everything at startup, pass it to each [`WorkerEngine`].
///
/// [`WorkerEngine`]: crate::engine::WorkerEngine
#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, HandlerEntry>>,
}

lazy_static! {
    static ref GLOBAL_REGISTRY: HandlerRegistry = HandlerRegistry::new();
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide convenience instance. Tests that use it should call
    /// [`HandlerRegistry::clear`] between cases.
    pub fn global() -> &'static HandlerRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register a handler for `task_type`.
    ///
    /// Fails with [`QueueError::HandlerAlreadyRegistered`] when the type is
    /// taken and `allow_override` is false; an empty type is rejected.
    pub fn register<F, Fut>(
        &self,
        task_type: &str,
        handler: F,
        description: &str,
        version: &str,
        allow_override: bool,
    ) -> Result<(), QueueError>
    where
        F: Fn(Task, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if task_type.trim().is_empty() {
            return Err(QueueError::Validation(
                "handler task type must be non-empty".into(),
            ));
        }

        let boxed: Handler = Arc::new(move |task, cancel| Box::pin(handler(task, cancel)));
        let entry = HandlerEntry {
            handler: boxed,
            description: description.to_string(),
            version: version.to_string(),
        };

        let mut entries = self.entries.write().expect("registry lock poisoned");
        if !allow_override && entries.contains_key(task_type) {
            return Err(QueueError::HandlerAlreadyRegistered {
                task_type: task_type.to_string(),
            });
        }
        entries.insert(task_type.to_string(), entry);
        Ok(())
    }

    /// Remove a registration. Returns whether anything was removed.
    pub fn unregister(&self, task_type: &str) -> bool {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(task_type)
            .is_some()
    }

    /// Look up the handler for `task_type`. The error message lists known
    /// types to make misconfiguration debuggable.
    pub fn get(&self, task_type: &str) -> Result<Handler, QueueError> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries
            .get(task_type)
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| QueueError::HandlerNotRegistered {
                task_type: task_type.to_string(),
                known: {
                    let mut known: Vec<String> = entries.keys().cloned().collect();
                    known.sort();
                    known
                },
            })
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(task_type)
    }

    /// Raise unless the task's type has a registered handler.
    pub fn validate(&self, task: &Task) -> Result<(), QueueError> {
        self.get(&task.task_type).map(|_| ())
    }

    /// Sorted list of registered types.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Registration metadata, sorted by type.
    pub fn handlers(&self) -> Vec<HandlerInfo> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut infos: Vec<HandlerInfo> = entries
            .iter()
            .map(|(task_type, entry)| HandlerInfo {
                task_type: task_type.clone(),
                description: entry.description.clone(),
                version: entry.version.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        infos
    }

    /// Drop every registration. For tests using the global instance.
    pub fn clear(&self) {
        self.entries.write().expect("registry lock poisoned").clear();
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.registered_types())
            .finish()
    }
}
