//! Task Handler Registry
//!
//! Maps handler names (e.g., "render_report") to executable Rust closures.
//! A task only carries the handler name and a JSON payload, so every member
//! that may run a task must register the same handlers under the same names.

use super::types::*;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by a handler. `Ok(None)` for plain executables,
/// `Ok(Some(value))` for computations that produce a result.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>>> + Send>>;

/// Type alias for a thread-safe, asynchronous task handler function.
///
/// The cancellation token fires when the owning pool is forcibly stopped;
/// long-running handlers should watch it and unwind.
pub type TaskHandlerFn = Arc<dyn Fn(Task, CancellationToken) -> HandlerFuture + Send + Sync>;

/// Registry holding the mapping between handler names and their implementation.
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskHandlerFn>,
}

impl TaskHandlerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new handler function under a specific name.
    ///
    /// # Arguments
    /// * `handler_name` - The string identifier for the task (e.g., "render_report").
    /// * `handler` - The closure/function that implements the task logic.
    pub fn register<F, Fut>(&self, handler_name: &str, handler: F)
    where
        F: Fn(Task, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<serde_json::Value>>> + Send + 'static,
    {
        // Box::pin erases the concrete future type so different async fns share one map.
        let handler_fn: TaskHandlerFn = Arc::new(move |task: Task, cancel: CancellationToken| {
            Box::pin(handler(task, cancel)) as HandlerFuture
        });

        self.handlers.insert(handler_name.to_string(), handler_fn);

        tracing::info!("Registered task handler: {}", handler_name);
    }

    /// Looks up the handler named by the task body.
    pub fn resolve(&self, body: &TaskBody) -> Result<TaskHandlerFn> {
        match self.handlers.get(&body.handler) {
            Some(handler_fn) => Ok(handler_fn.value().clone()),
            None => {
                let error = format!("Unknown task handler: {}", body.handler);
                tracing::error!("{}", error);
                Err(anyhow::anyhow!(error))
            }
        }
    }

    /// Looks up a handler by name and executes it with the provided task.
    ///
    /// # Returns
    /// * `Ok(value)` if the handler executed successfully.
    /// * `Err` if the handler failed or if no handler exists for the given name.
    pub async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<Option<serde_json::Value>> {
        let handler_fn = self.resolve(&task.body)?;
        tracing::debug!(
            "Executing task {} with handler '{}' (payload size: {} bytes)",
            task.id,
            task.body.handler,
            task.body.payload.to_string().len()
        );
        handler_fn(task.clone(), cancel).await
    }

    /// Returns a list of all registered handler names.
    pub fn list_handlers(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
