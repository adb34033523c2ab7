//! Named task handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::types::TaskError;

/// Executes one task kind.
///
/// Delivery is at-least-once: a handler may see the same arguments again after
/// a crash or a retry, so side effects must be idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, args: &JsonValue) -> Result<(), TaskError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered for task '{0}'")]
    DuplicateHandler(String),
}

/// Adapter turning an async closure into a [`TaskHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn handle(&self, args: &JsonValue) -> Result<(), TaskError> {
        (self.0)(args.clone()).await
    }
}

/// Task name → handler map, built once and injected into the queue server.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Result<(), RegistryError> {
        self.register_arc(name, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateHandler(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Register an async closure.
    ///
    /// ```ignore
    /// registry.register_fn("email", |args| async move {
    ///     send_mail(&args).await?;
    ///     Ok(())
    /// })?;
    /// ```
    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.register(name, FnHandler(handler))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _args: &JsonValue) -> Result<(), TaskError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn registered_handler_is_found_by_name() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register("count", Counting(calls.clone())).unwrap();

        let handler = registry.get("count").unwrap();
        handler.handle(&serde_json::json!({})).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("email", |_| async { Ok(()) }).unwrap();

        let err = registry
            .register_fn("email", |_| async { Ok(()) })
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler("email".into()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn closures_receive_args() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("check", |args| async move {
                if args["ok"] == true {
                    Ok(())
                } else {
                    Err(TaskError::new("Error", "not ok"))
                }
            })
            .unwrap();

        let handler = registry.get("check").unwrap();
        assert!(handler.handle(&serde_json::json!({"ok": true})).await.is_ok());
        let err = handler
            .handle(&serde_json::json!({"ok": false}))
            .await
            .unwrap_err();
        assert_eq!(err.message, "not ok");
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("b", |_| async { Ok(()) }).unwrap();
        registry.register_fn("a", |_| async { Ok(()) }).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
