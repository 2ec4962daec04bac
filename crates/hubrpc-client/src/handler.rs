//! Handler Registry
//!
//! The mapping from method name to the async function that serves it. The
//! set is populated before `connect`; the names are advertised in REGISTER
//! and the map is never mutated afterwards, so dispatch reads it without a
//! lock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hubrpc_common::protocol::{CallContext, Result};
use serde_json::Value;

/// The boxed future a handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A registered method implementation: `(params, context) → result or error`.
///
/// Handlers are responsible for validating `params`; the fabric frames them
/// verbatim.
pub type Handler = Arc<dyn Fn(Value, CallContext) -> HandlerFuture + Send + Sync>;

/// Unique mapping `method name → handler`.
///
/// # Example
///
/// ```
/// use hubrpc_client::HandlerRegistry;
/// use serde_json::json;
///
/// let mut handlers = HandlerRegistry::new();
/// handlers.register("echo", |params, _ctx| async move { Ok(params) });
/// handlers.register("add", |params, _ctx| async move {
///     let a = params["a"].as_i64().unwrap_or(0);
///     let b = params["b"].as_i64().unwrap_or(0);
///     Ok(json!({"sum": a + b}))
/// });
/// assert_eq!(handlers.method_names(), vec!["add", "echo"]);
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler
    /// with the same name.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(
            name.into(),
            Arc::new(move |params, ctx| Box::pin(handler(params, ctx))),
        );
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Advertised method names, sorted for stable REGISTER frames.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
