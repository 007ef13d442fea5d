//! Named async methods the leader serves to tabs

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

type RpcMethod = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Method table consulted for every `rpc-call`
#[derive(Default, Clone)]
pub struct RpcRouter {
    methods: HashMap<String, RpcMethod>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, replacing any previous method of that name
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |args: Value| method(args).boxed()));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, method);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Run a method. Errors are flattened to the message sent back to the tab.
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value, String> {
        let method = self
            .methods
            .get(name)
            .cloned()
            .ok_or_else(|| format!("Unknown method: {}", name))?;
        method(args).await.map_err(|e| format!("{:#}", e))
    }
}
