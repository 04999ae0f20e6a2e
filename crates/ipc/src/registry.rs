use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::Connection;

/// Type-erased method handler: raw arguments in, raw return value or error message out.
pub type MethodHandler =
    Arc<dyn Fn(Bytes, Connection) -> BoxFuture<'static, Result<Bytes, String>> + Send + Sync>;

/// Methods a connection serves to its peer, by name.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, MethodHandler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler.
    ///
    /// Arguments are decoded from MessagePack before the handler runs and the
    /// return value is encoded afterwards. A decode failure is reported to the
    /// caller as an error reply.
    pub fn register<A, R, F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let method = method.into();
        let name = method.clone();
        let handler = Arc::new(handler);
        let erased: MethodHandler = Arc::new(move |raw: Bytes, conn: Connection| {
            let handler = Arc::clone(&handler);
            let name = name.clone();
            Box::pin(async move {
                let args: A = rmp_serde::from_slice(&raw)
                    .map_err(|e| format!("invalid arguments for '{name}': {e}"))?;
                let value = handler(args, conn).await?;
                rmp_serde::to_vec(&value)
                    .map(Bytes::from)
                    .map_err(|e| format!("failed to encode result of '{name}': {e}"))
            })
        });
        self.handlers.insert(method, erased);
    }

    pub fn with<A, R, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        self.register(method, handler);
        self
    }

    pub fn get(&self, method: &str) -> Option<MethodHandler> {
        self.handlers.get(method).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
