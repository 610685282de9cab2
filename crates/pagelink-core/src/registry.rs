use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{InvokeError, RegistryError};
use crate::wire::safe_value;

/// A locally invocable function exposed to the peer.
///
/// Synchronous and suspending functions share this one capability, so the
/// dispatcher never branches on handler kind.
#[async_trait]
pub trait ExposedFunction: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

struct SyncFn<F, R> {
    f: F,
    _marker: PhantomData<fn() -> R>,
}

#[async_trait]
impl<F, R> ExposedFunction for SyncFn<F, R>
where
    F: Fn(Vec<Value>) -> anyhow::Result<R> + Send + Sync,
    R: Serialize,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.f)(args).map(|r| safe_value(&r))
    }
}

struct AsyncFn<F, Fut, R> {
    f: F,
    _marker: PhantomData<fn() -> (Fut, R)>,
}

#[async_trait]
impl<F, Fut, R> ExposedFunction for AsyncFn<F, Fut, R>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send,
    R: Serialize + Send,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        let result = (self.f)(args).await?;
        Ok(safe_value(&result))
    }
}

/// Wrap a plain closure. Its return value is serialized with the safe policy.
pub fn sync_fn<F, R>(f: F) -> Arc<dyn ExposedFunction>
where
    F: Fn(Vec<Value>) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Serialize + 'static,
{
    Arc::new(SyncFn {
        f,
        _marker: PhantomData,
    })
}

/// Wrap a closure returning a future.
pub fn async_fn<F, Fut, R>(f: F) -> Arc<dyn ExposedFunction>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    Arc::new(AsyncFn {
        f,
        _marker: PhantomData,
    })
}

/// Name → function table. Registration is append-only.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn ExposedFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. A name can only be registered once; the first
    /// registration stays in place when a duplicate is rejected.
    pub fn register(
        &self,
        name: impl Into<String>,
        function: Arc<dyn ExposedFunction>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut functions = self.functions.write();
        if functions.contains_key(&name) {
            return Err(RegistryError::DuplicateFunction(name));
        }
        debug!(function = %name, "Exposed function");
        functions.insert(name, function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExposedFunction>> {
        self.functions.read().get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    /// All exposed names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.functions.read().len()
    }

    /// Run `name` with positional `args`.
    ///
    /// The request comes from an untrusted peer, so every failure (unknown
    /// name, returned error, panic) is reported as an [`InvokeError`].
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, InvokeError> {
        let function = self
            .get(name)
            .ok_or_else(|| InvokeError::UnknownFunction(name.to_string()))?;

        match AssertUnwindSafe(function.call(args)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(function = %name, error = %e, "Exposed function failed");
                Err(InvokeError::from_anyhow(&e))
            }
            Err(panic) => {
                let message = panic_message(&panic);
                warn!(function = %name, panic = %message, "Exposed function panicked");
                Err(InvokeError::Panicked {
                    function: name.to_string(),
                    message,
                })
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
