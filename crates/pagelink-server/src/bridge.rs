//! The application-facing handle tying registry, correlator, and connections
//! together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use pagelink_core::{
    safe_json, CallCorrelator, CallId, CallResult, ExposedFunction, FunctionRegistry, PageKey,
    PeerError, RegistryError,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ServerConfig};
use crate::connection::Connection;
use crate::dispatcher::run_receive_loop;
use crate::manager::{CloseHandler, ConnectionManager};
use crate::remote::RemoteFunction;

struct BridgeInner {
    config: ServerConfig,
    registry: FunctionRegistry,
    correlator: CallCorrelator,
    manager: ConnectionManager,
    remote_names: RwLock<BTreeSet<String>>,
    cancel: CancellationToken,
}

/// Cheap to clone; every clone refers to the same bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

#[derive(Default)]
pub struct BridgeBuilder {
    config: ServerConfig,
    close_handler: Option<Arc<dyn CloseHandler>>,
    remote_names: BTreeSet<String>,
}

impl BridgeBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn close_handler(mut self, handler: impl CloseHandler + 'static) -> Self {
        self.close_handler = Some(Arc::new(handler));
        self
    }

    /// Names of functions the peer is known to expose.
    pub fn remote_functions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remote_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<Bridge, ConfigError> {
        self.config.validate()?;
        let manager = ConnectionManager::new(
            self.config.send_retry,
            self.config.broadcast,
            self.close_handler,
        );
        Ok(Bridge {
            inner: Arc::new(BridgeInner {
                config: self.config,
                registry: FunctionRegistry::new(),
                correlator: CallCorrelator::new(),
                manager,
                remote_names: RwLock::new(self.remote_names),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// Make `function` invocable by the peer under `name`.
    pub fn expose(
        &self,
        name: impl Into<String>,
        function: Arc<dyn ExposedFunction>,
    ) -> Result<(), RegistryError> {
        self.inner.registry.register(name, function)
    }

    pub fn exposed_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Call `target` on every connected peer (per the broadcast policy).
    ///
    /// With no peer connected the call is buffered and replayed when the first
    /// connection of each page attaches.
    pub async fn call(&self, target: impl Into<String>, args: Vec<Value>) -> CallHandle {
        self.send_call(None, target.into(), args).await
    }

    /// Like [`Bridge::call`] but only to connections of `page`.
    pub async fn call_page(
        &self,
        page: &PageKey,
        target: impl Into<String>,
        args: Vec<Value>,
    ) -> CallHandle {
        self.send_call(Some(page), target.into(), args).await
    }

    async fn send_call(&self, page: Option<&PageKey>, target: String, args: Vec<Value>) -> CallHandle {
        let correlator = &self.inner.correlator;
        let manager = &self.inner.manager;

        let call = correlator.create_call(target, args);
        correlator.track(call.id);

        if !manager.buffer_if_disconnected(&call) {
            let delivered = manager.broadcast(page, safe_json(&call)).await;
            tracing::debug!(call_id = %call.id, target = %call.name, delivered, "Call sent");
        }

        CallHandle {
            id: call.id,
            bridge: self.clone(),
            timeout: self.inner.config.result_timeout(),
        }
    }

    /// Handle to a declared peer function.
    pub fn remote(&self, name: &str) -> Option<RemoteFunction> {
        self.inner
            .remote_names
            .read()
            .contains(name)
            .then(|| RemoteFunction::new(name, self.clone()))
    }

    pub fn declare_remote(&self, name: impl Into<String>) {
        self.inner.remote_names.write().insert(name.into());
    }

    pub fn remote_names(&self) -> Vec<String> {
        self.inner.remote_names.read().iter().cloned().collect()
    }

    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.inner.manager.wait_for_connection(timeout).await
    }

    /// Open a connection for `page` without attaching it. The receiver feeds
    /// the socket writer, which should be running before
    /// [`Bridge::serve_connection`] replays buffered calls into it.
    pub fn open_connection(&self, page: PageKey) -> (Arc<Connection>, mpsc::Receiver<String>) {
        Connection::open(page, self.inner.config.max_send_queue)
    }

    /// Attach `conn` and run its receive loop over `frames` until it closes.
    pub async fn serve_connection<S>(&self, conn: Arc<Connection>, frames: S)
    where
        S: Stream<Item = String>,
    {
        self.inner.manager.add(Arc::clone(&conn)).await;
        run_receive_loop(self.clone(), conn, frames).await;
    }

    /// Drop every connection and pending call, and stop background tasks.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.manager.clear();
        self.inner.correlator.clear();
        tracing::info!("Bridge shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.inner.registry
    }

    pub fn correlator(&self) -> &CallCorrelator {
        &self.inner.correlator
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }
}

/// An outbound call in flight. Consume its result either by waiting or by
/// attaching callbacks, not both.
pub struct CallHandle {
    id: CallId,
    bridge: Bridge,
    timeout: Duration,
}

impl CallHandle {
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Wait for the peer's result, up to the configured result timeout.
    pub async fn wait(&self) -> Option<CallResult> {
        self.wait_for(self.timeout).await
    }

    pub async fn wait_for(&self, timeout: Duration) -> Option<CallResult> {
        self.bridge.correlator().await_result(self.id, timeout).await
    }

    /// The result value, or `None` on timeout or a peer error.
    pub async fn value(&self) -> Option<Value> {
        match self.wait().await? {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(call_id = %self.id, error = %err, "Peer returned an error");
                None
            }
        }
    }

    /// Run `on_ok` with the result. A peer error stays stored for polling.
    pub fn then<F>(&self, on_ok: F) -> bool
    where
        F: FnOnce(Value) + Send + Sync + 'static,
    {
        self.bridge
            .correlator()
            .register_callback(self.id, Box::new(on_ok), None)
    }

    pub fn then_or_else<F, E>(&self, on_ok: F, on_err: E) -> bool
    where
        F: FnOnce(Value) + Send + Sync + 'static,
        E: FnOnce(PeerError) + Send + Sync + 'static,
    {
        self.bridge
            .correlator()
            .register_callback(self.id, Box::new(on_ok), Some(Box::new(on_err)))
    }
}
