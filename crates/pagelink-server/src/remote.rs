use serde_json::Value;

use crate::bridge::{Bridge, CallHandle};

/// A named function exposed by the peer.
#[derive(Clone)]
pub struct RemoteFunction {
    name: String,
    bridge: Bridge,
}

impl RemoteFunction {
    pub(crate) fn new(name: impl Into<String>, bridge: Bridge) -> Self {
        Self {
            name: name.into(),
            bridge,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> CallHandle {
        self.bridge.call(self.name.clone(), args).await
    }
}

impl std::fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFunction").field("name", &self.name).finish()
    }
}
