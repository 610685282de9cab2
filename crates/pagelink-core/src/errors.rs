use crate::wire::PeerError;

/// Setup-time failures. Never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("already exposed function with name \"{0}\"")]
    DuplicateFunction(String),
}

/// Failures while running a locally exposed function on behalf of the peer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("{text}")]
    Failed { text: String, traceback: String },
    #[error("function {function} panicked: {message}")]
    Panicked { function: String, message: String },
}

/// Problems with an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Not valid JSON. Ends the owning connection's receive loop.
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),
    /// Valid JSON of an unknown shape. Logged and skipped.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl DispatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

impl InvokeError {
    /// Capture an application error with its full cause chain.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::Failed {
            text: err.to_string(),
            traceback: format!("{err:?}"),
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownFunction(_) => "unknown_function",
            Self::Failed { .. } => "failed",
            Self::Panicked { .. } => "panicked",
        }
    }

    /// Wire representation sent back to the peer.
    pub fn to_peer_error(&self) -> PeerError {
        match self {
            Self::UnknownFunction(name) => PeerError {
                error_text: self.to_string(),
                error_traceback: format!("no function named \"{name}\" is exposed"),
            },
            Self::Failed { text, traceback } => PeerError {
                error_text: text.clone(),
                error_traceback: traceback.clone(),
            },
            Self::Panicked { function, message } => PeerError {
                error_text: self.to_string(),
                error_traceback: format!("panic in {function}: {message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_message_names_function() {
        let err = RegistryError::DuplicateFunction("py_random".into());
        assert_eq!(err.to_string(), "already exposed function with name \"py_random\"");
    }

    #[test]
    fn anyhow_chain_lands_in_traceback() {
        let err = anyhow::anyhow!("disk full").context("saving settings");
        let invoke = InvokeError::from_anyhow(&err);
        let peer = invoke.to_peer_error();
        assert_eq!(peer.error_text, "saving settings");
        assert!(peer.error_traceback.contains("disk full"));
    }

    #[test]
    fn unknown_function_is_well_formed() {
        let peer = InvokeError::UnknownFunction("nope".into()).to_peer_error();
        assert_eq!(peer.error_text, "unknown function: nope");
        assert!(!peer.error_traceback.is_empty());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(InvokeError::UnknownFunction("x".into()).error_kind(), "unknown_function");
        assert_eq!(
            InvokeError::Panicked { function: "f".into(), message: "boom".into() }.error_kind(),
            "panicked"
        );
    }
}
