use thiserror::Error;

/// Failure taxonomy shared by the codec, the transport and the wiki facade.
#[derive(Debug, Error)]
pub enum WikiError {
    /// Network failure, timeout or a non-2xx HTTP status.
    #[error("XML-RPC transport error calling {method}: {message}")]
    Transport {
        method: String,
        status: Option<u16>,
        message: String,
    },

    /// The body was not a usable XML-RPC response.
    #[error("malformed XML-RPC response: {0}")]
    MalformedResponse(String),

    /// The server answered with its HTML login page instead of XML.
    #[error("server returned a login page for {method}; the session is missing or expired")]
    SessionExpired { method: String },

    /// The server reported an explicit XML-RPC fault.
    #[error("XML-RPC fault {code}: {message}")]
    Fault { code: i64, message: String },

    /// Local precondition failure, raised before any request is sent.
    #[error("{0}")]
    Validation(String),

    #[error("secret store error: {0}")]
    Store(String),
}

impl WikiError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for failures that happened on the wire rather than in the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault { .. })
    }
}

pub type Result<T, E = WikiError> = std::result::Result<T, E>;
