//! Failure taxonomy for the runtime.
//!
//! Errors are grouped by kind rather than by module: transport problems,
//! malformed or unexpected frames, cryptographic failures, remote
//! invocation errors tunneled back from the peer, configuration mistakes
//! and lifecycle misuse. [RemotingError] is the umbrella returned from the
//! public entry points.

use crate::guid::Guid;

/// Transport level failures: connecting, accepting, sending and receiving
/// framed messages, and the timeouts bounding those operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to accept a connection")]
    Accept(#[source] std::io::Error),
    #[error("Failed to read from the connection")]
    Recv(#[source] std::io::Error),
    #[error("Failed to write to the connection")]
    Send(#[source] std::io::Error),
    #[error("The connection is closed")]
    Closed,
    #[error("Incoming frame of {size} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("Timed out waiting for the handshake to complete")]
    HandshakeTimeout,
    #[error("Timed out sending a message")]
    SendTimeout,
}

/// The peer sent something the protocol does not allow.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type tag {tag}")]
    UnknownMessageType { tag: u8 },
    #[error("Malformed wire frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("Initialization vector of {len} bytes, expected {expected}")]
    InvalidIvLength { len: usize, expected: usize },
    #[error("No pending call for key {key}")]
    UnmatchedCallKey { key: Guid },
}

/// Cryptographic failures and authentication rejections.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Message signature did not verify")]
    SignatureMismatch,
    #[error("Failed to decrypt message payload")]
    DecryptFailed,
    #[error("The server rejected the supplied credentials")]
    AuthenticationRejected,
    #[error("Timed out waiting for the authentication response")]
    AuthenticationTimeout,
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// A failure raised by (or on the way to) a remote method.
///
/// This is the only error that crosses the wire: the message, the remote
/// stack trace and the chain of causes all survive serialization. It is
/// also raised locally for invocation timeouts and for calls cancelled by
/// a disconnect.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteInvocationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Box<RemoteInvocationError>>,
}

impl RemoteInvocationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: RemoteInvocationError) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
            source: Some(Box::new(source)),
        }
    }

    pub fn service_not_registered(service: &str) -> Self {
        Self::new(format!("Service '{}' is not registered", service))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(format!("Method '{}' not found", method))
    }

    pub fn server_disconnected() -> Self {
        Self::new("Server Disconnected")
    }

    pub fn timeout(service: &str, method: &str) -> Self {
        Self::new(format!(
            "Invocation of '{}.{}' timed out",
            service, method
        ))
    }

    /// Capture an arbitrary handler error, preserving its chain of causes.
    pub fn capture(error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            message: error.to_string(),
            stack_trace: None,
            source: error.source().map(|source| Box::new(Self::capture(source))),
        }
    }
}

/// The runtime was configured in a way that cannot work.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("No channel was configured")]
    MissingChannel,
    #[error("The server requires authentication but no credentials were configured")]
    MissingCredentials,
    #[error("Authentication is required but no provider was configured")]
    MissingAuthenticationProvider,
}

/// An operation was used outside the lifecycle phase it belongs to.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("The client is not connected")]
    NotConnected,
    #[error("Call key {key} is already in flight")]
    DuplicateCallKey { key: Guid },
}

/// Umbrella error returned from the public entry points.
#[derive(Debug, thiserror::Error)]
pub enum RemotingError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Invocation(#[from] RemoteInvocationError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Serializer(#[from] crate::serializer::SerializerError),
}

impl From<crate::crypto::CryptoError> for RemotingError {
    fn from(error: crate::crypto::CryptoError) -> Self {
        RemotingError::Security(SecurityError::from(error))
    }
}
