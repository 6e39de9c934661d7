//! Server and client configuration.

use std::time::Duration;

use crate::crypto::KeySize;
use crate::message::Credential;
use crate::serializer::Serializer;

/// How the server fires a multicast event to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDispatchMode {
    /// Hold the event table lock while firing so subscribers observe
    /// every invocation in registration order.
    PreserveOrder,
    /// Snapshot the subscriber list and fire without the lock.
    BestEffort,
}

impl Default for EventDispatchMode {
    fn default() -> Self {
        EventDispatchMode::PreserveOrder
    }
}

/// How the client runs delegate callbacks when the server sends `invoke`
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDispatchMode {
    /// Run callbacks one after another on the reader task.
    Serialized,
    /// Spawn a task per callback.
    Parallel,
}

impl Default for CallbackDispatchMode {
    fn default() -> Self {
        CallbackDispatchMode::Serialized
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub key_size: KeySize,
    pub message_encryption: bool,
    pub authentication_required: bool,
    /// Sessions idle longer than this are reaped; `None` disables the
    /// reaper.
    pub inactivity_timeout: Option<Duration>,
    /// How often the reaper looks for idle sessions.
    pub inactivity_sweep_interval: Duration,
    pub serializer: Serializer,
    pub event_dispatch_mode: EventDispatchMode,
    /// Name used when registering this server as an ambient default.
    pub unique_instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 9090,
            key_size: KeySize::default(),
            message_encryption: false,
            authentication_required: false,
            inactivity_timeout: None,
            inactivity_sweep_interval: Duration::from_secs(10),
            serializer: Serializer::default(),
            event_dispatch_mode: EventDispatchMode::default(),
            unique_instance_name: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_hostname: String,
    pub server_port: u16,
    pub key_size: KeySize,
    pub message_encryption: bool,
    pub credentials: Vec<Credential>,
    pub connection_timeout: Duration,
    pub authentication_timeout: Duration,
    pub invocation_timeout: Duration,
    pub send_timeout: Duration,
    /// Period of the empty keep-alive frame; `None` disables it.
    pub keep_alive_interval: Option<Duration>,
    pub serializer: Serializer,
    pub callback_dispatch_mode: CallbackDispatchMode,
    /// Name used when registering this client as an ambient default.
    pub unique_instance_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_hostname: "localhost".to_string(),
            server_port: 9090,
            key_size: KeySize::default(),
            message_encryption: false,
            credentials: Vec::new(),
            connection_timeout: Duration::from_secs(30),
            authentication_timeout: Duration::from_secs(30),
            invocation_timeout: Duration::from_secs(120),
            send_timeout: Duration::from_secs(10),
            keep_alive_interval: Some(Duration::from_secs(20)),
            serializer: Serializer::default(),
            callback_dispatch_mode: CallbackDispatchMode::default(),
            unique_instance_name: String::new(),
        }
    }
}
