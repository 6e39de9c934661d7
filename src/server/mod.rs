//! The server: accepts connections, hosts sessions, dispatches calls.

mod dispatcher;
pub mod events;
mod session;

use chashmap::CHashMap;
use futures::channel::mpsc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::MessageType;
use crate::config::ServerConfig;
use crate::crypto::KeyPair;
use crate::error::{
    ConfigurationError, NetworkError, RemoteInvocationError, RemotingError,
};
use crate::guid::Guid;
use crate::message::GoodbyeMessage;
use crate::service::{AuthenticationProvider, ServiceRegistry};
use crate::transport::Listener;

use events::EventStub;
use session::SessionShared;

/// Records every exception caught during dispatch, for logging and for
/// interested subscribers.
#[derive(Clone)]
pub(crate) struct ErrorSink {
    count: Arc<AtomicUsize>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<RemoteInvocationError>>>>,
}

impl ErrorSink {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, error: RemoteInvocationError) {
        self.count.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| subscriber.unbounded_send(error.clone()).is_ok());
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RemoteInvocationError> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }
}

pub(crate) struct ServerShared {
    pub config: ServerConfig,
    pub key_pair: Option<Arc<KeyPair>>,
    pub auth: Option<Arc<dyn AuthenticationProvider>>,
    pub registry: Arc<ServiceRegistry>,
    pub events: Arc<EventStub>,
    pub sessions: CHashMap<Guid, Arc<SessionShared>>,
    pub errors: ErrorSink,
}

/// An RPC server hosting the services of a [ServiceRegistry].
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Build a server. An RSA key pair is generated when message
    /// encryption is configured. `auth` must be present when
    /// `authentication_required` is set.
    pub fn new(
        config: ServerConfig,
        registry: ServiceRegistry,
        auth: Option<Arc<dyn AuthenticationProvider>>,
    ) -> Result<Self, RemotingError> {
        if config.authentication_required && auth.is_none() {
            return Err(ConfigurationError::MissingAuthenticationProvider.into());
        }
        let key_pair = if config.message_encryption {
            Some(Arc::new(KeyPair::generate(config.key_size)?))
        } else {
            None
        };
        let events = Arc::new(EventStub::new(config.event_dispatch_mode));
        Ok(Self {
            shared: Arc::new(ServerShared {
                config,
                key_pair,
                auth,
                registry: Arc::new(registry),
                events,
                sessions: CHashMap::new(),
                errors: ErrorSink::new(),
            }),
        })
    }

    /// Accept connections from `listener` until it closes. Spawns a task
    /// per connection and, when configured, the idle-session reaper.
    pub async fn serve(&self, mut listener: impl Listener) -> Result<(), RemotingError> {
        tracing::info!(addr = %listener.local_addr(), "server listening");
        let reaper = self.shared.config.inactivity_timeout.map(|timeout| {
            async_std::task::spawn(reap_idle_sessions(Arc::clone(&self.shared), timeout))
        });

        let result = loop {
            match listener.accept().await {
                Ok(connection) => {
                    let server = Arc::clone(&self.shared);
                    async_std::task::spawn(async move {
                        if let Err(error) = session::run_connection(server, connection).await {
                            tracing::warn!(%error, "connection ended with error");
                        }
                    });
                }
                Err(NetworkError::Closed) => break Ok(()),
                Err(error) => break Err(error.into()),
            }
        };

        if let Some(reaper) = reaper {
            reaper.cancel().await;
        }
        result
    }

    /// Say goodbye to every connected client and drop their sessions.
    pub async fn shutdown(&self) {
        tracing::info!("server shutting down");
        let sessions = self.shared.sessions.clear();
        for (_, session) in sessions {
            let goodbye = GoodbyeMessage {
                session_id: session.session_id,
            };
            if let Ok(payload) = self.shared.config.serializer.to_bytes("goodbye", &goodbye) {
                let _ = session.send(MessageType::Goodbye, payload, None, false);
            }
            session.close();
        }
    }

    /// Fire `service.event` to all subscribed clients; returns how many
    /// subscribers were reached.
    pub fn fire_event(
        &self,
        service: &str,
        event: &str,
        arguments: Vec<serde_json::Value>,
    ) -> usize {
        self.shared.events.fire(service, event, arguments)
    }

    /// The multicast event table.
    pub fn events(&self) -> &EventStub {
        &self.shared.events
    }

    /// Number of exceptions caught during dispatch so far.
    pub fn error_count(&self) -> usize {
        self.shared.errors.count()
    }

    /// Stream of every exception caught during dispatch from now on.
    pub fn subscribe_errors(&self) -> mpsc::UnboundedReceiver<RemoteInvocationError> {
        self.shared.errors.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.shared.sessions.len())
            .field("errors", &self.shared.errors.count())
            .finish()
    }
}

/// Periodically close sessions that have been idle for longer than the
/// configured timeout, announcing `session_closed` first.
async fn reap_idle_sessions(server: Arc<ServerShared>, timeout: Duration) {
    loop {
        async_std::task::sleep(server.config.inactivity_sweep_interval).await;
        let reaped = Mutex::new(Vec::new());
        server.sessions.retain(|_, session| {
            if session.idle_for() >= timeout {
                reaped.lock().unwrap().push(Arc::clone(session));
                false
            } else {
                true
            }
        });
        for session in reaped.into_inner().unwrap() {
            tracing::info!(session_id = %session.session_id, "reaping idle session");
            let _ = session.send(MessageType::SessionClosed, Vec::new(), None, false);
            session.close();
        }
    }
}
