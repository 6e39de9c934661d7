//! The client engine: connect, invoke, receive callbacks, disconnect.

mod delegates;
mod pending;

use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::codec::{self, MessageType, WireMessage};
use crate::config::{CallbackDispatchMode, ClientConfig};
use crate::crypto::{self, EncryptedSecret, KeyPair, SignedMessageData};
use crate::error::{
    NetworkError, ProtocolError, RemoteInvocationError, RemotingError, SecurityError,
};
use crate::guid::Guid;
use crate::message::{
    AuthenticationRequestMessage, AuthenticationResponseMessage, GoodbyeMessage, Identity,
    MethodCallMessage, MethodCallResultMessage, Parameter, RemoteDelegateInvocationMessage,
};
use crate::serializer::Serializer;
use crate::transport::{BoxConnectionSink, Connection};

pub use delegates::Delegate;
use delegates::DelegateRegistry;
use pending::PendingCalls;

/// An argument to a remote call.
#[derive(Clone)]
pub enum Arg {
    Value {
        name: String,
        type_name: String,
        value: serde_json::Value,
    },
    /// Replaced on the wire by a handler key; the server calls back
    /// through it.
    Delegate {
        name: String,
        type_name: String,
        callback: Delegate,
    },
}

impl Arg {
    pub fn value(
        name: impl Into<String>,
        type_name: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Arg::Value {
            name: name.into(),
            type_name: type_name.into(),
            value,
        }
    }

    pub fn delegate(
        name: impl Into<String>,
        type_name: impl Into<String>,
        callback: Delegate,
    ) -> Self {
        Arg::Delegate {
            name: name.into(),
            type_name: type_name.into(),
            callback,
        }
    }
}

impl std::fmt::Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Value { name, value, .. } => {
                f.debug_struct("Value").field("name", name).field("value", value).finish()
            }
            Arg::Delegate { name, .. } => f.debug_struct("Delegate").field("name", name).finish(),
        }
    }
}

/// Handle for a live event subscription, needed to unsubscribe.
#[derive(Debug, Clone)]
pub struct EventSubscription {
    pub service: String,
    pub event: String,
    pub handler_key: Guid,
}

struct ClientInner {
    config: ClientConfig,
    session_id: Guid,
    /// `Some` iff message encryption is on; equals the session id.
    secret: Option<Guid>,
    server_public_key: Option<Vec<u8>>,
    identity: Option<Identity>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingCalls,
    delegates: DelegateRegistry,
    connected: AtomicBool,
    torn_down: AtomicBool,
    goodbye_ack: Mutex<Option<oneshot::Sender<()>>>,
    disconnect_waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl ClientInner {
    fn serializer(&self) -> Serializer {
        self.config.serializer
    }

    fn send_frame(&self, frame: Vec<u8>) -> Result<(), RemotingError> {
        self.outgoing
            .unbounded_send(frame)
            .map_err(|_| NetworkError::Closed.into())
    }

    fn send_sealed(
        &self,
        message_type: MessageType,
        payload: Vec<u8>,
        unique_call_key: Option<Guid>,
    ) -> Result<(), RemotingError> {
        let message = codec::seal(
            self.serializer(),
            message_type,
            payload,
            self.secret.as_ref(),
            None,
            unique_call_key,
            false,
        )?;
        self.send_frame(message.build())
    }

    /// Cancel everything and notify disconnect waiters. Idempotent.
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.pending.fail_all(RemoteInvocationError::server_disconnected());
        self.delegates.clear();
        self.outgoing.close_channel();
        let mut waiters = self.disconnect_waiters.lock().unwrap();
        for waiter in waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::debug!(session_id = %self.session_id, "client session ended");
    }
}

/// An RPC client bound to one server session.
///
/// Cloning shares the session; the clones invoke and disconnect the same
/// connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect over an established transport connection: run the
    /// handshake (and the authentication exchange when credentials are
    /// configured), then start the reader, writer and keep-alive tasks.
    pub async fn connect(
        config: ClientConfig,
        connection: Connection,
    ) -> Result<Client, RemotingError> {
        let (mut sink, stream, peer) = connection.split();
        let mut stream = stream.fuse();
        let serializer = config.serializer;
        let encryption = config.message_encryption;

        let key_pair = if encryption {
            Some(KeyPair::generate(config.key_size)?)
        } else {
            None
        };

        // Hello: our public key, or an empty frame without encryption.
        let hello = match &key_pair {
            Some(key_pair) => key_pair.public_key_der()?,
            None => Vec::new(),
        };
        sink.send(hello).await?;

        let message =
            read_message_within(&mut stream, config.connection_timeout, || {
                NetworkError::HandshakeTimeout.into()
            })
            .await?;
        if message.message_type != MessageType::CompleteHandshake {
            return Err(ProtocolError::MalformedFrame {
                reason: format!(
                    "expected complete_handshake, got {}",
                    message.message_type.as_str()
                ),
            }
            .into());
        }

        let (session_id, secret, server_public_key) = match &key_pair {
            Some(key_pair) => {
                let signed: SignedMessageData =
                    serializer.from_bytes("signed message data", &message.data)?;
                let sealed: EncryptedSecret =
                    serializer.from_bytes("encrypted secret", &signed.message_raw_data)?;
                crypto::verify_data(&signed, &sealed.senders_public_key)
                    .map_err(|_| SecurityError::SignatureMismatch)?;
                let session_id = crypto::open_secret(&sealed, key_pair)?;
                (session_id, Some(session_id), Some(sealed.senders_public_key))
            }
            None => {
                let session_id = Guid::from_slice(&message.data).ok_or_else(|| {
                    ProtocolError::MalformedFrame {
                        reason: format!("session id of {} bytes", message.data.len()),
                    }
                })?;
                (session_id, None, None)
            }
        };
        tracing::debug!(%session_id, %peer, "session established");

        let identity = if config.credentials.is_empty() {
            None
        } else {
            authenticate(
                &config,
                &mut sink,
                &mut stream,
                secret.as_ref(),
                server_public_key.as_deref(),
            )
            .await?
        };

        let (outgoing_sender, outgoing_receiver) = mpsc::unbounded::<Vec<u8>>();
        let inner = Arc::new(ClientInner {
            session_id,
            secret,
            server_public_key,
            identity,
            outgoing: outgoing_sender,
            pending: PendingCalls::new(),
            delegates: DelegateRegistry::new(),
            connected: AtomicBool::new(true),
            torn_down: AtomicBool::new(false),
            goodbye_ack: Mutex::new(None),
            disconnect_waiters: Mutex::new(Vec::new()),
            config,
        });

        async_std::task::spawn(write_loop(outgoing_receiver, sink));
        async_std::task::spawn(read_loop(Arc::clone(&inner), stream));
        if let Some(interval) = inner.config.keep_alive_interval {
            async_std::task::spawn(keep_alive_loop(Arc::downgrade(&inner), interval));
        }

        Ok(Client { inner })
    }

    /// Connect to the configured server over TCP.
    pub async fn connect_tcp(config: ClientConfig) -> Result<Client, RemotingError> {
        let connection =
            crate::transport::tcp::connect(&config.server_hostname, config.server_port).await?;
        Self::connect(config, connection).await
    }

    pub fn session_id(&self) -> Guid {
        self.inner.session_id
    }

    /// The identity the server attached to this session, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.inner.identity.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Number of calls currently awaiting a result.
    pub fn in_flight_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Resolves once this client's session ends, whichever side ends it.
    pub fn disconnected_signal(&self) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        let mut waiters = self.inner.disconnect_waiters.lock().unwrap();
        if self.inner.torn_down.load(Ordering::SeqCst) {
            let _ = sender.send(());
        } else {
            waiters.push(sender);
        }
        receiver
    }

    /// Invoke a remote method and deserialize its return value.
    pub async fn invoke<T: serde::de::DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        args: Vec<Arg>,
    ) -> Result<T, RemotingError> {
        let result = self.invoke_raw(service, method, args).await?;
        serde_json::from_value(result.return_value).map_err(|error| {
            RemoteInvocationError::new(format!("Failed to deserialize return value: {}", error))
                .into()
        })
    }

    /// Invoke a remote method and return the full result message,
    /// including out parameters.
    ///
    /// Delegate arguments are scoped to this call: once the result (or
    /// error) is in, their handler keys are dropped. Callbacks that must
    /// outlive a call belong in [Client::subscribe_event].
    pub async fn invoke_raw(
        &self,
        service: &str,
        method: &str,
        args: Vec<Arg>,
    ) -> Result<MethodCallResultMessage, RemotingError> {
        let call_scope = Guid::random();
        let parameters = self.build_parameters(args, Some(call_scope));
        let result = self.invoke_with_parameters(service, method, parameters).await;
        self.inner.delegates.remove_owner(call_scope);
        result
    }

    /// Invoke without waiting for a reply. The server swallows errors of
    /// one-way calls; they are only visible in its error sink.
    pub async fn invoke_one_way(
        &self,
        service: &str,
        method: &str,
        args: Vec<Arg>,
    ) -> Result<(), RemotingError> {
        self.ensure_connected()?;
        // One-way calls give no completion to scope a delegate to, so
        // their callbacks stay registered until disconnect.
        let call = MethodCallMessage {
            service: service.to_string(),
            method: method.to_string(),
            parameters: self.build_parameters(args, None),
            one_way: true,
        };
        let payload = self.inner.serializer().to_bytes("method call", &call)?;
        self.inner.send_sealed(MessageType::Rpc, payload, None)
    }

    /// Subscribe `callback` to `service.event`.
    pub async fn subscribe_event(
        &self,
        service: &str,
        event: &str,
        callback: Delegate,
    ) -> Result<EventSubscription, RemotingError> {
        self.ensure_connected()?;
        let handler_key = self.inner.delegates.register(&callback, None);
        let parameters = vec![Parameter::handler("handler", "EventHandler", handler_key)];
        self.invoke_with_parameters(service, &format!("add_{}", event), parameters)
            .await?;
        Ok(EventSubscription {
            service: service.to_string(),
            event: event.to_string(),
            handler_key,
        })
    }

    /// Undo a [Client::subscribe_event].
    pub async fn unsubscribe_event(
        &self,
        subscription: &EventSubscription,
    ) -> Result<(), RemotingError> {
        self.ensure_connected()?;
        let parameters = vec![Parameter::handler(
            "handler",
            "EventHandler",
            subscription.handler_key,
        )];
        self.invoke_with_parameters(
            &subscription.service,
            &format!("remove_{}", subscription.event),
            parameters,
        )
        .await?;
        self.inner.delegates.remove(subscription.handler_key);
        Ok(())
    }

    /// Say goodbye and cancel all in-flight calls. A second call is a
    /// no-op.
    pub async fn disconnect(&self) -> Result<(), RemotingError> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(session_id = %self.inner.session_id, "disconnecting");

        let (ack_sender, ack_receiver) = oneshot::channel();
        *self.inner.goodbye_ack.lock().unwrap() = Some(ack_sender);

        let goodbye = GoodbyeMessage {
            session_id: self.inner.session_id,
        };
        let sent = self
            .inner
            .serializer()
            .to_bytes("goodbye", &goodbye)
            .map_err(RemotingError::from)
            .and_then(|payload| self.inner.send_sealed(MessageType::Goodbye, payload, None));
        if sent.is_ok() {
            // Wait briefly for the server's goodbye; it is a courtesy,
            // not a requirement.
            let _ = async_std::future::timeout(self.inner.config.send_timeout, ack_receiver).await;
        }

        self.inner.teardown();
        Ok(())
    }

    async fn invoke_with_parameters(
        &self,
        service: &str,
        method: &str,
        parameters: Vec<Parameter>,
    ) -> Result<MethodCallResultMessage, RemotingError> {
        self.ensure_connected()?;
        let call = MethodCallMessage {
            service: service.to_string(),
            method: method.to_string(),
            parameters,
            one_way: false,
        };
        let payload = self.inner.serializer().to_bytes("method call", &call)?;

        let unique_call_key = Guid::random();
        let receiver = self.inner.pending.register(unique_call_key)?;
        tracing::trace!(%service, %method, call_key = %unique_call_key, "invoking");

        if let Err(error) =
            self.inner
                .send_sealed(MessageType::Rpc, payload, Some(unique_call_key))
        {
            self.inner.pending.remove(unique_call_key);
            return Err(error);
        }

        match async_std::future::timeout(self.inner.config.invocation_timeout, receiver).await {
            Ok(Ok(outcome)) => outcome.map_err(RemotingError::from),
            // The sender vanished with the map on disconnect.
            Ok(Err(_canceled)) => Err(RemoteInvocationError::server_disconnected().into()),
            Err(_elapsed) => {
                self.inner.pending.remove(unique_call_key);
                Err(RemoteInvocationError::timeout(service, method).into())
            }
        }
    }

    fn build_parameters(&self, args: Vec<Arg>, owner: Option<Guid>) -> Vec<Parameter> {
        args.into_iter()
            .map(|arg| match arg {
                Arg::Value {
                    name,
                    type_name,
                    value,
                } => Parameter::scalar(name, type_name, value),
                Arg::Delegate {
                    name,
                    type_name,
                    callback,
                } => {
                    let key = self.inner.delegates.register(&callback, owner);
                    Parameter::handler(name, type_name, key)
                }
            })
            .collect()
    }

    fn ensure_connected(&self) -> Result<(), RemotingError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(crate::error::LifecycleError::NotConnected.into())
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session_id", &self.inner.session_id)
            .field("connected", &self.is_connected())
            .field("in_flight", &self.inner.pending.len())
            .finish()
    }
}

/// Read one enveloped message within `timeout`, skipping keep-alives.
async fn read_message_within(
    stream: &mut (impl Stream<Item = Result<Vec<u8>, NetworkError>> + Unpin),
    timeout: Duration,
    on_timeout: impl Fn() -> RemotingError,
) -> Result<WireMessage, RemotingError> {
    let deadline = async_std::future::timeout(timeout, async {
        loop {
            match stream.try_next().await? {
                Some(frame) => {
                    if let Some(message) = WireMessage::parse(&frame)? {
                        return Ok(message);
                    }
                }
                None => return Err(RemotingError::from(NetworkError::Closed)),
            }
        }
    })
    .await;
    match deadline {
        Ok(result) => result,
        Err(_elapsed) => Err(on_timeout()),
    }
}

async fn authenticate(
    config: &ClientConfig,
    sink: &mut BoxConnectionSink,
    stream: &mut (impl Stream<Item = Result<Vec<u8>, NetworkError>> + Unpin),
    secret: Option<&Guid>,
    server_public_key: Option<&[u8]>,
) -> Result<Option<Identity>, RemotingError> {
    let serializer = config.serializer;
    let request = AuthenticationRequestMessage {
        credentials: config.credentials.clone(),
    };
    let payload = serializer.to_bytes("authentication request", &request)?;
    let message = codec::seal(
        serializer,
        MessageType::Auth,
        payload,
        secret,
        None,
        None,
        false,
    )?;
    sink.send(message.build()).await?;

    let message = read_message_within(stream, config.authentication_timeout, || {
        SecurityError::AuthenticationTimeout.into()
    })
    .await?;
    if message.message_type != MessageType::AuthResponse {
        return Err(ProtocolError::MalformedFrame {
            reason: format!(
                "expected auth_response, got {}",
                message.message_type.as_str()
            ),
        }
        .into());
    }
    let payload = codec::open(serializer, &message, secret, server_public_key)?;
    let response: AuthenticationResponseMessage =
        serializer.from_bytes("authentication response", &payload)?;
    if !response.is_authenticated {
        return Err(SecurityError::AuthenticationRejected.into());
    }
    tracing::debug!(identity = ?response.identity, "authenticated");
    Ok(response.identity)
}

async fn write_loop(mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>, mut sink: BoxConnectionSink) {
    while let Some(frame) = outgoing.next().await {
        if let Err(error) = sink.send(frame).await {
            tracing::debug!(%error, "client writer stopped");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<ClientInner>, mut stream: impl Stream<Item = Result<Vec<u8>, NetworkError>> + Unpin) {
    let serializer = inner.serializer();
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                tracing::debug!(%error, "connection failed");
                break;
            }
            None => break,
        };
        let message = match WireMessage::parse(&frame) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed frame");
                continue;
            }
        };
        tracing::trace!(message_type = message.message_type.as_str(), "frame received");

        match message.message_type {
            MessageType::RpcResult => handle_rpc_result(&inner, serializer, message),
            MessageType::Invoke => handle_invoke(&inner, serializer, message),
            MessageType::Goodbye | MessageType::SessionClosed => {
                tracing::debug!(
                    message_type = message.message_type.as_str(),
                    "server closed the session"
                );
                if let Some(ack) = inner.goodbye_ack.lock().unwrap().take() {
                    let _ = ack.send(());
                }
                break;
            }
            other => {
                tracing::warn!(
                    message_type = other.as_str(),
                    "unexpected message type from server"
                );
            }
        }
    }
    inner.teardown();
}

fn handle_rpc_result(inner: &Arc<ClientInner>, serializer: Serializer, message: WireMessage) {
    let key = match message.unique_call_key {
        Some(key) => key,
        None => {
            tracing::warn!("rpc_result without a call key");
            return;
        }
    };
    let payload = match codec::open(serializer, &message, inner.secret.as_ref(), None) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, call_key = %key, "failed to open rpc_result");
            inner.pending.complete(
                key,
                Err(RemoteInvocationError::new(format!(
                    "Failed to open result payload: {}",
                    error
                ))),
            );
            return;
        }
    };
    let outcome = if message.error {
        match serializer.from_bytes::<RemoteInvocationError>("remote invocation error", &payload) {
            Ok(error) => Err(error),
            Err(decode_error) => Err(RemoteInvocationError::new(decode_error.to_string())),
        }
    } else {
        match serializer.from_bytes::<MethodCallResultMessage>("method call result", &payload) {
            Ok(result) => Ok(result),
            Err(decode_error) => Err(RemoteInvocationError::new(decode_error.to_string())),
        }
    };
    if !inner.pending.complete(key, outcome) {
        // An unmatched key is a protocol violation; the call may have
        // timed out locally a moment earlier.
        tracing::warn!(call_key = %key, "no pending call for rpc_result");
    }
}

fn handle_invoke(inner: &Arc<ClientInner>, serializer: Serializer, message: WireMessage) {
    let payload = match codec::open(
        serializer,
        &message,
        inner.secret.as_ref(),
        inner.server_public_key.as_deref(),
    ) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "failed to open delegate invocation");
            return;
        }
    };
    let invocation: RemoteDelegateInvocationMessage =
        match serializer.from_bytes("delegate invocation", &payload) {
            Ok(invocation) => invocation,
            Err(error) => {
                tracing::warn!(%error, "failed to decode delegate invocation");
                return;
            }
        };
    match inner.delegates.get(invocation.handler_key) {
        Some(callback) => match inner.config.callback_dispatch_mode {
            CallbackDispatchMode::Serialized => callback(invocation.arguments),
            CallbackDispatchMode::Parallel => {
                async_std::task::spawn(async move { callback(invocation.arguments) });
            }
        },
        None => {
            tracing::warn!(handler_key = %invocation.handler_key, "unknown delegate handler key");
        }
    }
}

async fn keep_alive_loop(inner: Weak<ClientInner>, interval: Duration) {
    loop {
        async_std::task::sleep(interval).await;
        match inner.upgrade() {
            Some(inner) if inner.connected.load(Ordering::SeqCst) => {
                if inner.send_frame(WireMessage::keep_alive_frame()).is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}
