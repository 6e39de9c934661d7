//! Per-connection session state and the connection state machine.
//!
//! A connection starts in `AwaitHandshake`: the first client frame is the
//! hello carrying the client's RSA public key (empty when encryption is
//! off). The server replies with `complete_handshake` and the session
//! enters `Handshaked`; from there an `auth` exchange leads to `Ready`
//! (immediately, when no authentication is required). `rpc` frames are
//! dispatched, `goodbye` is acknowledged and closes, and the empty
//! keep-alive frame only refreshes the activity clock.

use chashmap::CHashMap;
use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use futures::stream::FusedStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::codec::{self, MessageType, WireMessage};
use crate::crypto::{self, KeyPair};
use crate::error::{NetworkError, RemotingError, SecurityError};
use crate::guid::Guid;
use crate::message::{
    AuthenticationRequestMessage, AuthenticationResponseMessage, GoodbyeMessage, Identity,
    MethodCallMessage,
};
use crate::serializer::Serializer;
use crate::service::{RemoteDelegate, ServiceLifetime};
use crate::transport::Connection;

use super::dispatcher;
use super::ServerShared;

/// Server-side state shared between the connection task, the dispatcher
/// workers, the event stub and the reaper.
pub(crate) struct SessionShared {
    pub session_id: Guid,
    pub client_public_key: Option<Vec<u8>>,
    serializer: Serializer,
    /// `Some` iff message encryption is on; equals the session id.
    secret: Option<Guid>,
    key_pair: Option<Arc<KeyPair>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    last_activity: Mutex<Instant>,
    identity: Mutex<Option<Identity>>,
    closed: AtomicBool,
    close_signal: Mutex<Option<oneshot::Sender<()>>>,
    /// Delegate proxies registered under this session, by handler key.
    pub delegates: CHashMap<Guid, RemoteDelegate>,
}

impl SessionShared {
    fn new(
        session_id: Guid,
        client_public_key: Option<Vec<u8>>,
        serializer: Serializer,
        encryption: bool,
        key_pair: Option<Arc<KeyPair>>,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        close_signal: oneshot::Sender<()>,
    ) -> Self {
        Self {
            session_id,
            client_public_key,
            serializer,
            secret: if encryption { Some(session_id) } else { None },
            key_pair,
            outgoing,
            last_activity: Mutex::new(Instant::now()),
            identity: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_signal: Mutex::new(Some(close_signal)),
            delegates: CHashMap::new(),
        }
    }

    pub fn secret(&self) -> Option<&Guid> {
        self.secret.as_ref()
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Seal `payload` into an envelope and enqueue it on the ordered
    /// writer.
    pub fn send(
        &self,
        message_type: MessageType,
        payload: Vec<u8>,
        unique_call_key: Option<Guid>,
        error: bool,
    ) -> Result<(), RemotingError> {
        let message = codec::seal(
            self.serializer,
            message_type,
            payload,
            self.secret.as_ref(),
            self.key_pair.as_deref(),
            unique_call_key,
            error,
        )?;
        self.send_frame(message.build())
    }

    /// The handshake reply goes out before the client knows the secret,
    /// so it is signed but never AES-encrypted.
    fn send_handshake(&self, payload: Vec<u8>) -> Result<(), RemotingError> {
        let message = codec::seal(
            self.serializer,
            MessageType::CompleteHandshake,
            payload,
            None,
            self.key_pair.as_deref(),
            None,
            false,
        )?;
        self.send_frame(message.build())
    }

    fn send_frame(&self, frame: Vec<u8>) -> Result<(), RemotingError> {
        self.outgoing
            .unbounded_send(frame)
            .map_err(|_| NetworkError::Closed.into())
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().unwrap().clone()
    }

    pub fn set_identity(&self, identity: Option<Identity>) {
        *self.identity.lock().unwrap() = identity;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the connection task to stop. Safe to call more than once.
    pub fn close(&self) {
        if let Some(signal) = self.close_signal.lock().unwrap().take() {
            let _ = signal.send(());
        }
    }

    /// The invoker backing every [RemoteDelegate] of this session: it
    /// serializes a delegate invocation and enqueues an `invoke`
    /// envelope. Fire-and-forget; failures only log.
    pub fn delegate_invoker(
        self: &Arc<Self>,
    ) -> Arc<dyn Fn(Guid, Vec<serde_json::Value>) + Send + Sync> {
        let session = Arc::clone(self);
        Arc::new(move |handler_key, arguments| {
            let invocation = crate::message::RemoteDelegateInvocationMessage {
                handler_key,
                arguments,
            };
            let payload = match session
                .serializer
                .to_bytes("delegate invocation", &invocation)
            {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::warn!(%error, "failed to encode delegate invocation");
                    return;
                }
            };
            if let Err(error) = session.send(MessageType::Invoke, payload, None, false) {
                tracing::debug!(%error, session_id = %session.session_id, "dropping delegate invocation");
            }
        })
    }
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("session_id", &self.session_id)
            .field("encrypted", &self.secret.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Remove every trace of a session. Idempotent; the first caller wins.
pub(crate) fn teardown_session(server: &ServerShared, session: &SessionShared) {
    if session.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    tracing::debug!(session_id = %session.session_id, "tearing down session");
    session.close();
    server.sessions.remove(&session.session_id);
    server.events.remove_session(session.session_id);
    session.delegates.clear();
    session.outgoing.close_channel();
}

enum SessionState {
    Handshaked,
    Authing,
    Ready,
}

/// Drive one accepted connection until it disconnects or is closed.
pub(crate) async fn run_connection(
    server: Arc<ServerShared>,
    connection: Connection,
) -> Result<(), RemotingError> {
    let (sink, stream, peer) = connection.split();
    let mut stream = stream.fuse();
    tracing::debug!(%peer, "accepted connection");

    // The hello frame carries the client's public key in encryption mode.
    let hello = match stream.try_next().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(error) => return Err(error.into()),
    };
    let encryption = server.config.message_encryption;
    let client_public_key = match (encryption, hello.is_empty()) {
        (true, true) => {
            tracing::warn!(%peer, "client sent no public key on an encrypted server");
            return Err(SecurityError::DecryptFailed.into());
        }
        (true, false) => Some(hello),
        (false, _) => None,
    };

    let session_id = Guid::random();
    let (outgoing_sender, outgoing_receiver) = mpsc::unbounded::<Vec<u8>>();
    let (close_sender, close_receiver) = oneshot::channel();
    let session = Arc::new(SessionShared::new(
        session_id,
        client_public_key,
        server.config.serializer,
        encryption,
        server.key_pair.clone(),
        outgoing_sender,
        close_sender,
    ));
    server.sessions.insert(session_id, Arc::clone(&session));

    let writer_task = async_std::task::spawn(async move {
        let mut sink = sink;
        let mut outgoing = outgoing_receiver;
        while let Some(frame) = outgoing.next().await {
            if let Err(error) = sink.send(frame).await {
                tracing::debug!(%error, "session writer stopped");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Ordered executor for calls that must not run concurrently.
    let (fifo_sender, mut fifo_receiver) =
        mpsc::unbounded::<(MethodCallMessage, Option<Guid>)>();
    let fifo_task = async_std::task::spawn({
        let server = Arc::clone(&server);
        let session = Arc::clone(&session);
        async move {
            while let Some((call, call_key)) = fifo_receiver.next().await {
                dispatcher::dispatch_rpc(
                    Arc::clone(&server),
                    Arc::clone(&session),
                    call,
                    call_key,
                )
                .await;
            }
        }
    });

    let result = drive_session(&server, &session, &mut stream, close_receiver, &fifo_sender).await;
    teardown_session(&server, &session);
    drop(fifo_sender);
    fifo_task.cancel().await;
    writer_task.await;
    tracing::debug!(session_id = %session_id, "session ended");
    result
}

async fn drive_session(
    server: &Arc<ServerShared>,
    session: &Arc<SessionShared>,
    stream: &mut (impl Stream<Item = Result<Vec<u8>, NetworkError>> + Unpin + FusedStream),
    close_receiver: oneshot::Receiver<()>,
    fifo: &mpsc::UnboundedSender<(MethodCallMessage, Option<Guid>)>,
) -> Result<(), RemotingError> {
    let serializer = server.config.serializer;
    let encryption = server.config.message_encryption;

    let handshake_payload = match &session.client_public_key {
        Some(client_key) => {
            let key_pair = server
                .key_pair
                .as_ref()
                .expect("encryption requires a key pair");
            let sealed = crypto::seal_secret(&session.session_id, client_key, key_pair)?;
            serializer.to_bytes("encrypted secret", &sealed)?
        }
        None => session.session_id.as_bytes().to_vec(),
    };
    session.send_handshake(handshake_payload)?;

    let mut state = if server.config.authentication_required {
        SessionState::Handshaked
    } else {
        SessionState::Ready
    };
    let mut close_receiver = close_receiver.fuse();

    loop {
        let frame = futures::select! {
            frame = stream.next() => frame,
            _ = close_receiver => {
                tracing::debug!(session_id = %session.session_id, "session closed by server");
                return Ok(());
            }
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                tracing::debug!(%error, session_id = %session.session_id, "connection failed");
                return Ok(());
            }
            None => return Ok(()),
        };
        session.touch();

        let message = match WireMessage::parse(&frame) {
            Ok(Some(message)) => message,
            // Keep-alive: the activity clock is already refreshed.
            Ok(None) => continue,
            Err(error) => {
                tracing::warn!(%error, session_id = %session.session_id, "dropping malformed frame");
                continue;
            }
        };
        tracing::trace!(
            message_type = message.message_type.as_str(),
            session_id = %session.session_id,
            "frame received"
        );

        match message.message_type {
            MessageType::Auth => {
                let authenticated = handle_auth(server, session, &message)?;
                // An optional authentication never locks a session that
                // was already ready.
                if server.config.authentication_required {
                    state = if authenticated {
                        SessionState::Ready
                    } else {
                        SessionState::Authing
                    };
                }
            }
            MessageType::Rpc => {
                let call_key = message.unique_call_key;
                if matches!(state, SessionState::Handshaked | SessionState::Authing) {
                    dispatcher::reply_error(
                        session,
                        call_key,
                        crate::error::RemoteInvocationError::new(
                            "Authentication is required before invoking methods",
                        ),
                    );
                    continue;
                }
                let payload = match codec::open(serializer, &message, session.secret(), None) {
                    Ok(payload) => payload,
                    Err(error) => {
                        tracing::warn!(%error, session_id = %session.session_id, "failed to open rpc payload");
                        continue;
                    }
                };
                let call: MethodCallMessage =
                    match serializer.from_bytes("method call", &payload) {
                        Ok(call) => call,
                        Err(error) => {
                            dispatcher::reply_error(
                                session,
                                call_key,
                                crate::error::RemoteInvocationError::new(error.to_string()),
                            );
                            continue;
                        }
                    };

                // Encrypted sessions and per-call services dispatch in
                // arrival order; everything else runs on the pool.
                let ordered = encryption
                    || server.registry.lifetime(&call.service) == Some(ServiceLifetime::PerCall);
                if ordered {
                    let _ = fifo.unbounded_send((call, call_key));
                } else {
                    async_std::task::spawn(dispatcher::dispatch_rpc(
                        Arc::clone(server),
                        Arc::clone(session),
                        call,
                        call_key,
                    ));
                }
            }
            MessageType::Goodbye => {
                let claimed = codec::open(serializer, &message, session.secret(), None)
                    .ok()
                    .and_then(|payload| {
                        serializer
                            .from_bytes::<GoodbyeMessage>("goodbye", &payload)
                            .ok()
                    });
                if let Some(goodbye) = claimed {
                    if goodbye.session_id != session.session_id {
                        tracing::warn!(
                            claimed = %goodbye.session_id,
                            session_id = %session.session_id,
                            "goodbye names a different session"
                        );
                    }
                }
                let payload = serializer.to_bytes(
                    "goodbye",
                    &GoodbyeMessage {
                        session_id: session.session_id,
                    },
                )?;
                let _ = session.send(MessageType::Goodbye, payload, None, false);
                return Ok(());
            }
            other => {
                tracing::warn!(
                    message_type = other.as_str(),
                    session_id = %session.session_id,
                    "unexpected message type from client"
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerConfig;
    use crate::message::{MethodCallResultMessage, Parameter};
    use crate::server::events::EventStub;
    use crate::service::{MethodResult, ServiceMethods, ServiceRegistry};
    use crate::transport::{memory, BoxConnectionSink, BoxConnectionStream};

    fn test_server(config: ServerConfig) -> Arc<ServerShared> {
        let _ = tracing_subscriber::fmt::try_init();
        let mut service = ServiceMethods::new();
        service.add_method("Echo", |_ctx, (text,): (String,)| async move {
            MethodResult::value(text)
        });
        let mut registry = ServiceRegistry::new();
        registry.register("EchoService", service);
        Arc::new(ServerShared {
            key_pair: None,
            auth: None,
            registry: Arc::new(registry),
            events: Arc::new(EventStub::new(config.event_dispatch_mode)),
            sessions: CHashMap::new(),
            errors: crate::server::ErrorSink::new(),
            config,
        })
    }

    struct TestClient {
        sink: BoxConnectionSink,
        stream: BoxConnectionStream,
        task: async_std::task::JoinHandle<Result<(), RemotingError>>,
    }

    impl TestClient {
        async fn start(server: &Arc<ServerShared>) -> Self {
            let (client_conn, server_conn) = memory::pair();
            let task =
                async_std::task::spawn(run_connection(Arc::clone(server), server_conn));
            let (mut sink, stream, _) = client_conn.split();
            sink.send(Vec::new()).await.unwrap();
            Self { sink, stream, task }
        }

        async fn send(&mut self, message: WireMessage) {
            self.sink.send(message.build()).await.unwrap();
        }

        async fn recv(&mut self) -> WireMessage {
            let frame = self.stream.try_next().await.unwrap().unwrap();
            WireMessage::parse(&frame).unwrap().unwrap()
        }

        fn seal_call(&self, call: &MethodCallMessage, call_key: Guid) -> WireMessage {
            let payload = Serializer::Json.to_bytes("method call", call).unwrap();
            codec::seal(
                Serializer::Json,
                MessageType::Rpc,
                payload,
                None,
                None,
                Some(call_key),
                false,
            )
            .unwrap()
        }
    }

    fn echo_call(text: &str) -> MethodCallMessage {
        MethodCallMessage {
            service: "EchoService".to_string(),
            method: "Echo".to_string(),
            parameters: vec![Parameter::scalar("text", "string", serde_json::json!(text))],
            one_way: false,
        }
    }

    #[async_std::test]
    async fn handshake_sends_the_session_id_in_the_clear() {
        let server = test_server(ServerConfig::default());
        let mut client = TestClient::start(&server).await;

        let handshake = client.recv().await;
        assert_eq!(handshake.message_type, MessageType::CompleteHandshake);
        let session_id = Guid::from_slice(&handshake.data).unwrap();
        assert!(!session_id.is_nil());
        assert!(server.sessions.contains_key(&session_id));
    }

    #[async_std::test]
    async fn rpc_is_answered_under_its_call_key() {
        let server = test_server(ServerConfig::default());
        let mut client = TestClient::start(&server).await;
        client.recv().await;

        let call_key = Guid::random();
        let message = client.seal_call(&echo_call("hi"), call_key);
        client.send(message).await;

        let reply = client.recv().await;
        assert_eq!(reply.message_type, MessageType::RpcResult);
        assert_eq!(reply.unique_call_key, Some(call_key));
        assert!(!reply.error);
        let result: MethodCallResultMessage =
            Serializer::Json.from_bytes("method call result", &reply.data).unwrap();
        assert_eq!(result.return_value, serde_json::json!("hi"));
    }

    #[async_std::test]
    async fn unknown_service_is_an_error_reply() {
        let server = test_server(ServerConfig::default());
        let mut client = TestClient::start(&server).await;
        client.recv().await;

        let call_key = Guid::random();
        let mut call = echo_call("hi");
        call.service = "Nope".to_string();
        let message = client.seal_call(&call, call_key);
        client.send(message).await;

        let reply = client.recv().await;
        assert!(reply.error);
        assert_eq!(reply.unique_call_key, Some(call_key));
        let error: crate::error::RemoteInvocationError =
            Serializer::Json.from_bytes("remote invocation error", &reply.data).unwrap();
        assert!(error.message.contains("Nope"));
    }

    #[async_std::test]
    async fn goodbye_is_acknowledged_then_closed() {
        let server = test_server(ServerConfig::default());
        let mut client = TestClient::start(&server).await;
        let handshake = client.recv().await;
        let session_id = Guid::from_slice(&handshake.data).unwrap();

        let payload = Serializer::Json
            .to_bytes("goodbye", &GoodbyeMessage { session_id })
            .unwrap();
        let message = codec::seal(
            Serializer::Json,
            MessageType::Goodbye,
            payload,
            None,
            None,
            None,
            false,
        )
        .unwrap();
        client.send(message).await;

        let ack = client.recv().await;
        assert_eq!(ack.message_type, MessageType::Goodbye);
        client.task.await.unwrap();
        assert_eq!(server.sessions.len(), 0);
    }

    #[async_std::test]
    async fn keep_alive_refreshes_the_activity_clock() {
        let server = test_server(ServerConfig::default());
        let mut client = TestClient::start(&server).await;
        let handshake = client.recv().await;
        let session_id = Guid::from_slice(&handshake.data).unwrap();
        let session = Arc::clone(&*server.sessions.get(&session_id).unwrap());

        async_std::task::sleep(Duration::from_millis(80)).await;
        let idle_before = session.idle_for();
        client.sink.send(WireMessage::keep_alive_frame()).await.unwrap();

        // The keep-alive produces no reply but the clock resets.
        for _ in 0..100 {
            if session.idle_for() < idle_before {
                break;
            }
            async_std::task::sleep(Duration::from_millis(5)).await;
        }
        assert!(session.idle_for() < idle_before);
        assert!(!session.is_closed());
    }

    #[async_std::test]
    async fn malformed_frames_do_not_kill_the_session() {
        let server = test_server(ServerConfig::default());
        let mut client = TestClient::start(&server).await;
        client.recv().await;

        client.sink.send(vec![0xff, 0xee, 0xdd]).await.unwrap();

        let call_key = Guid::random();
        let message = client.seal_call(&echo_call("still alive"), call_key);
        client.send(message).await;
        let reply = client.recv().await;
        assert_eq!(reply.unique_call_key, Some(call_key));
        assert!(!reply.error);
    }
}

fn handle_auth(
    server: &Arc<ServerShared>,
    session: &Arc<SessionShared>,
    message: &WireMessage,
) -> Result<bool, RemotingError> {
    let serializer = server.config.serializer;
    let payload = codec::open(serializer, message, session.secret(), None)?;
    let request: AuthenticationRequestMessage =
        serializer.from_bytes("authentication request", &payload)?;

    let identity = server
        .auth
        .as_ref()
        .and_then(|provider| provider.authenticate(&request.credentials));
    let is_authenticated = identity.is_some();
    if is_authenticated {
        session.set_identity(identity.clone());
    } else {
        tracing::debug!(session_id = %session.session_id, "authentication rejected");
    }

    let response = AuthenticationResponseMessage {
        is_authenticated,
        identity,
    };
    let payload = serializer.to_bytes("authentication response", &response)?;
    session.send(MessageType::AuthResponse, payload, None, false)?;
    Ok(is_authenticated)
}
