//! Shared harness: an in-process server/client pair.

use std::sync::Arc;

use remoting::transport::memory;
use remoting::{Client, ClientConfig, Server, ServerConfig, ServiceRegistry};

pub struct TestServer {
    pub server: Arc<Server>,
    pub connector: memory::MemoryConnector,
    serve_task: async_std::task::JoinHandle<Result<(), remoting::RemotingError>>,
}

impl TestServer {
    pub fn start(config: ServerConfig, registry: ServiceRegistry) -> Self {
        Self::start_with_auth(config, registry, None)
    }

    pub fn start_with_auth(
        config: ServerConfig,
        registry: ServiceRegistry,
        auth: Option<Arc<dyn remoting::AuthenticationProvider>>,
    ) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let (connector, listener) = memory::channel();
        let server = Arc::new(Server::new(config, registry, auth).unwrap());
        let serve_task = {
            let server = Arc::clone(&server);
            async_std::task::spawn(async move { server.serve(listener).await })
        };
        Self {
            server,
            connector,
            serve_task,
        }
    }

    pub async fn connect(&self, config: ClientConfig) -> Client {
        self.try_connect(config).await.unwrap()
    }

    pub async fn try_connect(&self, config: ClientConfig) -> Result<Client, remoting::RemotingError> {
        let connection = self.connector.connect().unwrap();
        Client::connect(config, connection).await
    }

    pub async fn stop(self) {
        self.server.shutdown().await;
        drop(self.connector);
        let _ = self.serve_task.await;
    }
}

/// Poll `predicate` for up to a second.
pub async fn eventually(predicate: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if predicate() {
            return true;
        }
        async_std::task::sleep(std::time::Duration::from_millis(10)).await;
    }
    predicate()
}
