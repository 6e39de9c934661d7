//! A transport-agnostic RPC runtime with encrypted sessions, remote
//! callbacks and request/response correlation.
//!
//! A [Server] hosts the services of a [ServiceRegistry] behind any
//! [transport::Listener]; a [Client] opens a session over a
//! [transport::Connection], invokes methods, subscribes to server events
//! and receives delegate callbacks. Sessions optionally run an RSA key
//! exchange and encrypt every message with AES.
//!
//! ```no_run
//! use std::sync::Arc;
//! use remoting::transport::memory;
//! use remoting::{
//!     Arg, Client, ClientConfig, MethodResult, Server, ServerConfig, ServiceMethods,
//!     ServiceRegistry,
//! };
//!
//! # async fn demo() -> Result<(), remoting::RemotingError> {
//! let mut service = ServiceMethods::new();
//! service.add_method("Echo", |_ctx, (text,): (String,)| async move {
//!     MethodResult::value(text)
//! });
//! let mut registry = ServiceRegistry::new();
//! registry.register("EchoService", service);
//!
//! let (connector, listener) = memory::channel();
//! let server = Arc::new(Server::new(ServerConfig::default(), registry, None)?);
//! let serving = {
//!     let server = Arc::clone(&server);
//!     async_std::task::spawn(async move { server.serve(listener).await })
//! };
//!
//! let client = Client::connect(ClientConfig::default(), connector.connect()?).await?;
//! let reply: String = client
//!     .invoke(
//!         "EchoService",
//!         "Echo",
//!         vec![Arg::value("text", "string", serde_json::json!("hi"))],
//!     )
//!     .await?;
//! assert_eq!(reply, "hi");
//!
//! client.disconnect().await?;
//! server.shutdown().await;
//! # drop(serving);
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations)]

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod guid;
pub mod message;
pub mod registry;
pub mod serializer;
pub mod server;
pub mod service;
pub mod transport;
mod utils;

#[cfg(test)]
mod test_utils;

#[doc(inline)]
pub use client::{Arg, Client, Delegate, EventSubscription};

#[doc(inline)]
pub use config::{CallbackDispatchMode, ClientConfig, EventDispatchMode, ServerConfig};

#[doc(inline)]
pub use error::{RemoteInvocationError, RemotingError};

#[doc(inline)]
pub use guid::Guid;

#[doc(inline)]
pub use serializer::Serializer;

#[doc(inline)]
pub use server::Server;

#[doc(inline)]
pub use service::{
    AuthenticationProvider, CallContext, MethodResult, ServiceMethods, ServiceRegistry,
};
