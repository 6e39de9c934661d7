//! In-process channel: a pair of connected endpoints backed by queues.
//!
//! Useful for tests and for hosting client and server in one process.

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::prelude::*;

use crate::error::NetworkError;

use super::{Connection, Listener};

/// Create two connected endpoints.
pub fn pair() -> (Connection, Connection) {
    let (left_sender, left_receiver) = mpsc::unbounded::<Vec<u8>>();
    let (right_sender, right_receiver) = mpsc::unbounded::<Vec<u8>>();
    let left = endpoint(left_sender, right_receiver, "memory:right");
    let right = endpoint(right_sender, left_receiver, "memory:left");
    (left, right)
}

fn endpoint(
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: &str,
) -> Connection {
    Connection::new(
        sender.sink_map_err(|_| NetworkError::Closed),
        receiver.map(Ok),
        peer,
    )
}

/// Create a connected [MemoryConnector] / [MemoryListener] pair.
pub fn channel() -> (MemoryConnector, MemoryListener) {
    let (sender, incoming) = mpsc::unbounded();
    (MemoryConnector { sender }, MemoryListener { incoming })
}

/// Client-side handle that opens new connections to the listener.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    sender: mpsc::UnboundedSender<Connection>,
}

impl MemoryConnector {
    pub fn connect(&self) -> Result<Connection, NetworkError> {
        let (client, server) = pair();
        self.sender
            .unbounded_send(server)
            .map_err(|_| NetworkError::Closed)?;
        Ok(client)
    }
}

/// Server-side queue of incoming in-process connections.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<Connection>,
}

impl Listener for MemoryListener {
    fn accept(&mut self) -> BoxFuture<'_, Result<Connection, NetworkError>> {
        async move { self.incoming.next().await.ok_or(NetworkError::Closed) }.boxed()
    }

    fn local_addr(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn pair_exchanges_frames() {
        let (left, right) = pair();
        let (mut left_sink, _, _) = left.split();
        let (_, mut right_stream, _) = right.split();

        left_sink.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(right_stream.try_next().await.unwrap(), Some(b"hello".to_vec()));

        drop(left_sink);
        assert_eq!(right_stream.try_next().await.unwrap(), None);
    }

    #[async_std::test]
    async fn connector_reaches_listener() {
        let (connector, mut listener) = channel();
        let client = connector.connect().unwrap();
        let server = listener.accept().await.unwrap();

        let (mut client_sink, _, _) = client.split();
        let (_, mut server_stream, _) = server.split();
        client_sink.send(b"hi".to_vec()).await.unwrap();
        assert_eq!(server_stream.try_next().await.unwrap(), Some(b"hi".to_vec()));
    }
}
