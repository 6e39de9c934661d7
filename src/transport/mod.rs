//! Message-oriented transports.
//!
//! The engine is transport-agnostic: it talks to a [Connection], a pair
//! of a frame sink and a frame stream. Shipped channels are TCP
//! ([tcp]) and an in-process pair ([memory]); anything that frames byte
//! messages can be wrapped into a [Connection].

mod framed;
pub mod memory;
pub mod tcp;

use futures::future::BoxFuture;
use futures::prelude::*;
use std::pin::Pin;

use crate::error::NetworkError;

pub use framed::{FrameReader, FrameWriter, MAX_FRAME_SIZE};

pub type BoxConnectionSink = Pin<Box<dyn Sink<Vec<u8>, Error = NetworkError> + Send>>;
pub type BoxConnectionStream =
    Pin<Box<dyn Stream<Item = Result<Vec<u8>, NetworkError>> + Send>>;

/// A live, framed, bidirectional byte-message connection.
pub struct Connection {
    sink: BoxConnectionSink,
    stream: BoxConnectionStream,
    peer: String,
}

impl Connection {
    pub fn new<S, R>(sink: S, stream: R, peer: impl Into<String>) -> Self
    where
        S: Sink<Vec<u8>, Error = NetworkError> + Send + 'static,
        R: Stream<Item = Result<Vec<u8>, NetworkError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            peer: peer.into(),
        }
    }

    /// Address or label of the other end, for diagnostics.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn split(self) -> (BoxConnectionSink, BoxConnectionStream, String) {
        (self.sink, self.stream, self.peer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// Accepts incoming [Connection]s for a server.
pub trait Listener: Send {
    fn accept(&mut self) -> BoxFuture<'_, Result<Connection, NetworkError>>;

    /// Address or label the listener is bound to, for diagnostics.
    fn local_addr(&self) -> String;
}
