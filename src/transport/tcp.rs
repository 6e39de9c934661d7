//! TCP channel: length-prefixed frames over a socket.

use futures::future::BoxFuture;
use futures::prelude::*;

use crate::error::NetworkError;

use super::framed::{FrameReader, FrameWriter};
use super::{Connection, Listener};

/// Connect to `hostname:port` and frame the socket.
pub async fn connect(hostname: &str, port: u16) -> Result<Connection, NetworkError> {
    let addr = format!("{}:{}", hostname, port);
    let socket = async_std::net::TcpStream::connect(&addr)
        .await
        .map_err(|source| NetworkError::Connect {
            addr: addr.clone(),
            source,
        })?;
    Ok(framed_connection(socket, addr))
}

/// A [Listener] over a bound TCP socket.
#[derive(Debug)]
pub struct TcpListener {
    inner: async_std::net::TcpListener,
}

impl TcpListener {
    pub async fn bind(hostname: &str, port: u16) -> Result<Self, NetworkError> {
        let addr = format!("{}:{}", hostname, port);
        let inner = async_std::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| NetworkError::Connect { addr, source })?;
        Ok(Self { inner })
    }

    /// The port actually bound, useful with port 0.
    pub fn port(&self) -> u16 {
        self.inner.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }
}

impl Listener for TcpListener {
    fn accept(&mut self) -> BoxFuture<'_, Result<Connection, NetworkError>> {
        async move {
            let (socket, peer) = self.inner.accept().await.map_err(NetworkError::Accept)?;
            Ok(framed_connection(socket, peer.to_string()))
        }
        .boxed()
    }

    fn local_addr(&self) -> String {
        self.inner
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unbound>".to_string())
    }
}

fn framed_connection(socket: async_std::net::TcpStream, peer: String) -> Connection {
    let (read, write) = (socket.clone(), socket);
    Connection::new(FrameWriter::new(write), FrameReader::new(read), peer)
}
