//! One greeted TCP connection to the Malmo client.
//!
//! Every receive is bounded by the configured socket timeout; exceeding it is
//! a `TransportError::Timeout`, which the lifecycle treats like any other
//! socket failure.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use super::codec::MessageCodec;
use super::protocol::{self, Command, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection timed out!")]
    Timeout,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct Connection {
    framed: Framed<TcpStream, MessageCodec>,
    read_timeout: Duration,
}

impl Connection {
    /// Open a socket, disable send coalescing and send the greeting banner.
    pub async fn connect(
        host: &str,
        port: u16,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        tracing::debug!(%host, port, "Creating socket connection");
        let stream = tokio::time::timeout(read_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            framed: Framed::new(stream, MessageCodec::new()),
            read_timeout,
        };
        conn.send_command(Command::Hello).await?;
        Ok(conn)
    }

    pub async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        tokio::time::timeout(self.read_timeout, self.framed.send(payload))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(())
    }

    pub async fn send_command(&mut self, command: Command<'_>) -> Result<(), TransportError> {
        tracing::trace!(?command, "Sending command");
        self.send(command.encode()).await
    }

    /// Receive exactly one frame.
    pub async fn recv(&mut self) -> Result<Bytes, TransportError> {
        match tokio::time::timeout(self.read_timeout, self.framed.next()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(Err(e))) => Err(TransportError::Io(e)),
            Ok(Some(Ok(frame))) => Ok(frame),
        }
    }

    /// Receive a `u32` acknowledgment frame.
    pub async fn recv_ack(&mut self, reply: &'static str) -> Result<bool, TransportError> {
        let frame = self.recv().await?;
        Ok(protocol::decode_ack(reply, &frame)?)
    }

    /// Graceful shutdown. Errors from an already-broken pipe are swallowed.
    pub async fn shutdown(self) {
        let mut stream = self.framed.into_inner();
        if let Err(e) = stream.shutdown().await {
            tracing::trace!(error = %e, "Ignoring shutdown error on dead socket");
        }
    }
}

/// Open a short-lived connection, send one command and return its reply frame.
pub async fn one_shot(
    host: &str,
    port: u16,
    read_timeout: Duration,
    command: Command<'_>,
) -> Result<Bytes, TransportError> {
    let mut conn = Connection::connect(host, port, read_timeout).await?;
    conn.send_command(command).await?;
    let reply = conn.recv().await;
    conn.shutdown().await;
    reply
}

/// Ask the client for its status string.
pub async fn query_status(
    host: &str,
    port: u16,
    read_timeout: Duration,
) -> Result<String, TransportError> {
    let reply = one_shot(host, port, read_timeout, Command::Status).await?;
    String::from_utf8(reply.to_vec()).map_err(|_| ProtocolError::InvalidStatus.into())
}
