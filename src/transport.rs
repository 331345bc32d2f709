//! Bidirectional PDU channel between one client and the server.
//!
//! [`Transport`] is the seam the workers and listeners are written
//! against: blocking receive, receive with timeout, send, close. The TCP
//! implementation wraps a `tokio::net::TcpStream` and speaks
//! length-prefixed [`Pdu`] frames; [`link`] provides an in-memory pair for
//! tests. All protocol logic lives elsewhere; this module owns only
//! frame I/O.
//!
//! Sends on one connection may be issued by several workers at once (any
//! worker fanning out an event may target this connection), so the write
//! half sits behind a lock — one frame finishes before the next starts.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::pdu::{Pdu, PduError, MAX_PDU_BYTES};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No message arrived within the deadline (timeout receive only).
    #[error("receive timed out")]
    Timeout,
    /// The peer closed the channel.
    #[error("end of stream")]
    EndOfStream,
    /// This side already closed the channel.
    #[error("transport closed locally")]
    Closed,
    /// Underlying I/O error from the OS.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    /// The frame could not be encoded or decoded as a valid PDU.
    #[error("PDU codec error: {0}")]
    Codec(#[from] PduError),
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// A bidirectional, message-oriented channel carrying [`Pdu`]s.
///
/// All methods take `&self` so one connection can be shared across tasks
/// behind an `Arc`; implementations serialise concurrent sends internally.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one PDU. Fails if the channel is closed or broken.
    async fn send(&self, pdu: &Pdu) -> Result<(), TransportError>;

    /// Block until the next PDU arrives. Fails with
    /// [`TransportError::EndOfStream`] if the peer closed.
    async fn receive(&self) -> Result<Pdu, TransportError>;

    /// As [`receive`](Transport::receive), but fails with
    /// [`TransportError::Timeout`] if nothing arrives in time. The
    /// deadline does not carry over to subsequent calls.
    async fn receive_timeout(&self, timeout: Duration) -> Result<Pdu, TransportError> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(TransportError::Timeout),
        }
    }

    /// Close the channel. Double-close errors are the caller's to ignore.
    async fn close(&self) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// TCP implementation
// ---------------------------------------------------------------------------

/// A [`Transport`] over one TCP connection.
///
/// Frames are a 4-byte big-endian body length followed by the JSON body.
/// Reader and writer halves are independently locked, so a worker can sit
/// in `receive` while other workers push events through `send`.
pub struct TcpTransport {
    peer_addr: SocketAddr,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    /// Wrap an accepted or connected stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            peer_addr,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
        })
    }

    /// Open a client connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream)?)
    }

    /// Remote endpoint of this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, pdu: &Pdu) -> Result<(), TransportError> {
        let body = pdu.to_bytes()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Pdu, TransportError> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(eof_as_end)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_PDU_BYTES {
            return Err(TransportError::Codec(PduError::TooLarge { len }));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(eof_as_end)?;
        Ok(Pdu::from_bytes(&body)?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// A cleanly closed peer surfaces as `UnexpectedEof` from `read_exact`.
fn eof_as_end(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::EndOfStream
    } else {
        TransportError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// In-memory pair (tests)
// ---------------------------------------------------------------------------

/// One end of an in-memory transport created by [`link`].
///
/// Backed by unbounded channels; closing an end drops its sender, so the
/// peer's next receive reports end-of-stream once the queue drains.
pub struct LinkTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Pdu>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Pdu>>,
}

/// Create a connected pair of in-memory transports.
pub fn link() -> (LinkTransport, LinkTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        LinkTransport {
            tx: StdMutex::new(Some(a_tx)),
            rx: Mutex::new(a_rx),
        },
        LinkTransport {
            tx: StdMutex::new(Some(b_tx)),
            rx: Mutex::new(b_rx),
        },
    )
}

#[async_trait]
impl Transport for LinkTransport {
    async fn send(&self, pdu: &Pdu) -> Result<(), TransportError> {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(pdu.clone())
                .map_err(|_| TransportError::EndOfStream),
            None => Err(TransportError::Closed),
        }
    }

    async fn receive(&self) -> Result<Pdu, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::EndOfStream)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.tx.lock().unwrap().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn link_roundtrip() {
        let (a, b) = link();
        a.send(&Pdu::login_request("alice")).await.unwrap();
        let got = b.receive().await.unwrap();
        assert_eq!(got.user_name, "alice");
    }

    #[tokio::test]
    async fn link_close_surfaces_end_of_stream() {
        let (a, b) = link();
        a.close().await.unwrap();
        assert!(matches!(b.receive().await, Err(TransportError::EndOfStream)));
        assert!(matches!(
            a.send(&Pdu::login_request("x")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn receive_timeout_fires() {
        let (a, _b) = link();
        let err = a.receive_timeout(Duration::from_millis(20)).await;
        assert!(matches!(err, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn tcp_frames_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = TcpTransport::new(stream).unwrap();
            let pdu = conn.receive().await.unwrap();
            conn.send(&pdu.retargeted("echo")).await.unwrap();
        });

        let conn = Arc::new(TcpTransport::connect(addr).await.unwrap());
        conn.send(&Pdu::chat_message_event("alice", "hello", 1))
            .await
            .unwrap();
        let reply = conn.receive().await.unwrap();
        assert_eq!(reply.user_name, "echo");
        assert_eq!(reply.message.as_deref(), Some("hello"));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_peer_close_is_end_of_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let conn = TcpTransport::connect(addr).await.unwrap();
        assert!(matches!(
            conn.receive().await,
            Err(TransportError::EndOfStream)
        ));
    }
}
