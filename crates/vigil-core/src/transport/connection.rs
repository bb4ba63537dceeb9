//! Loopback TCP connections with queued, non-blocking sends.

use std::net::Ipv6Addr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use super::{TransportError, WireCodec, MAX_MESSAGE_SIZE};

/// One side of a framed loopback TCP connection.
///
/// The owner reads inbound frames through [`Connection::recv`]; outbound
/// frames are queued and drained by a writer task, so sends never block.
pub struct Connection {
    peer_port: u16,
    outbound: mpsc::UnboundedSender<Bytes>,
    frames: FramedRead<OwnedReadHalf, WireCodec>,
}

/// A cloneable handle for pushing frames to a connection's send queue.
#[derive(Clone)]
pub struct MessageSender {
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl Connection {
    /// Connects to `[::1]:port`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the connect fails.
    pub async fn connect(port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((Ipv6Addr::LOCALHOST, port)).await?;
        Self::from_stream(stream)
    }

    /// Wraps an accepted or freshly connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the peer address cannot be read.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        let peer_port = stream.peer_addr()?.port();
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(
            FramedWrite::new(write_half, WireCodec::new()),
            queue,
        ));
        Ok(Self {
            peer_port,
            outbound,
            frames: FramedRead::new(read_half, WireCodec::new()),
        })
    }

    /// Queues a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MessageTooLarge`] for oversized payloads
    /// and [`TransportError::ConnectionClosed`] once the writer is gone.
    pub fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        queue_frame(&self.outbound, payload)
    }

    /// Receives the next inbound frame; `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.frames.next().await
    }

    /// Returns a cloneable send handle.
    #[must_use]
    pub fn sender(&self) -> MessageSender {
        MessageSender {
            outbound: self.outbound.clone(),
        }
    }

    /// The peer's TCP port.
    #[must_use]
    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }
}

impl MessageSender {
    /// Queues a frame for sending.
    ///
    /// # Errors
    ///
    /// Same contract as [`Connection::send`].
    pub fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        queue_frame(&self.outbound, payload)
    }
}

fn queue_frame(
    outbound: &mpsc::UnboundedSender<Bytes>,
    payload: Bytes,
) -> Result<(), TransportError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    outbound
        .send(payload)
        .map_err(|_| TransportError::ConnectionClosed)
}

async fn write_frames(
    mut sink: FramedWrite<OwnedWriteHalf, WireCodec>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(error) = sink.send(frame).await {
            debug!(%error, "frame write failed; closing connection");
            break;
        }
    }
    let _ = sink.into_inner().shutdown().await;
}

/// Binds a listener on `[::1]`, trying each port of the range in order.
///
/// # Errors
///
/// Returns [`TransportError::NoPortAvailable`] when every port is taken.
pub async fn bind_in_range(min: u16, max: u16) -> Result<(TcpListener, u16), TransportError> {
    for port in min..=max {
        if let Ok(listener) = TcpListener::bind((Ipv6Addr::LOCALHOST, port)).await {
            return Ok((listener, port));
        }
    }
    Err(TransportError::NoPortAvailable { min, max })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_pair(min: u16, max: u16) -> (Connection, Connection) {
        let (listener, port) = bind_in_range(min, max).await.unwrap();
        let (client, accepted) =
            tokio::join!(Connection::connect(port), async move {
                let (stream, _) = listener.accept().await.unwrap();
                Connection::from_stream(stream)
            });
        (client.unwrap(), accepted.unwrap())
    }

    #[tokio::test]
    async fn frames_travel_both_ways() {
        let (client, mut server) = local_pair(47100, 47110).await;

        client.send(Bytes::from_static(b"ping")).unwrap();
        let frame = server.recv().await.unwrap().unwrap();
        assert_eq!(frame, "ping");

        server.send(Bytes::from_static(b"pong")).unwrap();
        drop(server);

        let mut client = client;
        let frame = client.recv().await.unwrap().unwrap();
        assert_eq!(frame, "pong");
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn queued_sends_arrive_in_order() {
        let (client, mut server) = local_pair(47120, 47130).await;
        for i in 0_u8..20 {
            client.send(Bytes::from(vec![i])).unwrap();
        }
        for i in 0_u8..20 {
            let frame = server.recv().await.unwrap().unwrap();
            assert_eq!(frame.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn oversized_payloads_are_refused_locally() {
        let (client, _server) = local_pair(47140, 47150).await;
        let oversized = Bytes::from(vec![0_u8; MAX_MESSAGE_SIZE + 1]);
        assert!(matches!(
            client.send(oversized),
            Err(TransportError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn bind_reports_exhausted_ranges() {
        let (_listener, port) = bind_in_range(47160, 47160).await.unwrap();
        assert_eq!(port, 47160);
        assert!(matches!(
            bind_in_range(47160, 47160).await,
            Err(TransportError::NoPortAvailable { .. })
        ));
    }
}
