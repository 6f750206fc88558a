//! Remote connection kinds: TCP stream and UDP datagram, generalized from
//! the teacher's `src/ipc/tcp_socket.rs` and `src/ipc/unix_domain_socket.rs`
//! (length-prefixed framing over a `tokio` stream, `socket2` for tuning).

use super::{Connection, ConnectionKind};
use crate::message::codec::{BincodeCodec, MessageCodec};
use crate::message::Message;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const LENGTH_PREFIX_BYTES: usize = 4;

/// Apply the teacher's keepalive/nodelay tuning to a TCP stream.
fn tune(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true).context("set_nodelay")?;
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    sock_ref.set_tcp_keepalive(&keepalive).context("set_tcp_keepalive")?;
    Ok(())
}

/// A connection over a single accepted or connected TCP stream, framing
/// each message with a 4-byte big-endian length prefix.
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    max_data_size: usize,
    usable: bool,
    read_buf: Vec<u8>,
    codec: BincodeCodec,
}

impl TcpConnection {
    pub async fn connect(addr: SocketAddr, max_data_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Self::from_stream(stream, max_data_size)
    }

    pub fn from_stream(stream: TcpStream, max_data_size: usize) -> Result<Self> {
        tune(&stream)?;
        let peer = stream.peer_addr().context("peer_addr")?;
        Ok(Self {
            stream,
            peer,
            max_data_size,
            usable: true,
            read_buf: Vec::new(),
            codec: BincodeCodec,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn try_read_one_frame(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; LENGTH_PREFIX_BYTES];
        match self.stream.try_read(&mut header) {
            Ok(0) => {
                self.usable = false;
                return Ok(None);
            }
            Ok(n) if n < LENGTH_PREFIX_BYTES => {
                // Partial header read: buffer and retry on next tick rather
                // than block. Rare with small frames; not worth a full
                // streaming parser for the bus's control-plane traffic.
                self.read_buf.extend_from_slice(&header[..n]);
                return Ok(None);
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => {
                self.usable = false;
                return Err(anyhow!("tcp read failed from {}: {}", self.peer, e));
            }
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_data_size {
            self.usable = false;
            return Err(anyhow!("frame of {} bytes from {} exceeds max {}", len, self.peer, self.max_data_size));
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.context("reading frame body")?;
        let message = self.codec.decode(&body)?;
        Ok(Some(message))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    async fn send(&mut self, message: Message) -> Result<bool> {
        if !self.usable {
            return Ok(false);
        }
        let bytes = self.codec.encode(&message)?;
        if bytes.len() > self.max_data_size {
            return Err(anyhow!("message of {} bytes exceeds max {}", bytes.len(), self.max_data_size));
        }
        let header = (bytes.len() as u32).to_be_bytes();
        if let Err(e) = self.stream.write_all(&header).await {
            self.usable = false;
            return Err(anyhow!("tcp write header to {} failed: {}", self.peer, e));
        }
        if let Err(e) = self.stream.write_all(&bytes).await {
            self.usable = false;
            return Err(anyhow!("tcp write body to {} failed: {}", self.peer, e));
        }
        Ok(true)
    }

    async fn fetch_messages(&mut self, max: usize) -> Result<Vec<Message>> {
        if !self.usable {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for _ in 0..max {
            match self.try_read_one_frame().await? {
                Some(message) => out.push(message),
                None => break,
            }
        }
        Ok(out)
    }

    async fn update(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Remote
    }

    fn type_id(&self) -> &'static str {
        "tcp"
    }

    fn cleanup(&mut self) {
        self.usable = false;
    }
}

/// Listens for inbound TCP connections, handing each off as a
/// [`TcpConnection`] — the router side of the TCP acceptor.
pub struct TcpListenerConnection {
    listener: TcpListener,
    max_data_size: usize,
}

impl TcpListenerConnection {
    pub async fn bind(addr: SocketAddr, max_data_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener, max_data_size })
    }

    /// Non-blocking accept: returns `None` if no connection is waiting.
    pub async fn try_accept(&self) -> Result<Option<TcpConnection>> {
        match self.listener.accept().await {
            Ok((stream, _peer)) => Ok(Some(TcpConnection::from_stream(stream, self.max_data_size)?)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(anyhow!("tcp accept failed: {}", e)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// A connection over an unconnected UDP socket bound to one peer address,
/// for environments where a persistent TCP stream is unwanted.
pub struct UdpConnection {
    socket: UdpSocket,
    peer: SocketAddr,
    max_data_size: usize,
    usable: bool,
    inbound: VecDeque<Message>,
    codec: BincodeCodec,
}

impl UdpConnection {
    pub async fn connect(local: SocketAddr, peer: SocketAddr, max_data_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(local).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self {
            socket,
            peer,
            max_data_size,
            usable: true,
            inbound: VecDeque::new(),
            codec: BincodeCodec,
        })
    }
}

#[async_trait]
impl Connection for UdpConnection {
    fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    async fn send(&mut self, message: Message) -> Result<bool> {
        if !self.usable {
            return Ok(false);
        }
        let bytes = self.codec.encode(&message)?;
        if bytes.len() > self.max_data_size {
            return Err(anyhow!("datagram of {} bytes exceeds max {}", bytes.len(), self.max_data_size));
        }
        match self.socket.send(&bytes).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => {
                self.usable = false;
                Err(anyhow!("udp send to {} failed: {}", self.peer, e))
            }
        }
    }

    async fn fetch_messages(&mut self, max: usize) -> Result<Vec<Message>> {
        if !self.usable {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; self.max_data_size];
        loop {
            match self.socket.try_recv(&mut buf) {
                Ok(n) => match self.codec.decode(&buf[..n]) {
                    Ok(message) => self.inbound.push_back(message),
                    Err(_) => continue,
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.usable = false;
                    return Err(anyhow!("udp recv from {} failed: {}", self.peer, e));
                }
            }
        }
        Ok(self.inbound.drain(..self.inbound.len().min(max)).collect())
    }

    async fn update(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Remote
    }

    fn type_id(&self) -> &'static str {
        "udp"
    }

    fn cleanup(&mut self) {
        self.usable = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EndpointId, MessageId, Priority};

    fn msg(payload: Vec<u8>) -> Message {
        Message::new(MessageId::new("eagiTest", "ping"), EndpointId(1), EndpointId(2), Priority::Normal, payload)
    }

    #[tokio::test]
    async fn tcp_roundtrip_over_loopback() {
        let listener = TcpListenerConnection::bind("127.0.0.1:0".parse().unwrap(), 65536).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut conn = TcpConnection::connect(addr, 65536).await.unwrap();
            conn.send(msg(vec![1, 2, 3])).await.unwrap();
            conn
        });

        let mut server_side = loop {
            if let Some(conn) = listener.try_accept().await.unwrap() {
                break conn;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let mut received = Vec::new();
        for _ in 0..20 {
            received = server_side.fetch_messages(10).await.unwrap();
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, vec![1, 2, 3]);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn udp_roundtrip_over_loopback() {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = probe.local_addr().unwrap();
        drop(probe);
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = probe.local_addr().unwrap();
        drop(probe);

        let mut a = UdpConnection::connect(a_addr, b_addr, 65536).await.unwrap();
        let mut b = UdpConnection::connect(b_addr, a_addr, 65536).await.unwrap();

        assert!(a.send(msg(vec![9, 8, 7])).await.unwrap());

        let mut received = Vec::new();
        for _ in 0..20 {
            received = b.fetch_messages(10).await.unwrap();
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, vec![9, 8, 7]);
    }
}
