//! TCP host
//!
//! Every stream is its own TCP connection. A stream opens with a hello
//! frame carrying the dialer's peer id, its listen address, and the
//! protocols it wants; the listener answers with its own peer id and the
//! protocol it picked (empty when none match). After that each frame is a
//! kind byte followed by the payload. All frames are prefixed with a big
//! endian u32 length.

use crate::transport::{negotiate, FrameKind, Host, MessageStream, StreamHandler};
use crate::{Connectedness, Error, PeerId, PeerInfo, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use prost::Message as _;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Largest frame accepted from the wire
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq, prost::Message)]
struct Hello {
    #[prost(bytes, tag = "1")]
    peer_id: Vec<u8>,
    #[prost(string, tag = "2")]
    listen_addr: String,
    #[prost(string, repeated, tag = "3")]
    protocols: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct HelloAck {
    #[prost(bytes, tag = "1")]
    peer_id: Vec<u8>,
    #[prost(string, tag = "2")]
    protocol: String,
}

type Registration = (Vec<String>, Arc<dyn StreamHandler>);

#[derive(Default)]
struct Shared {
    peerstore: Mutex<HashMap<PeerId, Vec<String>>>,
    /// Open streams per peer, in either direction
    connected: Mutex<HashMap<PeerId, usize>>,
    registration: Mutex<Option<Registration>>,
}

/// A host that carries streams over plain TCP connections
pub struct TcpHost {
    id: PeerId,
    listen_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpHost {
    /// Bind a listener and start accepting inbound streams
    pub async fn bind(id: PeerId, addr: &str) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let listen_addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());

        let task = tokio::spawn(accept_loop(id, listen_addr, listener, shared.clone()));
        tracing::info!("TCP host {} listening on {}", id.short(), listen_addr);

        Ok(Arc::new(Self {
            id,
            listen_addr,
            shared,
            accept_task: Mutex::new(Some(task)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Stop accepting inbound streams
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
    }

    async fn dial(&self, peer: &PeerId, protocols: &[String]) -> Result<(TcpStream, String)> {
        let addrs = self.peer_addrs(peer);
        if addrs.is_empty() {
            return Err(Error::ConnectionFailed(format!("no addresses for {}", peer.short())));
        }

        let mut last_err = None;
        for addr in addrs {
            match self.handshake(&addr, peer, protocols).await {
                Ok(ok) => return Ok(ok),
                Err(e) => {
                    tracing::debug!("dial {} via {} failed: {}", peer.short(), addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(Error::ConnectionFailed(match last_err {
            Some(e) => format!("{}: {}", peer.short(), e),
            None => peer.short(),
        }))
    }

    async fn handshake(&self, addr: &str, peer: &PeerId, protocols: &[String]) -> Result<(TcpStream, String)> {
        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;

        let hello = Hello {
            peer_id: self.id.to_vec(),
            listen_addr: self.listen_addr.to_string(),
            protocols: protocols.to_vec(),
        };
        write_frame(&mut stream, &hello.encode_to_vec()).await?;

        let ack = HelloAck::decode(read_frame(&mut stream).await?.as_slice())?;
        if ack.peer_id != peer.as_bytes() {
            return Err(Error::ConnectionFailed(format!("{} answered with a different peer id", addr)));
        }
        Ok((stream, ack.protocol))
    }
}

impl Drop for TcpHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Host for TcpHost {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![self.listen_addr.to_string()]
    }

    fn peer_addrs(&self, peer: &PeerId) -> Vec<String> {
        lock(&self.shared.peerstore).get(peer).cloned().unwrap_or_default()
    }

    fn add_peer_addrs(&self, peer: &PeerId, addrs: &[String]) {
        if *peer == self.id {
            return;
        }
        add_addrs(&self.shared, peer, addrs);
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if lock(&self.shared.connected).contains_key(peer) {
            Connectedness::Connected
        } else if lock(&self.shared.peerstore).contains_key(peer) {
            Connectedness::CanConnect
        } else {
            Connectedness::NotConnected
        }
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<()> {
        self.add_peer_addrs(&peer.id, &peer.addrs);
        // A hello without protocols proves reachability and identity.
        self.dial(&peer.id, &[]).await.map(|_| ())
    }

    async fn new_stream(&self, peer: &PeerId, protocols: &[String]) -> Result<Box<dyn MessageStream>> {
        let (stream, protocol) = self.dial(peer, protocols).await?;
        if protocol.is_empty() {
            return Err(Error::ProtocolNotSupported {
                peer: peer.short(),
                protocols: protocols.to_vec(),
            });
        }
        Ok(Box::new(TcpMessageStream {
            stream,
            protocol,
            _live: LiveStream::open(&self.shared, *peer),
        }))
    }

    fn set_stream_handler(&self, protocols: Vec<String>, handler: Arc<dyn StreamHandler>) {
        *lock(&self.shared.registration) = Some((protocols, handler));
    }

    fn remove_stream_handler(&self) {
        lock(&self.shared.registration).take();
    }
}

struct TcpMessageStream {
    stream: TcpStream,
    protocol: String,
    _live: LiveStream,
}

/// Counts a peer as connected for as long as it is held
struct LiveStream {
    shared: Arc<Shared>,
    peer: PeerId,
}

impl LiveStream {
    fn open(shared: &Arc<Shared>, peer: PeerId) -> Self {
        *lock(&shared.connected).entry(peer).or_insert(0) += 1;
        Self {
            shared: shared.clone(),
            peer,
        }
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        let mut connected = lock(&self.shared.connected);
        if let Some(count) = connected.get_mut(&self.peer) {
            *count -= 1;
            if *count == 0 {
                connected.remove(&self.peer);
            }
        }
    }
}

#[async_trait]
impl MessageStream for TcpMessageStream {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn request(&mut self, payload: Vec<u8>) -> Result<Vec<u8>> {
        write_kind_frame(&mut self.stream, FrameKind::Request, &payload).await?;
        read_frame(&mut self.stream).await
    }

    async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        write_kind_frame(&mut self.stream, FrameKind::OneWay, &payload).await
    }
}

async fn accept_loop(id: PeerId, listen_addr: SocketAddr, listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(id, stream, shared).await {
                        tracing::debug!("inbound stream from {} ended: {}", remote, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("accept on {} failed: {}", listen_addr, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_stream(id: PeerId, mut stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let hello = Hello::decode(read_frame(&mut stream).await?.as_slice())?;
    let from = PeerId::try_from_slice(&hello.peer_id)?;
    if !hello.listen_addr.is_empty() {
        add_addrs(&shared, &from, &[hello.listen_addr.clone()]);
    }
    let _live = LiveStream::open(&shared, from);

    let registration = lock(&shared.registration).clone();
    let picked = registration
        .as_ref()
        .and_then(|(supported, handler)| negotiate(&hello.protocols, supported).map(|p| (p.clone(), handler.clone())));

    let ack = HelloAck {
        peer_id: id.to_vec(),
        protocol: picked.as_ref().map(|(p, _)| p.clone()).unwrap_or_default(),
    };
    write_frame(&mut stream, &ack.encode_to_vec()).await?;

    let Some((_, handler)) = picked else {
        return Ok(());
    };

    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some((&kind_byte, payload)) = frame.split_first() else {
            return Err(Error::Protocol("empty frame".to_string()));
        };
        let kind = FrameKind::from_byte(kind_byte)
            .ok_or_else(|| Error::Protocol(format!("unknown frame kind {}", kind_byte)))?;

        let reply = handler.handle_frame(from, payload.to_vec(), kind).await;
        if kind == FrameKind::Request {
            match reply {
                Some(reply) => write_frame(&mut stream, &reply).await?,
                None => return Err(Error::StreamReset("handler declined to reply".to_string())),
            }
        }
    }
}

async fn write_kind_frame(stream: &mut TcpStream, kind: FrameKind, payload: &[u8]) -> Result<()> {
    let mut body = Vec::with_capacity(payload.len() + 1);
    body.push(kind.to_byte());
    body.extend_from_slice(payload);
    write_frame(stream, &body).await
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

fn add_addrs(shared: &Shared, peer: &PeerId, addrs: &[String]) {
    if addrs.is_empty() {
        return;
    }
    let mut store = lock(&shared.peerstore);
    let known = store.entry(*peer).or_default();
    for addr in addrs {
        if !known.contains(addr) {
            known.push(addr.clone());
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl StreamHandler for Upper {
        async fn handle_frame(&self, _from: PeerId, payload: Vec<u8>, _kind: FrameKind) -> Option<Vec<u8>> {
            Some(payload.to_ascii_uppercase())
        }
    }

    #[tokio::test]
    async fn test_tcp_request_reply() {
        let a = TcpHost::bind(PeerId::random(), "127.0.0.1:0").await.unwrap();
        let b = TcpHost::bind(PeerId::random(), "127.0.0.1:0").await.unwrap();
        b.set_stream_handler(vec!["/up".to_string()], Arc::new(Upper));

        a.add_peer_addrs(&b.local_peer(), &b.listen_addrs());
        let mut stream = a.new_stream(&b.local_peer(), &["/up".to_string()]).await.unwrap();
        assert_eq!(stream.request(b"abc".to_vec()).await.unwrap(), b"ABC");
        assert_eq!(stream.request(b"xyz".to_vec()).await.unwrap(), b"XYZ");
        assert_eq!(a.connectedness(&b.local_peer()), Connectedness::Connected);
    }

    #[tokio::test]
    async fn test_tcp_protocol_mismatch() {
        let a = TcpHost::bind(PeerId::random(), "127.0.0.1:0").await.unwrap();
        let b = TcpHost::bind(PeerId::random(), "127.0.0.1:0").await.unwrap();
        b.set_stream_handler(vec!["/up".to_string()], Arc::new(Upper));

        a.add_peer_addrs(&b.local_peer(), &b.listen_addrs());
        let err = a.new_stream(&b.local_peer(), &["/down".to_string()]).await.err().unwrap();
        assert!(matches!(err, Error::ProtocolNotSupported { .. }));
    }

    #[tokio::test]
    async fn test_connectedness_follows_open_streams() {
        let a = TcpHost::bind(PeerId::random(), "127.0.0.1:0").await.unwrap();
        let b = TcpHost::bind(PeerId::random(), "127.0.0.1:0").await.unwrap();
        b.set_stream_handler(vec!["/up".to_string()], Arc::new(Upper));

        a.add_peer_addrs(&b.local_peer(), &b.listen_addrs());
        let mut stream = a.new_stream(&b.local_peer(), &["/up".to_string()]).await.unwrap();
        stream.request(b"hi".to_vec()).await.unwrap();
        assert_eq!(b.connectedness(&a.local_peer()), Connectedness::Connected);

        drop(stream);
        assert_eq!(a.connectedness(&b.local_peer()), Connectedness::CanConnect);

        let mut closed = false;
        for _ in 0..100 {
            if b.connectedness(&a.local_peer()) != Connectedness::Connected {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed);
        assert_eq!(b.connectedness(&a.local_peer()), Connectedness::CanConnect);
    }

    #[tokio::test]
    async fn test_tcp_rejects_wrong_peer_id() {
        let a = TcpHost::bind(PeerId::random(), "127.0.0.1:0").await.unwrap();
        let b = TcpHost::bind(PeerId::random(), "127.0.0.1:0").await.unwrap();

        let impostor = PeerInfo::new(PeerId::random(), b.listen_addrs());
        assert!(a.connect(&impostor).await.is_err());
    }
}
