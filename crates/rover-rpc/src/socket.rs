//! Identity-addressed message sockets over TCP or Unix streams.
//!
//! Four kinds mirror the classic messaging shapes:
//!
//! * `Dealer` — connects to a router side, greets with its identity, sends
//!   `[recipient, payload…]`, receives `(payload…, sender)`.
//! * `Router` — binds, learns peer identities from their greeting, delivers
//!   `(frames, sender)` and sends frames verbatim to a named peer.
//! * `Pub` — binds; fans every `[topic, payload…]` out to subscribers whose
//!   subscription prefix-matches the topic. Cannot receive.
//! * `Sub` — connects with a set of topic subscriptions in its greeting,
//!   receives `(payload…, "")`. Cannot send.
//!
//! A failed or timed-out send tears the connection down, reopens it, and
//! surfaces [`RpcError::Reopened`] so callers know the message may be lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::node::{read_multipart, write_multipart, Address, Node, Segments};
use crate::{RpcError, SEND_TIMEOUT};

const RECV_QUEUE_SIZE: usize = 128;
const PEER_QUEUE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Dealer,
    Router,
    Pub,
    Sub,
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}
type BoxedIo = Box<dyn Io>;

async fn dial(address: &Address) -> std::io::Result<BoxedIo> {
    Ok(match address {
        Address::Tcp(hostport) => Box::new(TcpStream::connect(hostport.as_str()).await?),
        Address::Ipc(path) => Box::new(UnixStream::connect(path).await?),
    })
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn bind(address: &Address) -> std::io::Result<(Self, Address)> {
        match address {
            Address::Tcp(hostport) => {
                let listener = TcpListener::bind(hostport.as_str()).await?;
                let local = Address::Tcp(listener.local_addr()?.to_string());
                Ok((Self::Tcp(listener), local))
            }
            Address::Ipc(path) => {
                // A stale socket file from a previous run blocks the bind.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                Ok((Self::Unix(listener), Address::Ipc(path.clone())))
            }
        }
    }

    async fn accept(&self) -> std::io::Result<BoxedIo> {
        Ok(match self {
            Self::Tcp(listener) => Box::new(listener.accept().await?.0),
            Self::Unix(listener) => Box::new(listener.accept().await?.0),
        })
    }
}

/// One connected peer of a bound socket.
struct Peer {
    tx: mpsc::Sender<Vec<Vec<u8>>>,
    topics: Vec<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

type Peers = Arc<Mutex<HashMap<Vec<u8>, Peer>>>;

/// The connect-side link (dealer/sub).
#[derive(Default)]
struct Link {
    writer: Option<WriteHalf<BoxedIo>>,
    reader: Option<JoinHandle<()>>,
}

pub struct SocketNode {
    kind: SocketKind,
    identity: Vec<u8>,
    /// Connect target (dealer/sub).
    target: Option<Address>,
    /// Resolved bind addresses (router/pub).
    local: Vec<Address>,
    subscriptions: Vec<Vec<u8>>,
    send_timeout: Duration,
    link: Mutex<Link>,
    peers: Peers,
    recv_tx: mpsc::Sender<Segments>,
    recv_rx: Mutex<mpsc::Receiver<Segments>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SocketNode {
    fn new(kind: SocketKind, identity: Vec<u8>) -> Self {
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_SIZE);
        Self {
            kind,
            identity,
            target: None,
            local: Vec::new(),
            subscriptions: Vec::new(),
            send_timeout: SEND_TIMEOUT,
            link: Mutex::new(Link::default()),
            peers: Arc::new(Mutex::new(HashMap::new())),
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            tasks: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Resolved bind addresses (useful when binding port 0).
    pub fn local_addresses(&self) -> &[Address] {
        &self.local
    }

    /// Connect a dealer to a router side.
    pub async fn dealer(address: Address, identity: &[u8]) -> Result<Self, RpcError> {
        let mut node = Self::new(SocketKind::Dealer, identity.to_vec());
        node.target = Some(address);
        node.open_link(&mut *node.link.lock().await).await?;
        Ok(node)
    }

    /// Connect a subscriber. Empty `topics` subscribes to everything.
    pub async fn subscriber(
        address: Address,
        identity: &[u8],
        topics: &[&[u8]],
    ) -> Result<Self, RpcError> {
        let mut node = Self::new(SocketKind::Sub, identity.to_vec());
        node.target = Some(address);
        node.subscriptions = topics.iter().map(|t| t.to_vec()).collect();
        if node.subscriptions.is_empty() {
            node.subscriptions.push(Vec::new());
        }
        node.open_link(&mut *node.link.lock().await).await?;
        Ok(node)
    }

    /// Bind a router socket to one or more addresses.
    pub async fn router(addresses: &[Address], identity: &[u8]) -> Result<Self, RpcError> {
        Self::bind(SocketKind::Router, addresses, identity).await
    }

    /// Bind a publisher socket.
    pub async fn publisher(addresses: &[Address], identity: &[u8]) -> Result<Self, RpcError> {
        Self::bind(SocketKind::Pub, addresses, identity).await
    }

    async fn bind(
        kind: SocketKind,
        addresses: &[Address],
        identity: &[u8],
    ) -> Result<Self, RpcError> {
        let mut node = Self::new(kind, identity.to_vec());
        let mut tasks = Vec::new();
        for address in addresses {
            let (listener, local) = Listener::bind(address).await?;
            node.local.push(local);
            let peers = Arc::clone(&node.peers);
            let recv_tx = node.recv_tx.clone();
            tasks.push(tokio::spawn(accept_loop(kind, listener, peers, recv_tx)));
        }
        *node.tasks.lock().unwrap() = tasks;
        Ok(node)
    }

    /// (Re)connect the dealer/sub link and restart its reader.
    async fn open_link(&self, link: &mut Link) -> Result<(), RpcError> {
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        let target = self.target.as_ref().ok_or(RpcError::Closed)?;
        let io = dial(target).await?;
        let (mut read_half, mut write_half) = tokio::io::split(io);

        // Greeting: our identity, plus subscriptions for SUB sockets.
        let mut greeting: Vec<&[u8]> = vec![&self.identity];
        greeting.extend(self.subscriptions.iter().map(Vec::as_slice));
        timeout(self.send_timeout, write_multipart(&mut write_half, &greeting))
            .await
            .map_err(|_| RpcError::Timeout)??;

        let kind = self.kind;
        let recv_tx = self.recv_tx.clone();
        link.reader = Some(tokio::spawn(async move {
            loop {
                match read_multipart(&mut read_half).await {
                    Ok(parts) if parts.is_empty() => continue,
                    Ok(mut parts) => {
                        let first = parts.remove(0);
                        let address = match kind {
                            SocketKind::Sub => Vec::new(),
                            _ => first,
                        };
                        if recv_tx.send((parts, address)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(%err, "socket reader stopped");
                        break;
                    }
                }
            }
        }));
        link.writer = Some(write_half);
        Ok(())
    }

    async fn send_connected(
        &self,
        parts: Vec<Vec<u8>>,
        address: Option<&[u8]>,
    ) -> Result<(), RpcError> {
        let address = address.ok_or(RpcError::MissingAddress)?;
        let mut link = self.link.lock().await;
        if link.writer.is_none() {
            self.open_link(&mut link).await?;
        }
        let writer = link.writer.as_mut().expect("link was just opened");
        let mut all: Vec<&[u8]> = vec![address];
        all.extend(parts.iter().map(Vec::as_slice));
        match timeout(self.send_timeout, write_multipart(writer, &all)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => debug!(%err, "socket send failed"),
            Err(_) => debug!("socket send timed out"),
        }
        // Reset the transport; the message is considered lost.
        link.writer = None;
        if let Err(err) = self.open_link(&mut link).await {
            warn!(%err, "socket reopen failed");
        }
        Err(RpcError::Reopened)
    }

    async fn send_router(&self, parts: Vec<Vec<u8>>, address: Option<&[u8]>) -> Result<(), RpcError> {
        let address = address.ok_or(RpcError::MissingAddress)?;
        let peers = self.peers.lock().await;
        let Some(peer) = peers.get(address) else {
            // Unreachable recipients are dropped; clients rely on timeouts.
            debug!(recipient = %String::from_utf8_lossy(address), "dropping message for unknown peer");
            return Ok(());
        };
        if timeout(self.send_timeout, peer.tx.send(parts)).await.is_err() {
            return Err(RpcError::Timeout);
        }
        Ok(())
    }

    async fn send_pub(&self, parts: Vec<Vec<u8>>, address: Option<&[u8]>) -> Result<(), RpcError> {
        let topic = address.ok_or(RpcError::MissingAddress)?;
        let mut message = Vec::with_capacity(parts.len() + 1);
        message.push(topic.to_vec());
        message.extend(parts);
        let peers = self.peers.lock().await;
        for peer in peers.values() {
            if peer
                .topics
                .iter()
                .any(|prefix| topic.starts_with(prefix.as_slice()))
            {
                // Slow subscribers lose messages rather than stalling the publisher.
                let _ = peer.tx.try_send(message.clone());
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    kind: SocketKind,
    listener: Listener,
    peers: Peers,
    recv_tx: mpsc::Sender<Segments>,
) {
    loop {
        let io = match listener.accept().await {
            Ok(io) => io,
            Err(err) => {
                warn!(%err, "socket accept failed");
                continue;
            }
        };
        let peers = Arc::clone(&peers);
        let recv_tx = recv_tx.clone();
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = tokio::io::split(io);
            let Ok(greeting) = read_multipart(&mut read_half).await else {
                return;
            };
            let Some(identity) = greeting.first().cloned() else {
                return;
            };
            let topics = greeting[1..].to_vec();

            let (tx, mut rx) = mpsc::channel::<Vec<Vec<u8>>>(PEER_QUEUE_SIZE);
            let writer_task = tokio::spawn(async move {
                while let Some(parts) = rx.recv().await {
                    let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
                    if write_multipart(&mut write_half, &refs).await.is_err() {
                        break;
                    }
                }
            });
            let probe = tx.clone();
            {
                let mut peers = peers.lock().await;
                // Identity handover: the newest connection wins.
                if let Some(old) = peers.insert(
                    identity.clone(),
                    Peer {
                        tx,
                        topics,
                        tasks: vec![writer_task],
                    },
                ) {
                    for task in old.tasks {
                        task.abort();
                    }
                }
            }
            debug!(peer = %String::from_utf8_lossy(&identity), "socket peer connected");

            loop {
                match read_multipart(&mut read_half).await {
                    Ok(parts) if parts.is_empty() => continue,
                    Ok(parts) => {
                        if kind == SocketKind::Router
                            && recv_tx.send((parts, identity.clone())).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            let mut peers = peers.lock().await;
            if peers
                .get(&identity)
                .is_some_and(|peer| peer.tx.same_channel(&probe))
            {
                if let Some(peer) = peers.remove(&identity) {
                    for task in peer.tasks {
                        task.abort();
                    }
                }
                debug!(peer = %String::from_utf8_lossy(&identity), "socket peer disconnected");
            }
        });
    }
}

#[async_trait]
impl Node for SocketNode {
    async fn send(&self, parts: Vec<Vec<u8>>, address: Option<&[u8]>) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        match self.kind {
            SocketKind::Dealer => self.send_connected(parts, address).await,
            SocketKind::Router => self.send_router(parts, address).await,
            SocketKind::Pub => self.send_pub(parts, address).await,
            SocketKind::Sub => Err(RpcError::Closed),
        }
    }

    async fn recv(&self) -> Result<Segments, RpcError> {
        if !self.can_recv() {
            return Err(RpcError::CannotRecv);
        }
        self.recv_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(RpcError::Closed)
    }

    fn can_recv(&self) -> bool {
        self.kind != SocketKind::Pub && !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let mut link = self.link.lock().await;
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        link.writer = None;
        let mut peers = self.peers.lock().await;
        for (_, peer) in peers.drain() {
            for task in peer.tasks {
                task.abort();
            }
        }
    }
}

impl Drop for SocketNode {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
