//! UDP datagram nodes, with multicast membership for group addresses.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::node::{Node, Segments};
use crate::RpcError;

const RECV_QUEUE_SIZE: usize = 128;
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Parse `udp://host:port`.
fn parse(address: &str) -> Result<SocketAddr, RpcError> {
    let rest = address
        .strip_prefix("udp://")
        .ok_or_else(|| RpcError::Address(address.to_owned()))?;
    rest.parse()
        .map_err(|_| RpcError::Address(address.to_owned()))
}

/// Build a UDP socket with the reuse options needed for several runtime
/// processes (and tooling) to share one bound port.
fn reusable_socket(bind: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        let optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&one as *const libc::c_int).cast(),
            optlen,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            (&one as *const libc::c_int).cast(),
            optlen,
        );
        let SocketAddr::V4(v4) = bind else {
            libc::close(fd);
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "only IPv4 datagram addresses are supported",
            ));
        };
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: v4.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            (&addr as *const libc::sockaddr_in).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        let socket = std::net::UdpSocket::from_raw_fd(fd);
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

/// A UDP transceiver. Receivers bind (joining the multicast group when the
/// address is one); senders connect.
pub struct DatagramNode {
    socket: Arc<UdpSocket>,
    connected: bool,
    recv_rx: Mutex<mpsc::Receiver<Segments>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DatagramNode {
    /// Build a node from a `udp://host:port` address.
    pub async fn from_address(address: &str, bind: bool) -> Result<Self, RpcError> {
        let target = parse(address)?;
        let (socket, connected) = if bind {
            let multicast = match target.ip() {
                std::net::IpAddr::V4(ip) => ip.is_multicast().then_some(ip),
                _ => None,
            };
            // Multicast listeners bind the wildcard address on the group's
            // port; unicast listeners bind the address itself.
            let bind_addr = match multicast {
                Some(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, target.port())),
                None => target,
            };
            let socket = UdpSocket::from_std(reusable_socket(bind_addr)?)?;
            if let Some(group) = multicast {
                socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
                socket.set_multicast_ttl_v4(1)?;
            }
            (socket, false)
        } else {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
            socket.connect(target).await?;
            if let std::net::IpAddr::V4(ip) = target.ip() {
                if ip.is_multicast() {
                    socket.set_multicast_ttl_v4(1)?;
                }
            }
            (socket, true)
        };

        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_SIZE);
        let node = Self {
            socket: Arc::new(socket),
            connected,
            recv_rx: Mutex::new(recv_rx),
            reader: StdMutex::new(None),
            closed: AtomicBool::new(false),
        };
        // Even connected senders receive: a service they call responds
        // straight to this socket's ephemeral port.
        node.spawn_reader(recv_tx);
        Ok(node)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn spawn_reader(&self, recv_tx: mpsc::Sender<Segments>) {
        let socket = Arc::clone(&self.socket);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, peer)) => {
                        let segments = (
                            vec![buf[..len].to_vec()],
                            peer.to_string().into_bytes(),
                        );
                        if recv_tx.send(segments).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(%err, "datagram reader stopped");
                        break;
                    }
                }
            }
        });
        *self.reader.lock().unwrap() = Some(task);
    }
}

#[async_trait]
impl Node for DatagramNode {
    async fn send(&self, parts: Vec<Vec<u8>>, address: Option<&[u8]>) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        let target: Option<SocketAddr> = match address {
            Some(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| RpcError::Address(format!("{bytes:?}")))?;
                Some(text.parse().map_err(|_| RpcError::Address(text.to_owned()))?)
            }
            None => None,
        };
        for part in &parts {
            match (target, self.connected) {
                (Some(peer), _) => self.socket.send_to(part, peer).await?,
                (None, true) => self.socket.send(part).await?,
                (None, false) => return Err(RpcError::MissingAddress),
            };
        }
        Ok(())
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
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.reader.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for DatagramNode {
    fn drop(&mut self) {
        if let Some(task) = self.reader.lock().unwrap().take() {
            task.abort();
        }
    }
}
