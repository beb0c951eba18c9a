//! The node abstraction: a transceiver of discrete multipart binary messages.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::RpcError;

/// Sanity cap on a single message part.
const MAX_PART_SIZE: usize = 16 << 20;

/// Data segments plus a transport-dependent sender/recipient address
/// (a socket identity, a pub/sub topic, or a datagram peer rendered as text).
pub type Segments = (Vec<Vec<u8>>, Vec<u8>);

/// A transceiver of discrete binary messages wrapping some transport.
///
/// Sends that fail or time out close and reopen the underlying transport to
/// reset its state, surfacing [`RpcError::Reopened`]; endpoints log the error
/// and retry past it. Receivers drain a bounded queue fed by a background
/// task.
#[async_trait]
pub trait Node: Send + Sync {
    /// Send one message. The semantics of `address` depend on the transport.
    async fn send(&self, parts: Vec<Vec<u8>>, address: Option<&[u8]>) -> Result<(), RpcError>;

    /// Receive one message.
    async fn recv(&self) -> Result<Segments, RpcError>;

    /// Whether this node can receive at all (`PUB` sockets cannot).
    fn can_recv(&self) -> bool;

    /// Close the transport. Further operations fail with [`RpcError::Closed`].
    async fn close(&self);
}

/// A parsed transport address: `tcp://host:port` or `ipc:///path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp(String),
    Ipc(PathBuf),
}

impl FromStr for Address {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            if rest.is_empty() || !rest.contains(':') {
                return Err(RpcError::Address(s.to_owned()));
            }
            return Ok(Self::Tcp(rest.to_owned()));
        }
        if let Some(rest) = s.strip_prefix("ipc://") {
            if rest.is_empty() {
                return Err(RpcError::Address(s.to_owned()));
            }
            return Ok(Self::Ipc(PathBuf::from(rest)));
        }
        Err(RpcError::Address(s.to_owned()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(hostport) => write!(f, "tcp://{hostport}"),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// Write one multipart message: a part count, then a length-prefixed body per
/// part.
pub(crate) async fn write_multipart<W>(writer: &mut W, parts: &[&[u8]]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(parts.len() <= u8::MAX as usize);
    writer.write_u8(parts.len() as u8).await?;
    for part in parts {
        writer.write_u32_le(part.len() as u32).await?;
        writer.write_all(part).await?;
    }
    writer.flush().await
}

/// Read one multipart message.
pub(crate) async fn read_multipart<R>(reader: &mut R) -> std::io::Result<Vec<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u8().await?;
    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32_le().await? as usize;
        if len > MAX_PART_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message part of {len} bytes exceeds cap"),
            ));
        }
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses() {
        assert_eq!(
            "tcp://127.0.0.1:6000".parse::<Address>().unwrap(),
            Address::Tcp("127.0.0.1:6000".into())
        );
        assert_eq!(
            "ipc:///tmp/rover.sock".parse::<Address>().unwrap(),
            Address::Ipc(PathBuf::from("/tmp/rover.sock"))
        );
        assert!("udp://127.0.0.1:1".parse::<Address>().is_err());
        assert!("tcp://".parse::<Address>().is_err());
    }

    #[tokio::test]
    async fn multipart_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_multipart(&mut a, &[b"hello", b"", b"world"])
            .await
            .unwrap();
        let parts = read_multipart(&mut b).await.unwrap();
        assert_eq!(parts, vec![b"hello".to_vec(), Vec::new(), b"world".to_vec()]);
    }
}
