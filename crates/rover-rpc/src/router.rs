//! The stateless two-socket forwarder.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::node::{Address, Node};
use crate::socket::SocketNode;
use crate::RpcError;

/// Routes `[recipient, payload]` frames between clients (frontend) and
/// services (backend) by identity.
///
/// The router keeps no state about requests; unreachable recipients are
/// silently dropped and clients rely on timeouts. Payloads stay opaque.
pub struct Router {
    frontend: Arc<SocketNode>,
    backend: Arc<SocketNode>,
    tasks: Vec<JoinHandle<()>>,
}

impl Router {
    /// Bind both sides and start forwarding in both directions.
    pub async fn bind(frontend: &[Address], backend: &[Address]) -> Result<Self, RpcError> {
        let frontend = Arc::new(SocketNode::router(frontend, b"router-frontend").await?);
        let backend = Arc::new(SocketNode::router(backend, b"router-backend").await?);
        let tasks = vec![
            tokio::spawn(route(Arc::clone(&frontend), Arc::clone(&backend))),
            tokio::spawn(route(Arc::clone(&backend), Arc::clone(&frontend))),
        ];
        info!(
            frontend = ?frontend.local_addresses(),
            backend = ?backend.local_addresses(),
            "router started"
        );
        Ok(Self {
            frontend,
            backend,
            tasks,
        })
    }

    pub fn frontend(&self) -> &Arc<SocketNode> {
        &self.frontend
    }

    pub fn backend(&self) -> &Arc<SocketNode> {
        &self.backend
    }

    pub async fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.frontend.close().await;
        self.backend.close().await;
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Forward one direction. Each inbound message is `[recipient, payload]`
/// from `sender`; the outbound message is `[sender, payload]` to
/// `recipient` on the opposite socket.
async fn route(recv_socket: Arc<SocketNode>, send_socket: Arc<SocketNode>) {
    loop {
        let (frames, sender) = match recv_socket.recv().await {
            Ok(segments) => segments,
            Err(RpcError::Closed) => break,
            Err(err) => {
                warn!(%err, "router receive failed");
                continue;
            }
        };
        let [recipient, payload] = frames.as_slice() else {
            warn!(
                sender = %String::from_utf8_lossy(&sender),
                frames = frames.len(),
                "router expects two-frame messages"
            );
            continue;
        };
        if *recipient == sender {
            warn!(sender = %String::from_utf8_lossy(&sender), "loopback not allowed");
            continue;
        }
        debug!(
            sender = %String::from_utf8_lossy(&sender),
            recipient = %String::from_utf8_lossy(recipient),
            "routing message"
        );
        if let Err(err) = send_socket
            .send(vec![sender.clone(), payload.clone()], Some(recipient))
            .await
        {
            warn!(%err, "router failed to forward");
        }
    }
}
