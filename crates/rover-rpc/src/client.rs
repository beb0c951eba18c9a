//! The request-issuing endpoint.

use std::sync::Arc;

use serde_json::Value as Json;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::envelope::{decode_call, encode_call, Call, RemoteError};
use crate::node::Node;
use crate::tracker::RequestTracker;
use crate::{RpcError, CALL_TIMEOUT};

/// Issues remote calls over a node and matches responses to requests by id.
///
/// A background worker drains the node; requests and their reply futures
/// meet in a [`RequestTracker`]. Nodes that cannot receive (publishers,
/// connected datagram senders with no bind) degrade every call to a
/// notification.
pub struct Client {
    node: Arc<dyn Node>,
    tracker: Arc<RequestTracker<Result<Json, RemoteError>>>,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new(node: Arc<dyn Node>) -> Self {
        let tracker = Arc::new(RequestTracker::new(u32::MAX));
        let worker = node.can_recv().then(|| {
            let node = Arc::clone(&node);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                loop {
                    let (frames, _address) = match node.recv().await {
                        Ok(segments) => segments,
                        Err(RpcError::Closed) => break,
                        Err(err) => {
                            debug!(%err, "client receive failed");
                            continue;
                        }
                    };
                    let Some(payload) = frames.first() else {
                        continue;
                    };
                    match decode_call(payload) {
                        Ok(Call::Response {
                            request_id,
                            error,
                            result,
                        }) => {
                            let outcome = match error {
                                Some(error) => Err(error),
                                None => Ok(result),
                            };
                            if tracker.resolve(request_id, outcome).is_err() {
                                debug!(request_id, "unexpected response id");
                            }
                        }
                        Ok(_) => warn!("client only receives RESPONSE messages"),
                        Err(err) => warn!(%err, "client failed to decode payload"),
                    }
                }
            })
        });
        Self {
            node,
            tracker,
            worker,
        }
    }

    /// Issue a request and wait for its response (with the default timeout).
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Json>,
        address: Option<&[u8]>,
    ) -> Result<Json, RpcError> {
        self.call_with_timeout(method, args, address, CALL_TIMEOUT)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Json>,
        address: Option<&[u8]>,
        deadline: std::time::Duration,
    ) -> Result<Json, RpcError> {
        if self.worker.is_none() {
            // Send-only transports can only notify.
            self.notify(method, args, address).await?;
            return Ok(Json::Null);
        }
        let (request_id, reply) = self.tracker.register(None)?;
        let payload = encode_call(&Call::Request {
            request_id,
            method: method.to_owned(),
            args,
        })?;
        if let Err(err) = self.node.send(vec![payload], address).await {
            self.tracker.discard(request_id);
            return Err(err);
        }
        match timeout(deadline, reply).await {
            Ok(Ok(outcome)) => outcome.map_err(RpcError::Remote),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.tracker.discard(request_id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Send a notification; no response will ever arrive.
    pub async fn notify(
        &self,
        method: &str,
        args: Vec<Json>,
        address: Option<&[u8]>,
    ) -> Result<(), RpcError> {
        let payload = encode_call(&Call::Notification {
            method: method.to_owned(),
            args,
        })?;
        self.node.send(vec![payload], address).await
    }

    pub async fn close(&self) {
        self.node.close().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}
