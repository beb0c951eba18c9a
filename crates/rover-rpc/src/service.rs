//! The request-answering endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::{decode_call, encode_call, Call};
use crate::handler::MethodMap;
use crate::node::Node;
use crate::{RpcError, DISPATCH_TIMEOUT};

/// Answers requests (and consumes notifications) arriving on a node.
///
/// `concurrency` worker tasks race to receive, so requests pipeline; the
/// node's bounded queue buffers any excess. Notifications never produce a
/// response.
pub struct Service {
    node: Arc<dyn Node>,
    workers: Vec<JoinHandle<()>>,
}

impl Service {
    pub fn start(node: Arc<dyn Node>, methods: MethodMap, concurrency: usize) -> Self {
        Self::start_with_timeout(node, methods, concurrency, DISPATCH_TIMEOUT)
    }

    pub fn start_with_timeout(
        node: Arc<dyn Node>,
        methods: MethodMap,
        concurrency: usize,
        dispatch_timeout: Duration,
    ) -> Self {
        let workers = (0..concurrency.max(1))
            .map(|_| {
                let node = Arc::clone(&node);
                let methods = methods.clone();
                tokio::spawn(async move {
                    loop {
                        let (frames, address) = match node.recv().await {
                            Ok(segments) => segments,
                            Err(RpcError::Closed) => break,
                            Err(err) => {
                                debug!(%err, "service receive failed");
                                continue;
                            }
                        };
                        let Some(payload) = frames.first() else {
                            continue;
                        };
                        match decode_call(payload) {
                            Ok(Call::Request {
                                request_id,
                                method,
                                args,
                            }) => {
                                let outcome =
                                    methods.dispatch(&method, args, dispatch_timeout).await;
                                let (error, result) = match outcome {
                                    Ok(result) => (None, result),
                                    Err(error) => {
                                        warn!(%method, %error, "service method failed");
                                        (Some(error), serde_json::Value::Null)
                                    }
                                };
                                let response = Call::Response {
                                    request_id,
                                    error,
                                    result,
                                };
                                match encode_call(&response) {
                                    Ok(payload) => {
                                        if let Err(err) =
                                            node.send(vec![payload], Some(&address)).await
                                        {
                                            warn!(%err, "service failed to respond");
                                        }
                                    }
                                    Err(err) => warn!(%err, "service failed to encode response"),
                                }
                            }
                            Ok(Call::Notification { method, args }) => {
                                if let Err(error) =
                                    methods.dispatch(&method, args, dispatch_timeout).await
                                {
                                    warn!(%method, %error, "notification handler failed");
                                }
                            }
                            Ok(Call::Response { .. }) => {
                                warn!("service does not accept RESPONSE messages");
                            }
                            Err(err) => warn!(%err, "service failed to decode payload"),
                        }
                    }
                })
            })
            .collect();
        Self { node, workers }
    }

    pub async fn close(&self) {
        self.node.close().await;
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}
