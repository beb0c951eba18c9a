//! The remote-call fabric.
//!
//! Processes talk to each other with small self-describing CBOR envelopes
//! (`[type_id, ...]` arrays carrying requests, responses, and notifications)
//! over two transports:
//!
//! * [`SocketNode`] — identity-addressed multipart messages over TCP or Unix
//!   sockets, in dealer/router/pub/sub flavors. Dealers connect to a
//!   [`Router`], which forwards `[recipient, payload]` frames between its two
//!   sides by identity.
//! * [`DatagramNode`] — UDP, bound for receivers (with multicast group
//!   membership when the address calls for it) or connected for senders.
//!
//! On top of the nodes sit [`Client`] (request/response with a
//! [`RequestTracker`] of outstanding ids) and [`Service`] (a worker pool
//! dispatching into a [`MethodMap`] built at construction).

mod client;
mod datagram;
mod envelope;
mod handler;
mod node;
mod router;
mod service;
mod socket;
mod tracker;

pub use client::Client;
pub use datagram::DatagramNode;
pub use envelope::{decode_call, encode_call, Call, RemoteError};
pub use handler::{Handler, MethodMap};
pub use node::{Address, Node};
pub use router::Router;
pub use service::Service;
pub use socket::{SocketKind, SocketNode};
pub use tracker::RequestTracker;

use std::time::Duration;

use thiserror::Error;

/// Default timeout for a single outbound send.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// Default timeout for a request's response.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-method execution timeout inside a service.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote-call failures.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport is closed")]
    Closed,
    #[error("node transport reopened")]
    Reopened,
    #[error("transport does not support recv")]
    CannotRecv,
    #[error("must provide an address")]
    MissingAddress,
    #[error("request timed out")]
    Timeout,
    #[error("unable to generate a request id")]
    IdExhausted,
    #[error("request id already in flight")]
    IdCollision,
    #[error("unexpected response id")]
    UnknownResponse,
    #[error("malformed call payload: {0}")]
    Malformed(String),
    #[error("invalid address {0:?}")]
    Address(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
