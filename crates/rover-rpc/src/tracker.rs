//! Outstanding-request bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use tokio::sync::oneshot;

use crate::RpcError;

const ID_ATTEMPTS: usize = 10;

/// Maps in-flight request ids to one-shot completion handles.
///
/// Call clients use the full 32-bit id space; device heartbeats reuse the
/// same structure with an 8-bit space.
pub struct RequestTracker<T> {
    pending: Mutex<HashMap<u32, oneshot::Sender<T>>>,
    upper: u32,
}

impl<T> RequestTracker<T> {
    /// A tracker over ids in `0..=upper`.
    pub fn new(upper: u32) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            upper,
        }
    }

    /// Register a new request, generating a fresh id unless one is supplied.
    ///
    /// Random ids collide only when the in-flight set nears the id space;
    /// generation retries a bounded number of times before giving up.
    pub fn register(
        &self,
        request_id: Option<u32>,
    ) -> Result<(u32, oneshot::Receiver<T>), RpcError> {
        let mut pending = self.pending.lock().unwrap();
        let request_id = match request_id {
            Some(id) => {
                if pending.contains_key(&id) {
                    return Err(RpcError::IdCollision);
                }
                id
            }
            None => {
                let mut rng = rand::thread_rng();
                (0..ID_ATTEMPTS)
                    .map(|_| rng.gen_range(0..=self.upper))
                    .find(|candidate| !pending.contains_key(candidate))
                    .ok_or(RpcError::IdExhausted)?
            }
        };
        let (tx, rx) = oneshot::channel();
        pending.insert(request_id, tx);
        Ok((request_id, rx))
    }

    /// Complete a request. Fails if the id is unknown (or already resolved).
    pub fn resolve(&self, request_id: u32, value: T) -> Result<(), RpcError> {
        let tx = self
            .pending
            .lock()
            .unwrap()
            .remove(&request_id)
            .ok_or(RpcError::UnknownResponse)?;
        // The waiter may have timed out and dropped its receiver.
        let _ = tx.send(value);
        Ok(())
    }

    /// Forget a request (the waiter gave up).
    pub fn discard(&self, request_id: u32) {
        self.pending.lock().unwrap().remove(&request_id);
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
