//! Request/response correlation.
//!
//! Every outbound request gets a fresh id and an outstanding record. A
//! record is destroyed exactly once: by its response, by a timeout, by a
//! newer request on the same trigger slot, or by session teardown.

use crate::error::BridgeError;
use crate::messages::RawReply;
use crate::transport::{JsonRpcResponse, RequestId};
use crate::types::TriggerSlot;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Pending request info.
struct OutstandingRequest {
    method: &'static str,
    slot: Option<TriggerSlot>,
    issued_at: Instant,
    completion: RawReply,
}

impl OutstandingRequest {
    fn complete(self, id: &RequestId, outcome: Result<Option<serde_json::Value>, BridgeError>) {
        log::debug!(
            "{} {:?} finished after {:?}: {}",
            self.method,
            id,
            self.issued_at.elapsed(),
            match &outcome {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            }
        );
        // The caller may have given up waiting; that is fine.
        let _ = self.completion.send(outcome);
    }
}

/// Registry of outstanding requests.
pub(crate) struct Correlator {
    next_id: i64,
    pending: HashMap<RequestId, OutstandingRequest>,
    slots: HashMap<TriggerSlot, RequestId>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            slots: HashMap::new(),
        }
    }

    /// Allocates a request id. Ids are never reused.
    pub(crate) fn next_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        RequestId::Number(id)
    }

    /// Records an outstanding request.
    ///
    /// If the slot already holds a request, that request is completed with
    /// `Superseded` and its id is returned so the server can be told.
    pub(crate) fn register(
        &mut self,
        id: RequestId,
        method: &'static str,
        slot: Option<TriggerSlot>,
        completion: RawReply,
    ) -> Option<RequestId> {
        let superseded = slot
            .and_then(|slot| self.slots.insert(slot, id.clone()))
            .and_then(|old_id| {
                let old = self.pending.remove(&old_id)?;
                old.complete(&old_id, Err(BridgeError::Superseded));
                Some(old_id)
            });

        self.pending.insert(
            id,
            OutstandingRequest {
                method,
                slot,
                issued_at: Instant::now(),
                completion,
            },
        );
        superseded
    }

    /// Completes the request a response belongs to.
    ///
    /// Returns false for ids that are no longer tracked; such responses are
    /// dropped.
    pub(crate) fn resolve(&mut self, response: JsonRpcResponse) -> bool {
        let Some(request) = self.remove(&response.id) else {
            log::debug!("Dropping response for untracked request {:?}", response.id);
            return false;
        };

        let outcome = match response.error {
            Some(error) => Err(BridgeError::Server {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result),
        };
        request.complete(&response.id, outcome);
        true
    }

    /// Fails a request that got no response within `after`.
    pub(crate) fn expire(&mut self, id: &RequestId, after: Duration) -> bool {
        self.fail(id, BridgeError::RequestTimeout(after))
    }

    /// Fails a single request.
    pub(crate) fn fail(&mut self, id: &RequestId, error: BridgeError) -> bool {
        match self.remove(id) {
            Some(request) => {
                request.complete(id, Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding request. Returns how many there were.
    pub(crate) fn cancel_all(&mut self, error: BridgeError) -> usize {
        self.slots.clear();
        let count = self.pending.len();
        for (id, request) in self.pending.drain() {
            request.complete(&id, Err(error.clone()));
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    fn remove(&mut self, id: &RequestId) -> Option<OutstandingRequest> {
        let request = self.pending.remove(id)?;
        if let Some(slot) = request.slot {
            if self.slots.get(&slot) == Some(id) {
                self.slots.remove(&slot);
            }
        }
        Some(request)
    }
}
