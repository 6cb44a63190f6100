// src/communication/request_channel.rs - Per-device request/response correlation
//
// Owned by exactly one device task. Requests wait in a bounded queue, are
// written one at a time, and are matched back by id regardless of reply order.
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::communication::protocol::{Method, Reply, Response};
use crate::error::RequestError;

/// Ids wrap here; the firmware does the same.
pub const REQUEST_ID_WRAP: u32 = 300_000;

pub type RequestResult = Result<Reply, RequestError>;

/// Work the device task issues on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalRequest {
    Info,
    StatusPoll,
    Parking { job: u64 },
    /// Fire-and-forget housekeeping (stop assist, stop feed).
    Housekeeping,
}

/// Where a completed request's outcome goes. Consumed exactly once.
#[derive(Debug)]
pub enum Responder {
    Caller(oneshot::Sender<RequestResult>),
    Internal(InternalRequest),
}

#[derive(Debug)]
struct PendingRequest {
    method: Method,
    responder: Responder,
    issued_at: Instant,
    timeout: Duration,
    dispatched: bool,
}

/// A request that reached its terminal state.
#[derive(Debug)]
pub struct Completion {
    pub id: u32,
    pub method: Method,
    pub responder: Responder,
    pub result: RequestResult,
}

impl Completion {
    /// Hand the outcome to a caller. Internal completions are returned so the
    /// device task can act on them.
    pub fn deliver(self) -> Option<(InternalRequest, Method, RequestResult)> {
        match self.responder {
            Responder::Caller(tx) => {
                if tx.send(self.result).is_err() {
                    tracing::trace!("Caller for request {} went away", self.id);
                }
                None
            }
            Responder::Internal(kind) => Some((kind, self.method, self.result)),
        }
    }
}

#[derive(Debug)]
pub struct QueueFull;

#[derive(Debug)]
pub struct RequestChannel {
    capacity: usize,
    next_id: u32,
    queue: VecDeque<u32>,
    pending: HashMap<u32, PendingRequest>,
}

impl RequestChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: 0,
            queue: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    /// Queue a request. Never blocks; fails when the queue is at capacity.
    pub fn send(
        &mut self,
        method: Method,
        responder: Responder,
        timeout: Duration,
        now: Instant,
    ) -> Result<u32, (QueueFull, Responder)> {
        if self.queue.len() >= self.capacity {
            return Err((QueueFull, responder));
        }
        let id = self.allocate_id();
        self.pending.insert(
            id,
            PendingRequest {
                method,
                responder,
                issued_at: now,
                timeout,
                dispatched: false,
            },
        );
        self.queue.push_back(id);
        Ok(id)
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id = if self.next_id >= REQUEST_ID_WRAP { 1 } else { self.next_id + 1 };
            if !self.pending.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    /// Oldest queued request, now marked as on the wire.
    pub fn next_outgoing(&mut self) -> Option<(u32, Method)> {
        while let Some(id) = self.queue.pop_front() {
            if let Some(entry) = self.pending.get_mut(&id) {
                entry.dispatched = true;
                return Some((id, entry.method.clone()));
            }
        }
        None
    }

    /// Put a request back at the head of the queue after a failed write.
    pub fn requeue(&mut self, id: u32) {
        if let Some(entry) = self.pending.get_mut(&id) {
            entry.dispatched = false;
            self.queue.push_front(id);
        }
    }

    /// Match an inbound response. Unknown or late ids are logged and dropped.
    pub fn complete(&mut self, response: Response) -> Option<Completion> {
        let id = response.id?;
        let dispatched = self.pending.get(&id).is_some_and(|p| p.dispatched);
        if !dispatched {
            tracing::debug!("Discarding response for unknown request id {}", id);
            return None;
        }
        let entry = self.pending.remove(&id)?;
        let result = if response.is_success() {
            Ok(Reply {
                result: response.result,
                msg: response.msg,
            })
        } else {
            Err(RequestError::Device {
                code: response.code,
                msg: response.msg,
            })
        };
        Some(Completion {
            id,
            method: entry.method,
            responder: entry.responder,
            result,
        })
    }

    /// Fail one request that can never be sent.
    pub fn abandon(&mut self, id: u32, error: RequestError) -> Option<Completion> {
        self.queue.retain(|q| *q != id);
        let entry = self.pending.remove(&id)?;
        Some(Completion {
            id,
            method: entry.method,
            responder: entry.responder,
            result: Err(error),
        })
    }

    /// Remove every request older than its timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Completion> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.issued_at) >= p.timeout)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }
        self.queue.retain(|id| !expired.contains(id));
        let mut completions: Vec<Completion> = expired
            .into_iter()
            .filter_map(|id| {
                let entry = self.pending.remove(&id)?;
                Some(Completion {
                    id,
                    result: Err(RequestError::Timeout {
                        id,
                        method: entry.method.name(),
                        timeout: entry.timeout,
                    }),
                    method: entry.method,
                    responder: entry.responder,
                })
            })
            .collect();
        completions.sort_by_key(|c| c.id);
        completions
    }

    /// Fail everything, queued and in flight, with `ConnectionLost`.
    pub fn purge(&mut self) -> Vec<Completion> {
        self.queue.clear();
        let mut completions: Vec<Completion> = self
            .pending
            .drain()
            .map(|(id, entry)| Completion {
                id,
                method: entry.method,
                responder: entry.responder,
                result: Err(RequestError::ConnectionLost),
            })
            .collect();
        completions.sort_by_key(|c| c.id);
        completions
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len() - self.queue.len()
    }

    pub fn has_pending(&self, kind: InternalRequest) -> bool {
        self.pending
            .values()
            .any(|p| matches!(p.responder, Responder::Internal(k) if k == kind))
    }
}
