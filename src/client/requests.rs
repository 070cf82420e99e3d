// src/client/requests.rs

//! Request/response exchanges over the socket, keyed by request kind.
//!
//! Only one request per kind can be outstanding. Each carries a deadline and is
//! failed with [`PixelcastError::RequestTimeout`] once it passes, so the table never
//! grows on unanswered requests.

use crate::core::PixelcastError;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub type RequestResult = Result<Value, PixelcastError>;

struct Pending {
    reply: oneshot::Sender<RequestResult>,
    deadline: Instant,
}

pub struct PendingRequests {
    pending: HashMap<String, Pending>,
    timeout: Duration,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(REQUEST_TIMEOUT)
    }
}

impl PendingRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Registers a request. A request of the same kind that is still pending is
    /// failed with [`PixelcastError::Superseded`].
    pub fn insert(&mut self, kind: &str, reply: oneshot::Sender<RequestResult>, now: Instant) {
        let entry = Pending {
            reply,
            deadline: now + self.timeout,
        };
        if let Some(previous) = self.pending.insert(kind.to_string(), entry) {
            let _ = previous
                .reply
                .send(Err(PixelcastError::Superseded(kind.to_string())));
        }
    }

    /// Completes the pending request of `kind`. Returns `false` if there was none.
    pub fn resolve(&mut self, kind: &str, value: Value) -> bool {
        match self.pending.remove(kind) {
            Some(pending) => {
                let _ = pending.reply.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Fails every request whose deadline has passed and returns how many there were.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(kind, _)| kind.clone())
            .collect();
        for kind in &expired {
            if let Some(pending) = self.pending.remove(kind) {
                let _ = pending
                    .reply
                    .send(Err(PixelcastError::RequestTimeout(kind.clone())));
            }
        }
        expired.len()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.pending.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
