//! Question supply.
//!
//! Questions are produced by the host client. The engine keeps a queue and
//! asks the host for more while it runs low, at most once per
//! [`REQUEST_INTERVAL`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Queue length the engine tries to maintain.
pub const QUEUE_TARGET: usize = 10;

pub const REQUEST_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct QuestionQueue {
    queue: VecDeque<Value>,
    last_request: Option<Instant>,
}

impl QuestionQueue {
    pub fn new() -> Self {
        QuestionQueue::default()
    }

    pub fn upload(&mut self, list: &[Value]) {
        self.queue.extend(list.iter().filter(|v| !v.is_null()).cloned());
    }

    pub fn next(&mut self) -> Option<Value> {
        self.queue.pop_front()
    }

    pub fn has_question(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.last_request = None;
    }

    /// Whether a refill request is due at `now`; records the request.
    pub fn request_due(&mut self, now: Instant) -> bool {
        if self.queue.len() >= QUEUE_TARGET {
            return false;
        }

        if let Some(last) = self.last_request {
            if now.saturating_duration_since(last) < REQUEST_INTERVAL {
                return false;
            }
        }

        self.last_request = Some(now);
        true
    }
}
