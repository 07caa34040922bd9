//! Bounded in-memory log of human-readable progress lines.
//!
//! Every line is mirrored to `tracing` and broadcast to live subscribers
//! (the SSE endpoint). Slow subscribers lose lines rather than blocking
//! writers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{info, warn};

pub const DEFAULT_CAPACITY: usize = 500;
const BROADCAST_CAPACITY: usize = 256;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone)]
pub struct ActivityLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    sender: broadcast::Sender<String>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
            sender,
        }
    }

    pub fn info(&self, text: impl AsRef<str>) {
        info!("{}", text.as_ref());
        self.append(text.as_ref());
    }

    pub fn warn(&self, text: impl AsRef<str>) {
        warn!("{}", text.as_ref());
        self.append(text.as_ref());
    }

    fn append(&self, text: &str) {
        let line = format!(
            "{} - {}",
            chrono::Local::now().format(TIMESTAMP_FORMAT),
            text
        );
        {
            let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.clone());
        }
        // No subscribers is fine
        let _ = self.sender.send(line);
    }

    /// Buffered lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}
