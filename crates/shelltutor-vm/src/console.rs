//! Console sink capturing what the machine prints.
//!
//! A [`ConsoleSink`] is a cloneable handle: every clone writes to and reads
//! from the same buffer, so the text survives while the presentation layer
//! hides and re-shows the console. Each write is also broadcast as a
//! [`ConsoleChunk`] for live rendering.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default number of chunks buffered for each live subscriber.
const DEFAULT_LIVE_CAPACITY: usize = 256;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A piece of console output as it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleChunk {
    /// Originating stream.
    pub stream: ConsoleStream,
    /// Decoded text.
    pub text: String,
}

/// Output-capturing handle bound to a [`VmSession`](crate::VmSession).
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    buffer: Arc<Mutex<String>>,
    live: broadcast::Sender<ConsoleChunk>,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::with_live_capacity(DEFAULT_LIVE_CAPACITY)
    }

    /// Creates an empty sink whose live subscribers buffer `capacity` chunks.
    #[must_use]
    pub fn with_live_capacity(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));
        Self {
            buffer: Arc::new(Mutex::new(String::new())),
            live,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, String> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends text from `stream` and notifies live subscribers.
    pub fn write(&self, stream: ConsoleStream, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.buffer().push_str(&text);
        // No subscribers is fine.
        let _ = self.live.send(ConsoleChunk { stream, text });
    }

    /// Discards all accumulated text.
    pub fn clear(&self) {
        self.buffer().clear();
    }

    /// Returns a copy of the accumulated text.
    #[must_use]
    pub fn contents(&self) -> String {
        self.buffer().clone()
    }

    /// Returns whether nothing has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// Subscribes to chunks written from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleChunk> {
        self.live.subscribe()
    }

    /// Returns whether both handles share the same buffer.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}
