//! Event sink that keeps everything it sees.

use std::sync::Mutex;
use std::time::Duration;

use crate::events::{EventSink, TunnelEvent};

/// Records events for later assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TunnelEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far.
    #[must_use]
    pub fn events(&self) -> Vec<TunnelEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events matching `predicate`.
    pub fn matching(&self, predicate: impl Fn(&TunnelEvent) -> bool) -> Vec<TunnelEvent> {
        self.events().into_iter().filter(|e| predicate(e)).collect()
    }

    /// Poll until an event matches `predicate` or `timeout` elapses.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&TunnelEvent) -> bool,
    ) -> Option<TunnelEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.events().into_iter().find(|e| predicate(e)) {
                return Some(event);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &TunnelEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
