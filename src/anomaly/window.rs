// =============================================================================
// Event Window: Time-bounded buffer of trades and liquidations
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use super::{EventKind, MarketEvent};

/// Rolling window of market events, pruned relative to an evaluation time.
#[derive(Debug, Clone)]
pub struct EventWindow {
    events: VecDeque<MarketEvent>,
    span: Duration,
}

impl EventWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            span,
        }
    }

    pub fn push(&mut self, event: MarketEvent) {
        self.events.push_back(event);
    }

    /// Drop events older than `now - span`. Returns how many were dropped.
    ///
    /// Events can arrive out of order, so the whole buffer is scanned.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        // A span reaching past the representable range keeps everything.
        let Some(cutoff) = now.checked_sub_signed(self.span) else {
            return 0;
        };
        let before = self.events.len();
        self.events.retain(|e| e.timestamp >= cutoff);
        before - self.events.len()
    }

    pub fn of_kind(&self, kind: EventKind) -> impl Iterator<Item = &MarketEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
