//! Hook observability: the per-tract event ring.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Maximum events retained in the ring.
pub const EVENT_RING_CAPACITY: usize = 256;

/// A single hook-system event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub timestamp: DateTime<Utc>,
    /// The hookable operation name (e.g. `compress`, `gc`).
    pub operation: String,
    /// Display name of the handler that ran (or a routing marker such as
    /// `(auto)`).
    pub handler_name: String,
    /// Whether the pending was resolved by this firing.
    pub resolved: bool,
    /// One of `approved`, `rejected`, `pass_through`, `unresolved`,
    /// `skipped`, `auto-approved`.
    pub result: String,
}

/// Bounded in-memory ring of hook events.
#[derive(Debug, Default)]
pub struct HookEventLog {
    events: VecDeque<HookEvent>,
}

impl HookEventLog {
    pub fn record(
        &mut self,
        operation: &str,
        handler_name: &str,
        resolved: bool,
        result: &str,
    ) {
        if self.events.len() >= EVENT_RING_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(HookEvent {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            handler_name: handler_name.to_string(),
            resolved,
            result: result.to_string(),
        });
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&HookEvent> {
        self.events.back()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_caps_at_capacity() {
        let mut log = HookEventLog::default();
        for i in 0..EVENT_RING_CAPACITY + 10 {
            log.record("compress", &format!("h{i}"), true, "approved");
        }
        assert_eq!(log.len(), EVENT_RING_CAPACITY);
        assert_eq!(log.last().unwrap().handler_name, format!("h{}", EVENT_RING_CAPACITY + 9));
    }
}
