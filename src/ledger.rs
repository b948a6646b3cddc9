//! Diagnostic record of every outbound command attempt.

use std::collections::{BTreeMap, VecDeque};
use std::time::SystemTime;

use log::debug;

use crate::types::{CommandEvent, CommandOutcome, EventId, TransportResult};

/// Default number of events retained before eviction starts.
pub const DEFAULT_LEDGER_CAPACITY: usize = 64;

/// Command Event Ledger.
///
/// Each event is created at enqueue time and mutated at most twice: once with
/// the transport result, once with the final outcome.  When the ledger grows
/// past its capacity the entries that were *resolved* earliest are evicted
/// first; pending entries are never evicted.
///
/// Event ids are allocated from a counter that survives [`CommandLedger::clear`]
/// so a stale id from before a reset can never alias a new command.
#[derive(Debug)]
pub struct CommandLedger {
    events: BTreeMap<EventId, CommandEvent>,
    /// Ids in the order they were resolved.
    resolved: VecDeque<EventId>,
    capacity: usize,
    next_id: u64,
}

impl CommandLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: BTreeMap::new(),
            resolved: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    /// Create a pending event for `command` and return its id.
    pub fn record(&mut self, command: &str) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.events.insert(
            id,
            CommandEvent {
                id,
                command: command.to_owned(),
                created_at: SystemTime::now(),
                transport_result: TransportResult::Pending,
                firmware_response: None,
                outcome: CommandOutcome::Pending,
                resolved_at: None,
            },
        );
        self.evict();
        id
    }

    /// Record the transport result.  Ignored if the event is gone or the
    /// result was already set.
    pub fn set_transport_result(&mut self, id: EventId, result: TransportResult) -> bool {
        match self.events.get_mut(&id) {
            Some(ev) if ev.transport_result == TransportResult::Pending => {
                ev.transport_result = result;
                true
            }
            _ => false,
        }
    }

    /// Record the final outcome.  Returns `false` (and changes nothing) if the
    /// event is unknown or already resolved.
    pub fn resolve(
        &mut self,
        id: EventId,
        outcome: CommandOutcome,
        response: Option<String>,
    ) -> bool {
        let Some(ev) = self.events.get_mut(&id) else {
            return false;
        };
        if ev.outcome.is_resolved() {
            debug!("ledger: {id} already resolved as {:?}", ev.outcome);
            return false;
        }
        ev.outcome = outcome;
        ev.firmware_response = response;
        ev.resolved_at = Some(SystemTime::now());
        self.resolved.push_back(id);
        self.evict();
        true
    }

    /// Record a response that had no pending command.
    pub fn record_unmatched(&mut self, response: &str) -> EventId {
        let id = self.record("");
        self.resolve(id, CommandOutcome::UnmatchedResponse, Some(response.to_owned()));
        id
    }

    pub fn get(&self, id: EventId) -> Option<&CommandEvent> {
        self.events.get(&id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Copy of every retained event, oldest first.
    pub fn snapshot(&self) -> Vec<CommandEvent> {
        self.events.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.resolved.clear();
    }

    fn evict(&mut self) {
        while self.events.len() > self.capacity {
            let Some(oldest) = self.resolved.pop_front() else {
                break;
            };
            self.events.remove(&oldest);
        }
    }
}

impl Default for CommandLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_recorded() {
        let mut ledger = CommandLedger::new(8);
        let id = ledger.record("set:speed:10");
        assert!(ledger.set_transport_result(id, TransportResult::Success));
        assert!(ledger.resolve(id, CommandOutcome::Succeeded, Some("ok".into())));

        let ev = ledger.get(id).unwrap();
        assert_eq!(ev.command, "set:speed:10");
        assert_eq!(ev.transport_result, TransportResult::Success);
        assert_eq!(ev.firmware_response.as_deref(), Some("ok"));
        assert!(ev.resolved_at.is_some());
    }

    #[test]
    fn second_resolution_is_rejected() {
        let mut ledger = CommandLedger::new(8);
        let id = ledger.record("go:menu");
        assert!(ledger.resolve(id, CommandOutcome::TimedOut, None));
        assert!(!ledger.resolve(id, CommandOutcome::Succeeded, Some("ok".into())));
        assert_eq!(ledger.get(id).unwrap().outcome, CommandOutcome::TimedOut);
        assert!(!ledger.set_transport_result(EventId(999), TransportResult::Success));
    }

    #[test]
    fn evicts_earliest_resolved_not_oldest_created() {
        let mut ledger = CommandLedger::new(3);
        let a = ledger.record("a");
        let b = ledger.record("b");
        let c = ledger.record("c");
        // b resolves before a
        ledger.resolve(b, CommandOutcome::Succeeded, None);
        ledger.resolve(a, CommandOutcome::Succeeded, None);
        let d = ledger.record("d");

        assert!(ledger.get(b).is_none());
        assert!(ledger.get(a).is_some());
        assert!(ledger.get(c).is_some());
        assert!(ledger.get(d).is_some());
    }

    #[test]
    fn pending_entries_are_never_evicted() {
        let mut ledger = CommandLedger::new(2);
        let ids: Vec<_> = (0..4).map(|i| ledger.record(&i.to_string())).collect();
        assert_eq!(ledger.len(), 4);
        ledger.resolve(ids[3], CommandOutcome::Succeeded, None);
        assert_eq!(ledger.len(), 3);
        assert!(ledger.get(ids[3]).is_none());
    }

    #[test]
    fn unmatched_and_clear() {
        let mut ledger = CommandLedger::new(4);
        let id = ledger.record_unmatched("ok");
        assert_eq!(ledger.get(id).unwrap().outcome, CommandOutcome::UnmatchedResponse);
        ledger.clear();
        assert!(ledger.is_empty());
        let next = ledger.record("x");
        assert!(next > id);
    }
}
