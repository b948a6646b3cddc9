//! Command Correlation Queues.
//!
//! The command characteristic carries both outbound commands and inbound
//! responses, and the wire has no request id.  Correlation is therefore
//! strictly positional:
//!
//! ```text
//! submit ──► pending writes ──(write ack)──► pending responses ──(notification)──► resolved
//!                 FIFO                            FIFO
//! ```
//!
//! Write-ack order equals response order equals submission order.  Callers
//! that issue several commands before the replies arrive get their replies
//! matched strictly in send order.
//!
//! Alongside the two queues sits a single *awaited slot* for a caller that
//! suspends on its command.  While the slot is occupied, no new
//! response-expecting background command is admitted, and an awaited command
//! is refused while background responses are owed.  Once its write lands the
//! awaited command takes its place in the response queue like any other, so
//! a background command written before it still gets the earlier reply.  The
//! slot is only answered out of turn when a response overtakes its write ack
//! and nothing else is owed.
//!
//! This type is pure bookkeeping: it owns no timers and performs no I/O.  The
//! engine drives it and acts on the values it returns.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::types::EventId;

/// Boxed completion callback for background commands.
///
/// Invoked at most once, on the engine task, with the firmware response text
/// (empty for commands that expect no response) or the failure.
pub type CommandCallback = Box<dyn FnOnce(Result<String>) + Send + 'static>;

/// Where a command's result goes.
///
/// Every submission style funnels through this one type: fire-and-forget
/// commands use [`Completion::Detached`], callback commands
/// [`Completion::Callback`], and suspended callers [`Completion::Waiter`].
pub enum Completion {
    Detached,
    Callback(CommandCallback),
    Waiter(oneshot::Sender<Result<String>>),
}

impl Completion {
    /// Deliver `result`.  Consumes the completion so it can fire only once.
    pub fn resolve(self, result: Result<String>) {
        match self {
            Completion::Detached => {}
            Completion::Callback(cb) => cb(result),
            Completion::Waiter(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Completion::Detached => "Detached",
            Completion::Callback(_) => "Callback",
            Completion::Waiter(_) => "Waiter",
        })
    }
}

#[derive(Debug)]
struct PendingWrite {
    id: EventId,
    /// `Detached` for awaited writes; their completion lives in the slot.
    completion: Completion,
    expects_response: bool,
    is_awaited: bool,
}

#[derive(Debug)]
struct PendingResponse {
    id: EventId,
    /// `Detached` for the awaited entry; its completion lives in the slot.
    completion: Completion,
    is_awaited: bool,
}

#[derive(Debug)]
struct AwaitedSlot {
    id: EventId,
    completion: Completion,
    timeout: Duration,
}

/// What the engine must do after a write acknowledgement.
#[derive(Debug)]
pub enum WriteAck {
    /// No write was pending.
    Unexpected,
    /// Written and no response is owed: resolve as succeeded.
    Completed { id: EventId, completion: Completion },
    /// Moved to the pending-response queue: arm the background timer.
    AwaitingResponse { id: EventId },
    /// Awaited write landed and the slot is still open: arm its timer.
    AwaitedWritten { id: EventId, timeout: Duration },
    /// Awaited write landed after its response had already resolved the slot.
    AwaitedAlreadyResolved { id: EventId },
    /// The write failed.  `completion` is the caller's, wherever it lived.
    Failed {
        id: EventId,
        completion: Completion,
        reason: String,
    },
}

/// The waiter a response (or timeout) resolves.
#[derive(Debug)]
pub struct ResponseTarget {
    pub id: EventId,
    pub completion: Completion,
    pub awaited: bool,
}

/// Everything removed by [`CorrelationQueues::drain`].
#[derive(Debug, Default)]
pub struct Drained {
    pub writes: Vec<(EventId, Completion)>,
    pub responses: Vec<(EventId, Completion)>,
    pub awaited: Option<(EventId, Completion)>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.responses.is_empty() && self.awaited.is_none()
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.responses.len() + usize::from(self.awaited.is_some())
    }
}

/// Pending writes, pending responses and the awaited slot.
#[derive(Debug, Default)]
pub struct CorrelationQueues {
    writes: VecDeque<PendingWrite>,
    responses: VecDeque<PendingResponse>,
    awaited: Option<AwaitedSlot>,
}

impl CorrelationQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a submission may enter the queues.
    pub fn admit(&self, expects_response: bool, awaited: bool) -> Result<()> {
        if awaited {
            if let Some(slot) = &self.awaited {
                return Err(Error::UnexpectedResponse(format!(
                    "awaited command {} is still outstanding",
                    slot.id
                )));
            }
            if !self.responses.is_empty() {
                return Err(Error::UnexpectedResponse(format!(
                    "{} background response(s) still owed",
                    self.pending_responses()
                )));
            }
        } else if expects_response {
            if let Some(slot) = &self.awaited {
                return Err(Error::UnexpectedResponse(format!(
                    "awaited command {} is outstanding",
                    slot.id
                )));
            }
        }
        Ok(())
    }

    /// Queue a background write.  Call [`CorrelationQueues::admit`] first,
    /// unless the command must go out regardless of the awaited slot (an
    /// emergency stop); positional matching keeps its reply behind the
    /// awaited one.
    pub fn push_background(&mut self, id: EventId, completion: Completion, expects_response: bool) {
        self.writes.push_back(PendingWrite {
            id,
            completion,
            expects_response,
            is_awaited: false,
        });
    }

    /// Occupy the awaited slot and queue its write.  Call
    /// [`CorrelationQueues::admit`] first.
    pub fn push_awaited(&mut self, id: EventId, completion: Completion, timeout: Duration) {
        self.awaited = Some(AwaitedSlot {
            id,
            completion,
            timeout,
        });
        self.writes.push_back(PendingWrite {
            id,
            completion: Completion::Detached,
            expects_response: true,
            is_awaited: true,
        });
    }

    /// Apply a write acknowledgement to the oldest pending write.
    pub fn on_write_completed(&mut self, result: std::result::Result<(), String>) -> WriteAck {
        let Some(write) = self.writes.pop_front() else {
            return WriteAck::Unexpected;
        };

        match result {
            Err(reason) => {
                let completion = if write.is_awaited {
                    self.take_awaited(write.id)
                        .map(|slot| slot.completion)
                        .unwrap_or(Completion::Detached)
                } else {
                    write.completion
                };
                WriteAck::Failed {
                    id: write.id,
                    completion,
                    reason,
                }
            }
            Ok(()) if write.is_awaited => match &self.awaited {
                Some(slot) if slot.id == write.id => {
                    let timeout = slot.timeout;
                    self.responses.push_back(PendingResponse {
                        id: write.id,
                        completion: Completion::Detached,
                        is_awaited: true,
                    });
                    WriteAck::AwaitedWritten {
                        id: write.id,
                        timeout,
                    }
                }
                _ => WriteAck::AwaitedAlreadyResolved { id: write.id },
            },
            Ok(()) if write.expects_response => {
                self.responses.push_back(PendingResponse {
                    id: write.id,
                    completion: write.completion,
                    is_awaited: false,
                });
                WriteAck::AwaitingResponse { id: write.id }
            }
            Ok(()) => WriteAck::Completed {
                id: write.id,
                completion: write.completion,
            },
        }
    }

    /// Pick the waiter for an inbound response: the oldest pending response,
    /// else an awaited slot whose write is not yet acknowledged.  `None`
    /// means unmatched.
    pub fn on_response(&mut self) -> Option<ResponseTarget> {
        let Some(front) = self.responses.pop_front() else {
            return self.awaited.take().map(|slot| ResponseTarget {
                id: slot.id,
                completion: slot.completion,
                awaited: true,
            });
        };
        if !front.is_awaited {
            return Some(ResponseTarget {
                id: front.id,
                completion: front.completion,
                awaited: false,
            });
        }
        self.take_awaited(front.id).map(|slot| ResponseTarget {
            id: slot.id,
            completion: slot.completion,
            awaited: true,
        })
    }

    /// Remove `id` if it is still owed a response.
    ///
    /// Returns `None` when an earlier path already resolved it; queue removal
    /// is what makes resolution idempotent.
    pub fn on_timeout(&mut self, id: EventId) -> Option<ResponseTarget> {
        if let Some(slot) = self.take_awaited(id) {
            self.responses.retain(|r| r.id != id);
            return Some(ResponseTarget {
                id,
                completion: slot.completion,
                awaited: true,
            });
        }
        let pos = self.responses.iter().position(|r| r.id == id)?;
        self.responses.remove(pos).map(|r| ResponseTarget {
            id: r.id,
            completion: r.completion,
            awaited: false,
        })
    }

    /// Empty every queue and the slot.  Calling it on empty queues is a no-op.
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();
        if !self.writes.is_empty() {
            drained.writes = self
                .writes
                .drain(..)
                .filter(|w| !w.is_awaited)
                .map(|w| (w.id, w.completion))
                .collect();
        }
        if !self.responses.is_empty() {
            drained.responses = self
                .responses
                .drain(..)
                .filter(|r| !r.is_awaited)
                .map(|r| (r.id, r.completion))
                .collect();
        }
        drained.awaited = self.awaited.take().map(|s| (s.id, s.completion));
        drained
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Background commands owed a response.
    pub fn pending_responses(&self) -> usize {
        self.responses.iter().filter(|r| !r.is_awaited).count()
    }

    pub fn awaited_id(&self) -> Option<EventId> {
        self.awaited.as_ref().map(|s| s.id)
    }

    pub fn is_idle(&self) -> bool {
        self.writes.is_empty() && self.responses.is_empty() && self.awaited.is_none()
    }

    fn take_awaited(&mut self, id: EventId) -> Option<AwaitedSlot> {
        if self.awaited.as_ref().is_some_and(|s| s.id == id) {
            self.awaited.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(u64, Result<String>)>>>;

    fn recorder(log: &Log, tag: u64) -> Completion {
        let log = Arc::clone(log);
        Completion::Callback(Box::new(move |r| log.lock().unwrap().push((tag, r))))
    }

    fn id(n: u64) -> EventId {
        EventId(n)
    }

    #[test]
    fn responses_resolve_in_submission_order() {
        let log = Log::default();
        let mut q = CorrelationQueues::new();
        q.push_background(id(1), recorder(&log, 1), true);
        q.push_background(id(2), recorder(&log, 2), true);

        assert!(matches!(q.on_write_completed(Ok(())), WriteAck::AwaitingResponse { id } if id == EventId(1)));
        assert!(matches!(q.on_write_completed(Ok(())), WriteAck::AwaitingResponse { id } if id == EventId(2)));

        let target = q.on_response().unwrap();
        assert_eq!(target.id, id(1));
        assert!(!target.awaited);
        target.completion.resolve(Ok("ok".into()));

        assert_eq!(q.pending_responses(), 1);
        assert_eq!(log.lock().unwrap()[0].0, 1);
    }

    #[test]
    fn fire_and_forget_completes_on_ack() {
        let mut q = CorrelationQueues::new();
        q.push_background(id(1), Completion::Detached, false);
        assert!(matches!(q.on_write_completed(Ok(())), WriteAck::Completed { .. }));
        assert!(q.is_idle());
    }

    #[test]
    fn write_failure_only_pops_that_item() {
        let log = Log::default();
        let mut q = CorrelationQueues::new();
        q.push_background(id(1), recorder(&log, 1), true);
        q.push_background(id(2), recorder(&log, 2), true);

        match q.on_write_completed(Err("gatt error".into())) {
            WriteAck::Failed { id: failed, completion, reason } => {
                assert_eq!(failed, id(1));
                assert_eq!(reason, "gatt error");
                completion.resolve(Err(Error::Transport(reason)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.pending_writes(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn unexpected_ack_and_unmatched_response() {
        let mut q = CorrelationQueues::new();
        assert!(matches!(q.on_write_completed(Ok(())), WriteAck::Unexpected));
        assert!(q.on_response().is_none());
    }

    #[test]
    fn timeout_after_response_is_a_no_op() {
        let mut q = CorrelationQueues::new();
        q.push_background(id(1), Completion::Detached, true);
        q.on_write_completed(Ok(()));
        assert!(q.on_response().is_some());
        assert!(q.on_timeout(id(1)).is_none());
    }

    #[test]
    fn response_after_timeout_is_unmatched() {
        let mut q = CorrelationQueues::new();
        q.push_background(id(1), Completion::Detached, true);
        q.on_write_completed(Ok(()));
        assert!(q.on_timeout(id(1)).is_some());
        assert!(q.on_timeout(id(1)).is_none());
        assert!(q.on_response().is_none());
    }

    #[test]
    fn timeout_removes_from_middle_of_queue() {
        let mut q = CorrelationQueues::new();
        for n in 1..=3 {
            q.push_background(id(n), Completion::Detached, true);
            q.on_write_completed(Ok(()));
        }
        assert_eq!(q.on_timeout(id(2)).unwrap().id, id(2));
        assert_eq!(q.on_response().unwrap().id, id(1));
        assert_eq!(q.on_response().unwrap().id, id(3));
    }

    #[test]
    fn awaited_slot_excludes_background_responses() {
        let mut q = CorrelationQueues::new();
        q.admit(true, true).unwrap();
        q.push_awaited(id(1), Completion::Detached, Duration::from_secs(2));

        assert!(matches!(q.admit(true, false), Err(Error::UnexpectedResponse(_))));
        assert!(matches!(q.admit(true, true), Err(Error::UnexpectedResponse(_))));
        // fire-and-forget never owes a response
        assert!(q.admit(false, false).is_ok());
    }

    #[test]
    fn awaited_refused_while_background_response_owed() {
        let mut q = CorrelationQueues::new();
        q.push_background(id(1), Completion::Detached, true);
        // write not acked yet: nothing owed
        assert!(q.admit(true, true).is_ok());
        q.on_write_completed(Ok(()));
        assert!(q.admit(true, true).is_err());
    }

    #[test]
    fn older_background_reply_is_matched_before_awaited() {
        let log = Log::default();
        let (tx, mut rx) = oneshot::channel();
        let mut q = CorrelationQueues::new();
        q.push_background(id(1), recorder(&log, 1), true);
        q.admit(true, true).unwrap();
        q.push_awaited(id(2), Completion::Waiter(tx), Duration::from_secs(5));

        assert!(matches!(q.on_write_completed(Ok(())), WriteAck::AwaitingResponse { .. }));
        assert!(matches!(q.on_write_completed(Ok(())), WriteAck::AwaitedWritten { .. }));

        let first = q.on_response().unwrap();
        assert_eq!(first.id, id(1));
        assert!(!first.awaited);
        first.completion.resolve(Ok("ok:A".into()));

        let second = q.on_response().unwrap();
        assert_eq!(second.id, id(2));
        assert!(second.awaited);
        second.completion.resolve(Ok("ok:B".into()));

        assert_eq!(log.lock().unwrap()[0].1, Ok("ok:A".to_owned()));
        assert_eq!(rx.try_recv().unwrap(), Ok("ok:B".to_owned()));
        assert!(q.is_idle());
    }

    #[test]
    fn stop_queued_behind_awaited_keeps_its_place() {
        let mut q = CorrelationQueues::new();
        q.push_awaited(id(1), Completion::Detached, Duration::from_secs(30));
        // pushed without admission
        q.push_background(id(2), Completion::Detached, true);
        q.on_write_completed(Ok(()));
        q.on_write_completed(Ok(()));
        assert_eq!(q.pending_responses(), 1);

        assert!(q.on_response().unwrap().awaited);
        assert_eq!(q.on_response().unwrap().id, id(2));
        assert!(q.is_idle());
    }

    #[test]
    fn awaited_timeout_frees_its_response_position() {
        let mut q = CorrelationQueues::new();
        q.push_awaited(id(1), Completion::Detached, Duration::from_secs(1));
        q.push_background(id(2), Completion::Detached, true);
        q.on_write_completed(Ok(()));
        q.on_write_completed(Ok(()));

        assert!(q.on_timeout(id(1)).unwrap().awaited);
        assert_eq!(q.on_response().unwrap().id, id(2));
        assert!(q.is_idle());
    }

    #[test]
    fn awaited_slot_tolerates_early_response() {
        let (tx, mut rx) = oneshot::channel();
        let mut q = CorrelationQueues::new();
        q.push_awaited(id(7), Completion::Waiter(tx), Duration::from_millis(500));

        // response overtakes the write ack
        let target = q.on_response().unwrap();
        assert!(target.awaited);
        target.completion.resolve(Ok("ok".into()));
        assert_eq!(rx.try_recv().unwrap(), Ok("ok".to_owned()));

        assert!(matches!(
            q.on_write_completed(Ok(())),
            WriteAck::AwaitedAlreadyResolved { .. }
        ));
        assert!(q.is_idle());
    }

    #[test]
    fn awaited_write_arms_with_its_own_timeout() {
        let mut q = CorrelationQueues::new();
        q.push_awaited(id(3), Completion::Detached, Duration::from_millis(750));
        match q.on_write_completed(Ok(())) {
            WriteAck::AwaitedWritten { id: written, timeout } => {
                assert_eq!(written, id(3));
                assert_eq!(timeout, Duration::from_millis(750));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.awaited_id(), Some(id(3)));
    }

    #[test]
    fn awaited_write_failure_fails_the_caller() {
        let (tx, mut rx) = oneshot::channel();
        let mut q = CorrelationQueues::new();
        q.push_awaited(id(4), Completion::Waiter(tx), Duration::from_secs(2));
        match q.on_write_completed(Err("link lost".into())) {
            WriteAck::Failed { completion, reason, .. } => {
                completion.resolve(Err(Error::Transport(reason)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Transport(_))));
        assert_eq!(q.awaited_id(), None);
    }

    #[test]
    fn drain_returns_each_waiter_once_and_is_idempotent() {
        let mut q = CorrelationQueues::new();
        q.push_background(id(1), Completion::Detached, true);
        q.push_background(id(2), Completion::Detached, true);
        q.push_awaited(id(3), Completion::Detached, Duration::from_secs(2));
        q.on_write_completed(Ok(()));
        q.on_write_completed(Ok(()));

        let drained = q.drain();
        assert_eq!(drained.responses.len(), 2);
        // the awaited write is still unacked but only the slot reports it
        assert!(drained.writes.is_empty());
        assert_eq!(drained.awaited.as_ref().map(|a| a.0), Some(id(3)));
        assert_eq!(drained.len(), 3);

        assert!(q.is_idle());
        assert!(q.drain().is_empty());
    }
}
