//! Scripted transport for engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use stroke_rs::engine::EngineHandle;
use stroke_rs::error::{Error, Result};
use stroke_rs::protocol::Endpoint;
use stroke_rs::transport::{Transport, TransportEvent};
use stroke_rs::types::{CommandEvent, TransportResult};

/// In-memory transport.
///
/// Command writes succeed immediately unless a failure is queued or the
/// command gate is closed.  Reads return whatever was scripted for the
/// endpoint, once the endpoint is no longer held.
pub struct FakeTransport {
    endpoints: HashSet<Endpoint>,
    writes: Mutex<Vec<(Endpoint, Vec<u8>)>>,
    reads: Mutex<HashMap<Endpoint, Vec<u8>>>,
    descriptions: Mutex<HashMap<u32, Option<String>>>,
    described: Mutex<Option<u32>>,
    write_failures: Mutex<VecDeque<String>>,
    command_gate: watch::Sender<bool>,
    held_reads: watch::Sender<HashSet<Endpoint>>,
    served_reads: Mutex<Vec<Endpoint>>,
}

impl FakeTransport {
    pub fn new(endpoints: &[Endpoint]) -> Arc<Self> {
        Arc::new(Self {
            endpoints: endpoints.iter().copied().collect(),
            writes: Mutex::new(Vec::new()),
            reads: Mutex::new(HashMap::new()),
            descriptions: Mutex::new(HashMap::new()),
            described: Mutex::new(None),
            write_failures: Mutex::new(VecDeque::new()),
            command_gate: watch::channel(true).0,
            held_reads: watch::channel(HashSet::new()).0,
            served_reads: Mutex::new(Vec::new()),
        })
    }

    /// Command and state only.
    pub fn minimal() -> Arc<Self> {
        Self::new(&[Endpoint::Command, Endpoint::State])
    }

    pub fn set_read(&self, endpoint: Endpoint, value: &[u8]) {
        self.reads.lock().unwrap().insert(endpoint, value.to_vec());
    }

    /// `None` makes the description read fail.
    pub fn set_description(&self, index: u32, text: Option<&str>) {
        self.descriptions
            .lock()
            .unwrap()
            .insert(index, text.map(str::to_owned));
    }

    pub fn fail_next_write(&self, reason: &str) {
        self.write_failures.lock().unwrap().push_back(reason.to_owned());
    }

    /// While closed, command writes block without completing.
    pub fn hold_commands(&self, held: bool) {
        self.command_gate.send_replace(!held);
    }

    /// While held, reads of `endpoint` block without completing.
    pub fn hold_reads(&self, endpoint: Endpoint, held: bool) {
        self.held_reads.send_modify(|set| {
            if held {
                set.insert(endpoint);
            } else {
                set.remove(&endpoint);
            }
        });
    }

    pub fn hold_pattern_list(&self, held: bool) {
        self.hold_reads(Endpoint::PatternList, held);
    }

    /// Reads of `endpoint` that have returned, successful or not.
    pub fn reads_served(&self, endpoint: Endpoint) -> usize {
        self.served_reads
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == endpoint)
            .count()
    }

    pub fn written(&self, endpoint: Endpoint) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.written(Endpoint::Command)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn has_endpoint(&self, endpoint: Endpoint) -> bool {
        self.endpoints.contains(&endpoint)
    }

    async fn write(&self, endpoint: Endpoint, payload: Vec<u8>) -> Result<()> {
        if endpoint == Endpoint::Command {
            let mut gate = self.command_gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            if let Some(reason) = self.write_failures.lock().unwrap().pop_front() {
                return Err(Error::Transport(reason));
            }
        }
        if endpoint == Endpoint::PatternDescription {
            let index = String::from_utf8_lossy(&payload).parse().ok();
            *self.described.lock().unwrap() = index;
        }
        self.writes.lock().unwrap().push((endpoint, payload));
        Ok(())
    }

    async fn read(&self, endpoint: Endpoint) -> Result<Vec<u8>> {
        let mut gate = self.held_reads.subscribe();
        let _ = gate.wait_for(|held| !held.contains(&endpoint)).await;
        self.served_reads.lock().unwrap().push(endpoint);

        if endpoint == Endpoint::PatternDescription {
            let index = *self.described.lock().unwrap();
            let text = index.and_then(|i| self.descriptions.lock().unwrap().get(&i).cloned());
            return match text {
                Some(Some(text)) => Ok(text.into_bytes()),
                _ => Err(Error::Transport("read failed".into())),
            };
        }
        self.reads
            .lock()
            .unwrap()
            .get(&endpoint)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no value for {endpoint:?}")))
    }
}

/// Attach `transport` and return the sender that plays the device side.
pub async fn attach(engine: &EngineHandle, transport: &Arc<FakeTransport>) -> mpsc::Sender<TransportEvent> {
    let (tx, rx) = mpsc::channel(64);
    engine
        .attach(transport.clone() as Arc<dyn Transport>, rx)
        .await
        .unwrap();
    tx
}

/// Attach and announce the link as up.
pub async fn connect(engine: &EngineHandle, transport: &Arc<FakeTransport>) -> mpsc::Sender<TransportEvent> {
    let tx = attach(engine, transport).await;
    tx.send(TransportEvent::Connected("OSSM-test".into()))
        .await
        .unwrap();
    tx
}

pub async fn notify(tx: &mpsc::Sender<TransportEvent>, endpoint: Endpoint, value: &str) {
    tx.send(TransportEvent::Notification {
        endpoint,
        value: value.as_bytes().to_vec(),
    })
    .await
    .unwrap();
}

pub async fn respond(tx: &mpsc::Sender<TransportEvent>, text: &str) {
    notify(tx, Endpoint::Command, text).await;
}

/// Poll the ledger until `done` holds.
pub async fn wait_for_ledger<F>(engine: &EngineHandle, done: F) -> Vec<CommandEvent>
where
    F: Fn(&[CommandEvent]) -> bool,
{
    for _ in 0..10_000 {
        let events = engine.ledger_snapshot().await.unwrap();
        if done(&events) {
            return events;
        }
        tokio::task::yield_now().await;
    }
    panic!("ledger never reached the expected state");
}

/// Wait until `n` commands have been acknowledged by the transport.
pub async fn wait_for_acks(engine: &EngineHandle, n: usize) -> Vec<CommandEvent> {
    wait_for_ledger(engine, |events| {
        events
            .iter()
            .filter(|e| e.transport_result == TransportResult::Success)
            .count()
            >= n
    })
    .await
}
