//! The transport capability the engine runs on.
//!
//! A transport is a byte channel addressed by [`Endpoint`]: it can write and
//! read, and it pushes notifications and link changes as [`TransportEvent`]s
//! through one ordered `mpsc` channel.  [`crate::ble_client`] implements it
//! over btleplug; tests implement it with a scripted fake.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::protocol::Endpoint;

/// Byte-oriented access to the peripheral's characteristics.
///
/// Writes to [`Endpoint::Command`] are issued one at a time, in submission
/// order, and the engine relies on their completions arriving in that order.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether `endpoint` was resolved during discovery.
    fn has_endpoint(&self, endpoint: Endpoint) -> bool;

    /// Write `payload` and wait for the link-layer acknowledgement.
    async fn write(&self, endpoint: Endpoint, payload: Vec<u8>) -> Result<()>;

    /// Read the current value of `endpoint`.
    async fn read(&self, endpoint: Endpoint) -> Result<Vec<u8>>;

    /// Tear the link down.  Transports with nothing to release keep the
    /// default.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Radio power state reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unsupported,
    Unknown,
}

impl RadioState {
    /// Whether the engine must treat this state as a link loss.
    pub fn is_unavailable(self) -> bool {
        matches!(self, RadioState::PoweredOff | RadioState::Unsupported)
    }
}

/// Everything a transport reports on its own initiative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link is up and discovery finished.  Carries the device name.
    Connected(String),
    /// A characteristic value notification.
    Notification { endpoint: Endpoint, value: Vec<u8> },
    /// The link was lost.
    Disconnected,
    /// The adapter changed power state.
    RadioStateChanged(RadioState),
}

// ── Cancellation ──────────────────────────────────────────────────────────────

/// Cloneable cancellation flag that can also be awaited.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`Cancellation::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

// ── Cancellable helpers ───────────────────────────────────────────────────────

/// Run one blocking transport step under a timeout and a cancellation flag.
///
/// Returns `Ok(None)` if cancelled before or during the step.
pub async fn cancellable<T, F>(step: F, timeout: Duration, cancel: &Cancellation) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Ok(None);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(None),
        r = tokio::time::timeout(timeout, step) => match r {
            Ok(value) => value.map(Some),
            Err(_) => Err(Error::Timeout),
        },
    }
}

/// Generic characteristic read with timeout and cancellation.
///
/// Fails with [`Error::CharacteristicNotFound`] if the endpoint was never
/// resolved.
pub async fn read_endpoint(
    transport: &dyn Transport,
    endpoint: Endpoint,
    timeout: Duration,
    cancel: &Cancellation,
) -> Result<Option<Vec<u8>>> {
    if !transport.has_endpoint(endpoint) {
        return Err(Error::CharacteristicNotFound(format!("{endpoint:?}")));
    }
    cancellable(transport.read(endpoint), timeout, cancel).await
}

/// Write counterpart of [`read_endpoint`].
pub async fn write_endpoint(
    transport: &dyn Transport,
    endpoint: Endpoint,
    payload: Vec<u8>,
    timeout: Duration,
    cancel: &Cancellation,
) -> Result<Option<()>> {
    if !transport.has_endpoint(endpoint) {
        return Err(Error::CharacteristicNotFound(format!("{endpoint:?}")));
    }
    cancellable(transport.write(endpoint, payload), timeout, cancel).await
}
