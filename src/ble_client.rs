use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::protocol::Endpoint;
use crate::transport::{RadioState, Transport, TransportEvent};

// ── PeripheralDevice ──────────────────────────────────────────────────────────

/// A controller discovered during a BLE scan.
///
/// Returned by [`BleClient::scan_all`]; pass to [`BleClient::connect_to`].
#[derive(Clone, Debug)]
pub struct PeripheralDevice {
    /// Advertised device name (e.g. `"OSSM"`).
    pub name: String,
    /// Platform BLE identifier.
    /// • macOS / Windows — a UUID string
    /// • Linux — a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub id: String,
    pub(crate) peripheral: Peripheral,
    /// The adapter that discovered this device, kept for its event stream.
    pub(crate) adapter: Adapter,
}

// ── ClientConfig ──────────────────────────────────────────────────────────────

/// Configuration for [`BleClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// BLE scan duration in seconds before giving up. Default: `10`.
    pub scan_timeout_secs: u64,
    /// Match devices whose advertised name starts with this string.
    /// Default: `"OSSM"`.
    pub name_prefix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10,
            name_prefix: "OSSM".into(),
        }
    }
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

// ── BleClient ─────────────────────────────────────────────────────────────────

/// BLE client for the controller.
///
/// Scans, connects, discovers the service's characteristics and returns a
/// [`BleTransport`] plus the ordered [`TransportEvent`] stream the engine
/// consumes.  `Connected(name)` is always the first event.
pub struct BleClient {
    config: ClientConfig,
}

impl BleClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    async fn first_adapter() -> Result<Adapter> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        // CoreBluetooth starts in an "unknown" state; scanning before it
        // reaches poweredOn is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("macOS: adapter still in state {state:?} after 3 s, proceeding");
                            break;
                        }
                        debug!("macOS: adapter state = {state:?}, waiting…");
                    }
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        Ok(adapter)
    }

    // ── Public: scan ─────────────────────────────────────────────────────────

    /// Scan for `scan_timeout_secs` and return every device whose name
    /// matches the prefix.
    pub async fn scan_all(&self) -> Result<Vec<PeripheralDevice>> {
        let adapter = Self::first_adapter().await?;

        info!("scan_all: scanning for {} s …", self.config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    if name.starts_with(&self.config.name_prefix) {
                        let id = p.id().to_string();
                        info!("scan_all: found {name}  id={id}");
                        found.push(PeripheralDevice {
                            name,
                            id,
                            peripheral: p,
                            adapter: adapter.clone(),
                        });
                    }
                }
            }
        }
        info!("scan_all: {} device(s) found", found.len());
        Ok(found)
    }

    // ── Public: connect_to ────────────────────────────────────────────────────

    /// Connect to a device returned by [`BleClient::scan_all`].
    pub async fn connect_to(
        &self,
        device: PeripheralDevice,
    ) -> Result<(mpsc::Receiver<TransportEvent>, Arc<BleTransport>)> {
        self.setup_peripheral(device.peripheral, device.name, device.adapter)
            .await
    }

    // ── Public: connect (convenience) ────────────────────────────────────────

    /// Connect to the first device whose name matches the prefix.
    pub async fn connect(&self) -> Result<(mpsc::Receiver<TransportEvent>, Arc<BleTransport>)> {
        let adapter = Self::first_adapter().await?;

        info!(
            "Scanning for '{}' (timeout: {} s) …",
            self.config.name_prefix, self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let peripheral = self
            .find_first(&adapter, &self.config.name_prefix, self.config.scan_timeout_secs)
            .await;
        adapter.stop_scan().await.ok();
        let peripheral = peripheral?;

        let props = peripheral.properties().await?.unwrap_or_default();
        let device_name = props.local_name.unwrap_or_else(|| "Unknown".into());
        info!("Found device: {device_name}");

        self.setup_peripheral(peripheral, device_name, adapter).await
    }

    // ── Private: setup_peripheral ─────────────────────────────────────────────

    async fn setup_peripheral(
        &self,
        peripheral: Peripheral,
        device_name: String,
        adapter: Adapter,
    ) -> Result<(mpsc::Receiver<TransportEvent>, Arc<BleTransport>)> {
        // BlueZ's Device1.Connect can block forever when the device is out of range.
        tokio::time::timeout(Duration::from_secs(10), peripheral.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out after 10 s"))??;

        // BlueZ reports the connection before the GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("discover_services() timed out after 15 s"))??;
        info!("Connected and services discovered: {device_name}");

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let mut endpoints = HashMap::new();
        for c in &chars {
            if let Some(endpoint) = Endpoint::from_uuid(c.uuid) {
                debug!("{device_name}: {endpoint:?} -> {}", c.uuid);
                endpoints.insert(endpoint, c.clone());
            }
        }
        for endpoint in Endpoint::ALL {
            if !endpoints.contains_key(&endpoint) {
                if endpoint.is_required() {
                    warn!("{device_name}: required characteristic {endpoint:?} missing");
                } else {
                    info!("{device_name}: optional characteristic {endpoint:?} not present");
                }
            }
        }

        for endpoint in [Endpoint::Command, Endpoint::State, Endpoint::SpeedKnobConfig] {
            if let Some(c) = endpoints.get(&endpoint) {
                peripheral.subscribe(c).await?;
            }
        }

        // ── Event channel ─────────────────────────────────────────────────────
        let (tx, rx) = mpsc::channel::<TransportEvent>(256);
        let _ = tx.send(TransportEvent::Connected(device_name.clone())).await;

        // ── Adapter watcher ───────────────────────────────────────────────────
        // DeviceDisconnected fires faster than the notification stream closes.
        let adapter_tx = tx.clone();
        let peripheral_id = peripheral.id();
        tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        match event {
                            CentralEvent::DeviceDisconnected(id) if id == peripheral_id => {
                                info!("Adapter watcher: device {id:?} disconnected.");
                                let _ = adapter_tx.send(TransportEvent::Disconnected).await;
                                break;
                            }
                            CentralEvent::StateUpdate(state) => {
                                let radio = radio_state(state);
                                let lost = radio.is_unavailable();
                                let _ = adapter_tx
                                    .send(TransportEvent::RadioStateChanged(radio))
                                    .await;
                                if lost {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    warn!("Adapter watcher: could not subscribe to adapter events: {e}");
                }
            }
        });

        // ── Notification dispatch ─────────────────────────────────────────────
        let notify_peripheral = peripheral.clone();
        tokio::spawn(async move {
            let mut notifications = match notify_peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("could not get notifications stream: {e}");
                    let _ = tx.send(TransportEvent::Disconnected).await;
                    return;
                }
            };
            while let Some(notif) = notifications.next().await {
                let Some(endpoint) = Endpoint::from_uuid(notif.uuid) else {
                    debug!("notification from unknown characteristic {}", notif.uuid);
                    continue;
                };
                let event = TransportEvent::Notification {
                    endpoint,
                    value: notif.value,
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            info!("Notification stream ended, device disconnected.");
            let _ = tx.send(TransportEvent::Disconnected).await;
        });

        let transport = Arc::new(BleTransport {
            peripheral,
            endpoints,
        });
        Ok((rx, transport))
    }

    // ── Private: find_first ───────────────────────────────────────────────────

    /// Poll until the first matching peripheral appears or the timeout expires.
    async fn find_first(
        &self,
        adapter: &Adapter,
        prefix: &str,
        timeout_secs: u64,
    ) -> Result<Peripheral> {
        use tokio::time::{sleep, timeout};

        let result = timeout(Duration::from_secs(timeout_secs), async {
            loop {
                let peripherals = adapter.peripherals().await.unwrap_or_default();
                for p in peripherals {
                    if let Ok(Some(props)) = p.properties().await {
                        if let Some(name) = &props.local_name {
                            if name.starts_with(prefix) {
                                return p;
                            }
                        }
                    }
                }
                sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

        result.map_err(|_| anyhow!("Timed out scanning for '{prefix}' after {timeout_secs} s"))
    }
}

// ── BleTransport ──────────────────────────────────────────────────────────────

/// [`Transport`] over a connected btleplug peripheral.
pub struct BleTransport {
    peripheral: Peripheral,
    endpoints: HashMap<Endpoint, Characteristic>,
}

impl BleTransport {
    fn characteristic(&self, endpoint: Endpoint) -> crate::error::Result<&Characteristic> {
        self.endpoints
            .get(&endpoint)
            .ok_or_else(|| Error::CharacteristicNotFound(format!("{endpoint:?}")))
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn has_endpoint(&self, endpoint: Endpoint) -> bool {
        self.endpoints.contains_key(&endpoint)
    }

    async fn write(&self, endpoint: Endpoint, payload: Vec<u8>) -> crate::error::Result<()> {
        let c = self.characteristic(endpoint)?;
        self.peripheral
            .write(c, &payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, endpoint: Endpoint) -> crate::error::Result<Vec<u8>> {
        let c = self.characteristic(endpoint)?;
        Ok(self.peripheral.read(c).await?)
    }

    async fn disconnect(&self) -> crate::error::Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
