//! # stroke-rs
//!
//! Async Rust remote-control engine for motorized linear-actuator devices
//! driven over Bluetooth Low Energy.
//!
//! The device exposes one GATT service.  Commands are short ASCII strings
//! written to a command characteristic; the firmware answers each one, in
//! order, with an `ok` / `fail:<reason>` notification on the same
//! characteristic.  Live device state streams as JSON on a second
//! characteristic.
//!
//! | Characteristic | Direction | Payload |
//! |---|---|---|
//! | command | write + notify | `go:<page>`, `set:<param>:<n>`, `stream:<pos>:<ms>` / `ok`, `fail:…` |
//! | state | read + notify | `{"state":"strokeEngine.idle","speed":50,…}` |
//! | speed knob config | read + write + notify | `true` / `false` |
//! | pattern list | read | JSON or delimited list of `(index, name)` |
//! | pattern description | write index, then read | plain text |
//!
//! The wire carries no request id, so the [`engine`] correlates replies
//! positionally: write-ack order equals response order equals submission
//! order.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use stroke_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::spawn(EngineConfig::default(), Box::new(MemorySettings::new()));
//!
//!     let (events, transport) = BleClient::new(ClientConfig::default()).connect().await?;
//!     engine.attach(transport as Arc<dyn Transport>, events).await?;
//!
//!     engine.navigate_to(Page::StrokeEngine).await?;
//!     engine.set_speed(40).await?;
//!
//!     let mut state = engine.device_state();
//!     while state.changed().await.is_ok() {
//!         println!("{:?}", *state.borrow());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`engine`] | The engine task and its [`engine::EngineHandle`] command API |
//! | [`ble_client`] | BLE scanning, connecting, and the btleplug [`transport::Transport`] |
//! | [`transport`] | The transport capability, its events, and cancellable I/O helpers |
//! | [`correlation`] | Positional command/response matching and the awaited slot |
//! | [`ledger`] | Bounded diagnostic history of every command |
//! | [`catalog`] | Built-in patterns and the device catalog fetch |
//! | [`homing`] | Homing edge detection and learned durations |
//! | [`simulator`] | Offline command application for debug mode |
//! | [`settings`] | Persisted key-value settings |
//! | [`types`] | Device state, status codes, ledger and connection types |
//! | [`protocol`] | GATT UUIDs, command grammar, response classification |
//! | [`parse`] | State and pattern-list decoders |
//! | [`error`] | The crate's error type |

pub mod ble_client;
pub mod catalog;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod homing;
pub mod ledger;
pub mod parse;
pub mod protocol;
pub mod settings;
pub mod simulator;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Engine ────────────────────────────────────────────────────────────────
    pub use crate::engine::{Engine, EngineConfig, EngineHandle};
    pub use crate::error::{Error, Result};

    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::ble_client::{BleClient, BleTransport, ClientConfig, PeripheralDevice};
    pub use crate::transport::{RadioState, Transport, TransportEvent};

    // ── Settings ──────────────────────────────────────────────────────────────
    pub use crate::settings::{JsonFileSettings, MemorySettings, SettingsStore};

    // ── Protocol and data types ───────────────────────────────────────────────
    pub use crate::protocol::{Command, Endpoint, Page, Parameter};
    pub use crate::types::{
        CommandEvent, CommandOutcome, ConnectionState, DeviceState, EventId, HomingDirection,
        HomingProgress, PatternEntry, RootStatus, Status,
    };
}
