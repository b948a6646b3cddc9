use std::fmt;
use std::time::SystemTime;

use tokio::time::Instant;

use crate::protocol::Page;

// ── Device status ─────────────────────────────────────────────────────────────

/// Fine-grained firmware status, as reported in the `state` field of the
/// state characteristic.
///
/// Status codes are dot-namespaced (`"strokeEngine.preflight"`); the first
/// segment is the coarse [`RootStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Idle,
    Homing,
    HomingForward,
    HomingBackward,
    Menu,
    MenuIdle,
    SimplePenetration,
    SimplePenetrationIdle,
    SimplePenetrationPreflight,
    StrokeEngine,
    StrokeEngineIdle,
    StrokeEnginePreflight,
    StrokeEnginePattern,
    Streaming,
    StreamingIdle,
    StreamingPreflight,
    Update,
    UpdateChecking,
    UpdateUpdating,
    UpdateIdle,
    Wifi,
    WifiIdle,
    Help,
    HelpIdle,
    Error,
    ErrorIdle,
    ErrorHelp,
    Restart,
}

/// Wire codes in the same order as the enum.
const STATUS_CODES: [(Status, &str); 28] = [
    (Status::Idle, "idle"),
    (Status::Homing, "homing"),
    (Status::HomingForward, "homing.forward"),
    (Status::HomingBackward, "homing.backward"),
    (Status::Menu, "menu"),
    (Status::MenuIdle, "menu.idle"),
    (Status::SimplePenetration, "simplePenetration"),
    (Status::SimplePenetrationIdle, "simplePenetration.idle"),
    (Status::SimplePenetrationPreflight, "simplePenetration.preflight"),
    (Status::StrokeEngine, "strokeEngine"),
    (Status::StrokeEngineIdle, "strokeEngine.idle"),
    (Status::StrokeEnginePreflight, "strokeEngine.preflight"),
    (Status::StrokeEnginePattern, "strokeEngine.pattern"),
    (Status::Streaming, "streaming"),
    (Status::StreamingIdle, "streaming.idle"),
    (Status::StreamingPreflight, "streaming.preflight"),
    (Status::Update, "update"),
    (Status::UpdateChecking, "update.checking"),
    (Status::UpdateUpdating, "update.updating"),
    (Status::UpdateIdle, "update.idle"),
    (Status::Wifi, "wifi"),
    (Status::WifiIdle, "wifi.idle"),
    (Status::Help, "help"),
    (Status::HelpIdle, "help.idle"),
    (Status::Error, "error"),
    (Status::ErrorIdle, "error.idle"),
    (Status::ErrorHelp, "error.help"),
    (Status::Restart, "restart"),
];

impl Status {
    /// Look up a wire status code.  Returns `None` for unknown codes.
    pub fn from_code(code: &str) -> Option<Status> {
        STATUS_CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(s, _)| *s)
    }

    /// Wire status code.
    pub fn code(self) -> &'static str {
        STATUS_CODES
            .iter()
            .find(|(s, _)| *s == self)
            .map(|(_, c)| *c)
            .unwrap_or("error")
    }

    /// Coarse status used for page routing and homing detection.
    ///
    /// Homing keeps its direction, because the homing tracker needs it;
    /// every other status collapses to its first namespace segment.
    pub fn root(self) -> RootStatus {
        match self {
            Status::Idle => RootStatus::Idle,
            Status::Homing => RootStatus::Homing,
            Status::HomingForward => RootStatus::HomingForward,
            Status::HomingBackward => RootStatus::HomingBackward,
            Status::Menu | Status::MenuIdle => RootStatus::Menu,
            Status::SimplePenetration
            | Status::SimplePenetrationIdle
            | Status::SimplePenetrationPreflight => RootStatus::SimplePenetration,
            Status::StrokeEngine
            | Status::StrokeEngineIdle
            | Status::StrokeEnginePreflight
            | Status::StrokeEnginePattern => RootStatus::StrokeEngine,
            Status::Streaming | Status::StreamingIdle | Status::StreamingPreflight => {
                RootStatus::Streaming
            }
            Status::Update | Status::UpdateChecking | Status::UpdateUpdating | Status::UpdateIdle => {
                RootStatus::Update
            }
            Status::Wifi | Status::WifiIdle => RootStatus::Wifi,
            Status::Help | Status::HelpIdle => RootStatus::Help,
            Status::Error | Status::ErrorIdle | Status::ErrorHelp => RootStatus::Error,
            Status::Restart => RootStatus::Restart,
        }
    }
}

impl From<Page> for Status {
    fn from(page: Page) -> Self {
        match page {
            Page::Menu => Status::Menu,
            Page::SimplePenetration => Status::SimplePenetration,
            Page::StrokeEngine => Status::StrokeEngine,
            Page::Streaming => Status::Streaming,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Coarse device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RootStatus {
    #[default]
    Idle,
    Homing,
    HomingForward,
    HomingBackward,
    Menu,
    SimplePenetration,
    StrokeEngine,
    Streaming,
    Update,
    Wifi,
    Help,
    Error,
    Restart,
}

impl RootStatus {
    /// The page this status belongs to, if it is one of the navigable pages.
    pub fn page(self) -> Option<Page> {
        match self {
            RootStatus::Menu => Some(Page::Menu),
            RootStatus::SimplePenetration => Some(Page::SimplePenetration),
            RootStatus::StrokeEngine => Some(Page::StrokeEngine),
            RootStatus::Streaming => Some(Page::Streaming),
            _ => None,
        }
    }
}

// ── Device state ──────────────────────────────────────────────────────────────

/// One decoded state notification.
///
/// Replaced wholesale on every update; equality is structural and is used to
/// suppress redundant publications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub status: Status,
    /// 0–100.
    pub speed: u8,
    /// 0–100.
    pub stroke: u8,
    /// 0–100.
    pub depth: u8,
    /// 0–100.
    pub sensation: u8,
    /// Selected pattern index.
    pub pattern: u32,
}

// ── Pattern catalog ───────────────────────────────────────────────────────────

/// A selectable motion pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternEntry {
    /// Catalog key.  Unique, not necessarily contiguous.
    pub index: u32,
    pub name: String,
    /// Long-form description.
    pub description: Option<String>,
    /// What the sensation axis does for this pattern.
    pub sensation: Option<String>,
}

// ── Command ledger ────────────────────────────────────────────────────────────

/// Ledger key for one outbound command attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-level result of writing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResult {
    Pending,
    Success,
    Failure(String),
}

/// Final outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Pending,
    Succeeded,
    FirmwareFailed,
    MalformedResponse,
    TimedOut,
    TransportFailed,
    /// A response arrived with nothing waiting for it.
    UnmatchedResponse,
}

impl CommandOutcome {
    pub fn is_resolved(self) -> bool {
        self != CommandOutcome::Pending
    }
}

/// Lifecycle record of one outbound command.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub id: EventId,
    /// Literal command text as written (empty for unmatched responses).
    pub command: String,
    pub created_at: SystemTime,
    pub transport_result: TransportResult,
    pub firmware_response: Option<String>,
    pub outcome: CommandOutcome,
    pub resolved_at: Option<SystemTime>,
}

// ── Connection and homing ─────────────────────────────────────────────────────

/// Link state published by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Transport attached, waiting for the link-up event.
    Connecting,
    /// Link is up; carries the advertised device name.
    Connected(String),
    /// The radio is powered off or unsupported.
    RadioUnavailable,
}

/// Homing direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HomingDirection {
    Forward,
    Backward,
}

/// Live homing progress estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomingProgress {
    pub direction: HomingDirection,
    pub started_at: Instant,
    pub estimated_end: Instant,
}

impl HomingProgress {
    /// Fraction of the estimate elapsed at `now`, clamped to `0.0..=1.0`.
    pub fn fraction(&self, now: Instant) -> f64 {
        let total = self.estimated_end.saturating_duration_since(self.started_at);
        if total.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.started_at);
        (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_codes_roundtrip() {
        for (status, code) in STATUS_CODES {
            assert_eq!(Status::from_code(code), Some(status));
            assert_eq!(status.code(), code);
        }
        assert_eq!(Status::from_code("dance"), None);
    }

    #[test]
    fn root_collapses_namespaces() {
        assert_eq!(Status::StrokeEnginePattern.root(), RootStatus::StrokeEngine);
        assert_eq!(Status::MenuIdle.root(), RootStatus::Menu);
        assert_eq!(Status::HomingForward.root(), RootStatus::HomingForward);
        assert_eq!(Status::from(Page::Streaming).root().page(), Some(Page::Streaming));
        assert_eq!(RootStatus::Update.page(), None);
    }

    #[test]
    fn progress_fraction_is_clamped() {
        let start = Instant::now();
        let p = HomingProgress {
            direction: HomingDirection::Forward,
            started_at: start,
            estimated_end: start + Duration::from_secs(4),
        };
        assert_eq!(p.fraction(start), 0.0);
        assert!((p.fraction(start + Duration::from_secs(1)) - 0.25).abs() < 1e-9);
        assert_eq!(p.fraction(start + Duration::from_secs(10)), 1.0);
    }
}
