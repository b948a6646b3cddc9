//! GATT UUIDs, timing constants, and the text command grammar spoken to the
//! peripheral.
//!
//! All UUIDs belong to the vendor namespace
//! `522b443a-4f53-534d-XXXX-420badbabe69`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::Error;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service UUID advertised by the peripheral.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x522b443a_4f53_534d_0001_420badbabe69);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Bidirectional command channel.
///
/// The host writes UTF-8 command frames (see [`Command`]) and the firmware
/// answers with a notification on the same characteristic
/// (see [`classify_response`]).  There is no request id on the wire.
pub const COMMAND_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x522b443a_4f53_534d_1000_420badbabe69);

/// Speed-knob configuration, a single `"true"` / `"false"` text value.
pub const SPEED_KNOB_CONFIG_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x522b443a_4f53_534d_1010_420badbabe69);

/// High-frequency device state, a JSON record notified on every change.
pub const STATE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x522b443a_4f53_534d_2000_420badbabe69);

/// Pattern index/name list.  Read-only.
pub const PATTERN_LIST_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x522b443a_4f53_534d_3000_420badbabe69);

/// Pattern description.  Write an index as text, then read the description.
pub const PATTERN_DESCRIPTION_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x522b443a_4f53_534d_3010_420badbabe69);

/// Logical endpoints the engine talks to.
///
/// The transport maps each endpoint to a resolved characteristic; the engine
/// never sees UUIDs or platform handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Command,
    State,
    PatternList,
    PatternDescription,
    SpeedKnobConfig,
}

impl Endpoint {
    /// Every endpoint, in discovery order.
    pub const ALL: [Endpoint; 5] = [
        Endpoint::Command,
        Endpoint::State,
        Endpoint::PatternList,
        Endpoint::PatternDescription,
        Endpoint::SpeedKnobConfig,
    ];

    /// GATT characteristic UUID backing this endpoint.
    pub fn uuid(self) -> Uuid {
        match self {
            Endpoint::Command => COMMAND_CHARACTERISTIC,
            Endpoint::State => STATE_CHARACTERISTIC,
            Endpoint::PatternList => PATTERN_LIST_CHARACTERISTIC,
            Endpoint::PatternDescription => PATTERN_DESCRIPTION_CHARACTERISTIC,
            Endpoint::SpeedKnobConfig => SPEED_KNOB_CONFIG_CHARACTERISTIC,
        }
    }

    /// Reverse lookup used when dispatching notifications.
    pub fn from_uuid(uuid: Uuid) -> Option<Endpoint> {
        Endpoint::ALL.into_iter().find(|e| e.uuid() == uuid)
    }

    /// Endpoints without which the engine cannot operate at all.
    pub fn is_required(self) -> bool {
        matches!(self, Endpoint::Command | Endpoint::State)
    }
}

// ── Timing constants ──────────────────────────────────────────────────────────

/// How long a background command waits for its firmware response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default window for awaited commands when the caller does not pass one.
pub const DEFAULT_AWAITED_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on each individual characteristic read or write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Homing estimate, in seconds, used before any duration has been learned.
pub const DEFAULT_HOMING_ESTIMATE_SECS: f64 = 5.0;

/// Valid range for speed, stroke, depth, sensation and stream position.
pub const PERCENT_RANGE: std::ops::RangeInclusive<i64> = 0..=100;

// ── Pages and parameters ──────────────────────────────────────────────────────

/// Top-level firmware pages reachable with `go:<page>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Page {
    Menu,
    SimplePenetration,
    StrokeEngine,
    Streaming,
}

impl Page {
    pub fn as_str(self) -> &'static str {
        match self {
            Page::Menu => "menu",
            Page::SimplePenetration => "simplePenetration",
            Page::StrokeEngine => "strokeEngine",
            Page::Streaming => "streaming",
        }
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Page {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "menu" => Ok(Page::Menu),
            "simplePenetration" => Ok(Page::SimplePenetration),
            "strokeEngine" => Ok(Page::StrokeEngine),
            "streaming" => Ok(Page::Streaming),
            other => Err(Error::InvalidParameter(format!("unknown page '{other}'"))),
        }
    }
}

/// Parameters settable with `set:<param>:<int>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    Speed,
    Stroke,
    Depth,
    Sensation,
    Pattern,
}

impl Parameter {
    pub fn as_str(self) -> &'static str {
        match self {
            Parameter::Speed => "speed",
            Parameter::Stroke => "stroke",
            Parameter::Depth => "depth",
            Parameter::Sensation => "sensation",
            Parameter::Pattern => "pattern",
        }
    }

    /// Check `value` against the parameter's accepted range.
    ///
    /// Percentage parameters accept `0..=100`.  Pattern only has to be
    /// non-negative; the firmware wraps larger indices itself.
    pub fn validate(self, value: i64) -> Result<(), Error> {
        let ok = match self {
            Parameter::Pattern => value >= 0,
            _ => PERCENT_RANGE.contains(&value),
        };
        if ok {
            Ok(())
        } else if self == Parameter::Pattern {
            Err(Error::InvalidParameter(format!(
                "pattern must be non-negative, got {value}"
            )))
        } else {
            Err(Error::InvalidParameter(format!(
                "{} must be within 0..=100, got {value}",
                self.as_str()
            )))
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Parameter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "speed" => Ok(Parameter::Speed),
            "stroke" => Ok(Parameter::Stroke),
            "depth" => Ok(Parameter::Depth),
            "sensation" => Ok(Parameter::Sensation),
            "pattern" => Ok(Parameter::Pattern),
            other => Err(Error::InvalidParameter(format!(
                "unknown parameter '{other}'"
            ))),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// A text command for the command characteristic.
///
/// Wire grammar:
/// ```text
/// go:<page>
/// set:<param>:<int>
/// stream:<position>:<timeMs>
/// ```
///
/// [`Command::Raw`] carries arbitrary text for diagnostics and is sent
/// verbatim without validation.
///
/// ```
/// # use stroke_rs::protocol::{Command, Parameter};
/// let cmd = Command::Set { param: Parameter::Speed, value: 50 };
/// assert_eq!(cmd.to_string(), "set:speed:50");
/// assert_eq!("set:speed:50".parse::<Command>().unwrap(), cmd);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Navigate(Page),
    Set { param: Parameter, value: i64 },
    Stream { position: i64, time_ms: i64 },
    Raw(String),
}

impl Command {
    /// Local validation.  A command that fails here never reaches the transport.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Command::Navigate(_) => Ok(()),
            Command::Set { param, value } => param.validate(*value),
            Command::Stream { position, time_ms } => {
                if !PERCENT_RANGE.contains(position) {
                    return Err(Error::InvalidParameter(format!(
                        "stream position must be within 0..=100, got {position}"
                    )));
                }
                if *time_ms < 0 {
                    return Err(Error::InvalidParameter(format!(
                        "stream time must be non-negative, got {time_ms}"
                    )));
                }
                Ok(())
            }
            Command::Raw(text) if text.is_empty() => {
                Err(Error::InvalidParameter("empty command".into()))
            }
            Command::Raw(_) => Ok(()),
        }
    }

    /// Whether the firmware answers this command.
    ///
    /// Streaming position updates are fire-and-forget; everything else owes
    /// a response notification.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::Stream { .. })
    }

    /// UTF-8 frame written to [`COMMAND_CHARACTERISTIC`].
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Navigate(page) => write!(f, "go:{page}"),
            Command::Set { param, value } => write!(f, "set:{param}:{value}"),
            Command::Stream { position, time_ms } => write!(f, "stream:{position}:{time_ms}"),
            Command::Raw(text) => f.write_str(text),
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    /// Parse the wire grammar.  Unknown verbs are rejected rather than mapped
    /// to [`Command::Raw`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let int = |text: &str| -> Result<i64, Error> {
            text.parse::<i64>()
                .map_err(|_| Error::InvalidParameter(format!("'{text}' is not an integer")))
        };
        match parts.as_slice() {
            ["go", page] => Ok(Command::Navigate(page.parse()?)),
            ["set", param, value] => Ok(Command::Set {
                param: param.parse()?,
                value: int(value)?,
            }),
            ["stream", position, time_ms] => Ok(Command::Stream {
                position: int(position)?,
                time_ms: int(time_ms)?,
            }),
            _ => Err(Error::InvalidParameter(format!("unrecognised command '{s}'"))),
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Classification of a notification on the command characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// `ok` or `ok:<detail>`.
    Ok,
    /// `fail:<reason>`; carries the reason.
    Fail(String),
    /// Anything else.
    Malformed,
}

/// Classify a response by its prefix.
///
/// ```
/// # use stroke_rs::protocol::{classify_response, ResponseKind};
/// assert_eq!(classify_response("ok"), ResponseKind::Ok);
/// assert_eq!(classify_response("ok:speed"), ResponseKind::Ok);
/// assert_eq!(classify_response("fail:busy"), ResponseKind::Fail("busy".into()));
/// assert_eq!(classify_response("okay"), ResponseKind::Malformed);
/// ```
pub fn classify_response(text: &str) -> ResponseKind {
    let text = text.trim();
    if text == "ok" || text.starts_with("ok:") {
        ResponseKind::Ok
    } else if let Some(reason) = text.strip_prefix("fail:") {
        ResponseKind::Fail(reason.to_owned())
    } else {
        ResponseKind::Malformed
    }
}

/// Decode a characteristic value as text.
///
/// Invalid UTF-8 is replaced lossily and trailing NUL padding (some stacks pad
/// reads to the MTU) is stripped.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_owned()
}

// ── Speed-knob configuration ──────────────────────────────────────────────────

/// Parse the speed-knob-config value.
///
/// Accepts `true`/`false`, `1`/`0` and `t`/`f`, case-insensitively.
/// Returns `None` for anything else.
pub fn parse_knob_config(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "t" => Some(true),
        "false" | "0" | "f" => Some(false),
        _ => None,
    }
}

/// Encode the speed-knob-config value.
pub fn encode_knob_config(as_limit: bool) -> Vec<u8> {
    if as_limit { b"true".to_vec() } else { b"false".to_vec() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_produce_exact_text_across_range() {
        for param in [
            Parameter::Speed,
            Parameter::Stroke,
            Parameter::Depth,
            Parameter::Sensation,
        ] {
            for v in 0..=100 {
                let cmd = Command::Set { param, value: v };
                assert!(cmd.validate().is_ok());
                assert_eq!(cmd.to_string(), format!("set:{}:{v}", param.as_str()));
            }
            for v in [-1, 101, 150, i64::MIN, i64::MAX] {
                let err = Command::Set { param, value: v }.validate().unwrap_err();
                assert!(matches!(err, Error::InvalidParameter(_)));
            }
        }
    }

    #[test]
    fn pattern_only_requires_non_negative() {
        assert!(Parameter::Pattern.validate(0).is_ok());
        assert!(Parameter::Pattern.validate(250).is_ok());
        assert!(Parameter::Pattern.validate(-1).is_err());
    }

    #[test]
    fn navigation_and_stream_text() {
        assert_eq!(Command::Navigate(Page::StrokeEngine).to_string(), "go:strokeEngine");
        assert_eq!(
            Command::Stream { position: 40, time_ms: 250 }.to_string(),
            "stream:40:250"
        );
        assert!(!Command::Stream { position: 40, time_ms: 250 }.expects_response());
        assert!(Command::Navigate(Page::Menu).expects_response());
    }

    #[test]
    fn stream_validation() {
        assert!(Command::Stream { position: 101, time_ms: 0 }.validate().is_err());
        assert!(Command::Stream { position: 0, time_ms: -5 }.validate().is_err());
        assert!(Command::Stream { position: 100, time_ms: 0 }.validate().is_ok());
    }

    #[test]
    fn parses_grammar() {
        assert_eq!(
            "go:streaming".parse::<Command>().unwrap(),
            Command::Navigate(Page::Streaming)
        );
        assert_eq!(
            "stream:10:500".parse::<Command>().unwrap(),
            Command::Stream { position: 10, time_ms: 500 }
        );
        assert!("go:nowhere".parse::<Command>().is_err());
        assert!("set:speed:fast".parse::<Command>().is_err());
        assert!("jump".parse::<Command>().is_err());
    }

    #[test]
    fn response_classification() {
        assert_eq!(classify_response("ok\n"), ResponseKind::Ok);
        assert_eq!(classify_response("fail:"), ResponseKind::Fail(String::new()));
        assert_eq!(classify_response(""), ResponseKind::Malformed);
        assert_eq!(classify_response("error"), ResponseKind::Malformed);
    }

    #[test]
    fn knob_config_values() {
        for t in ["true", "TRUE", "1", "t", " T "] {
            assert_eq!(parse_knob_config(t), Some(true));
        }
        for f in ["false", "0", "f", "False"] {
            assert_eq!(parse_knob_config(f), Some(false));
        }
        assert_eq!(parse_knob_config("maybe"), None);
        assert_eq!(encode_knob_config(true), b"true");
    }

    #[test]
    fn endpoint_uuid_roundtrip() {
        for e in Endpoint::ALL {
            assert_eq!(Endpoint::from_uuid(e.uuid()), Some(e));
        }
        assert_eq!(Endpoint::from_uuid(SERVICE_UUID), None);
    }

    #[test]
    fn decode_text_strips_padding() {
        assert_eq!(decode_text(b"ok\0\0"), "ok");
    }
}
