//! Debug/simulation mode: commands are applied to an in-memory
//! [`DeviceState`] instead of being written to the transport.
//!
//! The simulator speaks the same grammar and produces the same `ok` /
//! `fail:<reason>` responses as the firmware, so the engine resolves simulated
//! commands through the normal response path.

use crate::protocol::{Command, Parameter};
use crate::types::{DeviceState, RootStatus};

/// Apply `command` to `state`.
///
/// Returns the next state and the response text the firmware would send.
/// On failure the state is returned unchanged.
pub fn simulate(state: &DeviceState, command: &Command) -> (DeviceState, String) {
    match apply(state, command) {
        Ok(next) => (next, "ok".to_owned()),
        Err(reason) => (*state, format!("fail:{reason}")),
    }
}

fn apply(state: &DeviceState, command: &Command) -> Result<DeviceState, String> {
    command.validate().map_err(|e| e.to_string())?;
    let mut next = *state;
    match command {
        Command::Navigate(page) => next.status = (*page).into(),
        Command::Set { param, value } => {
            // range already validated
            let pct = (*value).clamp(0, 100) as u8;
            match param {
                Parameter::Speed => next.speed = pct,
                Parameter::Stroke => next.stroke = pct,
                Parameter::Depth => next.depth = pct,
                Parameter::Sensation => next.sensation = pct,
                Parameter::Pattern => next.pattern = u32::try_from(*value).unwrap_or(u32::MAX),
            }
        }
        Command::Stream { .. } => {
            if state.status.root() != RootStatus::Streaming {
                return Err("not streaming".into());
            }
        }
        Command::Raw(text) => {
            let parsed: Command = text.parse().map_err(|_| "unknown command".to_owned())?;
            return apply(state, &parsed);
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Page;
    use crate::types::Status;

    #[test]
    fn navigate_then_set() {
        let s = DeviceState::default();
        let (s, r) = simulate(&s, &Command::Navigate(Page::StrokeEngine));
        assert_eq!(r, "ok");
        assert_eq!(s.status, Status::StrokeEngine);
        let (s, r) = simulate(&s, &Command::Set { param: Parameter::Speed, value: 50 });
        assert_eq!(r, "ok");
        assert_eq!(s.speed, 50);
        assert_eq!(s.status, Status::StrokeEngine);
    }

    #[test]
    fn pattern_is_not_capped_at_100() {
        let (s, _) = simulate(
            &DeviceState::default(),
            &Command::Set { param: Parameter::Pattern, value: 130 },
        );
        assert_eq!(s.pattern, 130);
    }

    #[test]
    fn out_of_range_fails_without_change() {
        let start = DeviceState { speed: 10, ..DeviceState::default() };
        let (s, r) = simulate(&start, &Command::Set { param: Parameter::Speed, value: 150 });
        assert!(r.starts_with("fail:"));
        assert_eq!(s, start);
    }

    #[test]
    fn stream_requires_streaming_page() {
        let cmd = Command::Stream { position: 50, time_ms: 100 };
        let (_, r) = simulate(&DeviceState::default(), &cmd);
        assert_eq!(r, "fail:not streaming");

        let streaming = DeviceState { status: Status::StreamingIdle, ..DeviceState::default() };
        let (s, r) = simulate(&streaming, &cmd);
        assert_eq!(r, "ok");
        assert_eq!(s, streaming);
    }

    #[test]
    fn raw_text_uses_the_same_grammar() {
        let (s, r) = simulate(&DeviceState::default(), &Command::Raw("set:depth:30".into()));
        assert_eq!(r, "ok");
        assert_eq!(s.depth, 30);
        let (_, r) = simulate(&DeviceState::default(), &Command::Raw("reboot".into()));
        assert_eq!(r, "fail:unknown command");
    }
}
