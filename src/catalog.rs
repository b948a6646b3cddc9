//! Pattern catalog: the static fallback set and the device fetch sequence.
//!
//! The fetch is a short request/response sequence over the transport:
//!
//! ```text
//! read pattern list ──► partition known / custom ──► per custom index:
//!                                                     write "<index>" ─► read description
//! ```
//!
//! Known indices keep their static text; custom indices use the device's
//! name and description.  Any failure of the overall sequence falls back to
//! the static set wholesale.  Cancellation is checked before every step and
//! yields no catalog at all, so the caller's previous snapshot stays in place.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::parse::{parse_pattern_description, parse_pattern_list, RawPattern};
use crate::protocol::Endpoint;
use crate::transport::{read_endpoint, write_endpoint, Cancellation, Transport};
use crate::types::PatternEntry;

/// `(index, name, description, sensation)` for the seven built-in patterns.
const FALLBACK: [(u32, &str, &str, &str); 7] = [
    (
        0,
        "Simple Stroke",
        "Acceleration, coasting and deceleration split equally over each stroke.",
        "No effect.",
    ),
    (
        1,
        "Teasing Pounding",
        "Outward and inward strokes run at different speeds while keeping the overall rate.",
        "Shifts speed between the in and out strokes.",
    ),
    (
        2,
        "Robo Stroke",
        "Trapezoidal motion that ranges from smooth to sharply robotic.",
        "Sets how abruptly the stroke accelerates.",
    ),
    (
        3,
        "Half'n'Half",
        "Alternates full-depth and half-depth strokes.",
        "Shifts speed between the in and out strokes.",
    ),
    (
        4,
        "Deeper",
        "Each stroke goes a little deeper until full depth, then starts over.",
        "Sets how many strokes one cycle takes.",
    ),
    (
        5,
        "Stop'n'Go",
        "Strokes in bursts separated by pauses.",
        "Sets the pause length between bursts.",
    ),
    (
        6,
        "Insist",
        "Short strokes at the depth limit with full speed.",
        "Moves the short stroke toward the front or back.",
    ),
];

/// The seven statically known patterns.
pub fn fallback_catalog() -> Vec<PatternEntry> {
    FALLBACK
        .iter()
        .map(|&(index, name, description, sensation)| PatternEntry {
            index,
            name: name.to_owned(),
            description: Some(description.to_owned()),
            sensation: Some(sensation.to_owned()),
        })
        .collect()
}

/// Static entry for `index`, if it is one of the built-in patterns.
pub fn known_pattern(index: u32) -> Option<PatternEntry> {
    fallback_catalog().into_iter().find(|p| p.index == index)
}

/// Merge a device list with the descriptions fetched for its custom indices.
///
/// Each listed index appears exactly once, sorted by index.  A static entry
/// always wins over device text for the same index.
pub fn merge(listed: &[RawPattern], descriptions: &HashMap<u32, String>) -> Vec<PatternEntry> {
    let mut entries: Vec<PatternEntry> = listed
        .iter()
        .map(|raw| {
            known_pattern(raw.index).unwrap_or_else(|| PatternEntry {
                index: raw.index,
                name: if raw.name.is_empty() {
                    format!("Pattern {}", raw.index)
                } else {
                    raw.name.clone()
                },
                description: descriptions.get(&raw.index).cloned(),
                sensation: None,
            })
        })
        .collect();
    entries.sort_by_key(|p| p.index);
    entries.dedup_by_key(|p| p.index);
    entries
}

/// Build the catalog from the device.
///
/// Returns `None` only when cancelled; every other failure yields the static
/// fallback.
pub async fn fetch_catalog(
    transport: &dyn Transport,
    timeout: std::time::Duration,
    cancel: &Cancellation,
) -> Option<Vec<PatternEntry>> {
    if !transport.has_endpoint(Endpoint::PatternList) {
        info!("catalog: no pattern list characteristic, using fallback");
        return Some(fallback_catalog());
    }

    let bytes = match read_endpoint(transport, Endpoint::PatternList, timeout, cancel).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!("catalog: pattern list read failed: {e}");
            return Some(fallback_catalog());
        }
    };
    let listed = match parse_pattern_list(&bytes) {
        Ok(list) if !list.is_empty() => list,
        Ok(_) => {
            info!("catalog: device returned an empty list, using fallback");
            return Some(fallback_catalog());
        }
        Err(e) => {
            warn!("catalog: {e}, raw: {bytes:02x?}");
            return Some(fallback_catalog());
        }
    };

    let custom: Vec<u32> = listed
        .iter()
        .map(|p| p.index)
        .filter(|&i| known_pattern(i).is_none())
        .collect();
    debug!(
        "catalog: {} listed, {} custom: {custom:?}",
        listed.len(),
        custom.len()
    );

    let mut descriptions = HashMap::new();
    if transport.has_endpoint(Endpoint::PatternDescription) {
        for index in custom {
            if cancel.is_cancelled() {
                return None;
            }
            match describe(transport, index, timeout, cancel).await {
                Ok(Some(Some(text))) => {
                    descriptions.insert(index, text);
                }
                Ok(Some(None)) => {}
                Ok(None) => return None,
                Err(e) => warn!("catalog: description for pattern {index} failed: {e}"),
            }
        }
    } else if !custom.is_empty() {
        debug!("catalog: no description characteristic, custom patterns keep bare names");
    }

    if cancel.is_cancelled() {
        return None;
    }
    Some(merge(&listed, &descriptions))
}

/// One write+read round trip on the description characteristic.
///
/// `Ok(None)` means cancelled; `Ok(Some(None))` means the device had no text.
async fn describe(
    transport: &dyn Transport,
    index: u32,
    timeout: std::time::Duration,
    cancel: &Cancellation,
) -> crate::error::Result<Option<Option<String>>> {
    let payload = index.to_string().into_bytes();
    if write_endpoint(transport, Endpoint::PatternDescription, payload, timeout, cancel)
        .await?
        .is_none()
    {
        return Ok(None);
    }
    let bytes = read_endpoint(transport, Endpoint::PatternDescription, timeout, cancel).await?;
    Ok(bytes.map(|b| parse_pattern_description(&b)))
}
