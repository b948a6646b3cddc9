//! Decoders for characteristic payloads.
//!
//! All public functions in this module are pure (no I/O) and are safe to call
//! from any async or sync context.
//!
//! | Function | Characteristic | Format |
//! |---|---|---|
//! | [`decode_state`] | state | JSON object, lenient per-field defaults |
//! | [`parse_pattern_list`] | pattern list | one of four shapes, see [`PatternListShape`] |
//! | [`parse_pattern_description`] | pattern description | plain text or JSON |

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::types::{DeviceState, Status};

// ── State ─────────────────────────────────────────────────────────────────────

/// Decode a state notification into a [`DeviceState`].
///
/// Expected payload:
/// ```text
/// {"state":"strokeEngine.pattern","speed":40,"stroke":80,"depth":60,"sensation":50,"pattern":2}
/// ```
///
/// Fields are read independently so one bad field cannot discard the rest:
///
/// * missing or non-string `state` → `"idle"`; an unknown code → [`Status::Error`]
/// * missing or non-numeric integers → `0`
/// * percentages are clamped to `0..=100`; `pattern` is clamped at `0`
///
/// Returns `None` when the payload is not a JSON object at all.  The caller
/// keeps its last known state in that case.
///
/// ```
/// # use stroke_rs::parse::decode_state;
/// # use stroke_rs::types::Status;
/// let s = decode_state(br#"{"state":"menu","speed":12}"#).unwrap();
/// assert_eq!(s.status, Status::Menu);
/// assert_eq!(s.speed, 12);
/// assert_eq!(s.depth, 0);
/// assert!(decode_state(b"\x00\x01garbage").is_none());
/// ```
pub fn decode_state(bytes: &[u8]) -> Option<DeviceState> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let obj = value.as_object()?;

    let code = obj.get("state").and_then(Value::as_str).unwrap_or("idle");
    let status = Status::from_code(code).unwrap_or(Status::Error);

    Some(DeviceState {
        status,
        speed: percent_field(obj, "speed"),
        stroke: percent_field(obj, "stroke"),
        depth: percent_field(obj, "depth"),
        sensation: percent_field(obj, "sensation"),
        pattern: int_field(obj, "pattern").clamp(0, u32::MAX as i64) as u32,
    })
}

fn int_field(obj: &Map<String, Value>, key: &str) -> i64 {
    match obj.get(key) {
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        None => 0,
    }
}

fn percent_field(obj: &Map<String, Value>, key: &str) -> u8 {
    int_field(obj, key).clamp(0, 100) as u8
}

// ── Pattern list ──────────────────────────────────────────────────────────────

/// One `(index, name)` pair read from the pattern-list characteristic.
///
/// `name` may be empty; the catalog synthesises a display name later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPattern {
    pub index: u32,
    pub name: String,
}

/// Payload shapes accepted on the pattern-list characteristic, in the order
/// they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternListShape {
    /// `[{"idx":0,"name":"Simple Stroke"}, {"id":7,"name":"Custom"}]`
    ObjectArray,
    /// `["Simple Stroke", "Teasing Pounding"]`, index = position
    StringArray,
    /// `{"patterns":[...]}` or `{"0":"Simple Stroke","7":{"name":"Custom"}}`
    KeyedObject,
    /// `0:Simple Stroke\n7:Custom` or `Simple Stroke,Teasing Pounding`
    Delimited,
}

const SHAPE_PRIORITY: [PatternListShape; 4] = [
    PatternListShape::ObjectArray,
    PatternListShape::StringArray,
    PatternListShape::KeyedObject,
    PatternListShape::Delimited,
];

/// Keys under which a keyed object may nest the actual list.
const LIST_KEYS: [&str; 3] = ["patterns", "items", "list"];

#[derive(Debug, Deserialize)]
struct PatternObject {
    idx: Option<i64>,
    id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
}

/// Parse a pattern-list payload.
///
/// Each [`PatternListShape`] matcher is tried in fixed priority order; the
/// first one that recognises the payload wins.  A payload that is valid text
/// but matches no shape yields an empty list.  Only bytes that are not UTF-8
/// are treated as an error.
///
/// Indices are de-duplicated; the first occurrence of an index wins.
///
/// ```
/// # use stroke_rs::parse::parse_pattern_list;
/// let list = parse_pattern_list(br#"[{"idx":0,"name":"A"},{"id":9,"name":"B"}]"#).unwrap();
/// assert_eq!(list.iter().map(|p| p.index).collect::<Vec<_>>(), vec![0, 9]);
///
/// let list = parse_pattern_list(b"A, B\nC").unwrap();
/// assert_eq!(list[2].name, "C");
/// ```
pub fn parse_pattern_list(bytes: &[u8]) -> Result<Vec<RawPattern>, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::InvalidResponse(format!("pattern list is not UTF-8: {e}")))?;
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let json: Option<Value> = serde_json::from_str(text).ok();
    let items = SHAPE_PRIORITY
        .iter()
        .find_map(|&shape| match_shape(shape, text, json.as_ref()))
        .unwrap_or_default();

    Ok(dedup_by_index(items))
}

fn match_shape(shape: PatternListShape, text: &str, json: Option<&Value>) -> Option<Vec<RawPattern>> {
    match shape {
        PatternListShape::ObjectArray => match_object_array(json?),
        PatternListShape::StringArray => match_string_array(json?),
        PatternListShape::KeyedObject => match_keyed_object(json?),
        PatternListShape::Delimited => match json {
            None => Some(parse_delimited(text)),
            Some(Value::String(inner)) => Some(parse_delimited(inner)),
            Some(_) => None,
        },
    }
}

fn match_object_array(value: &Value) -> Option<Vec<RawPattern>> {
    let arr = value.as_array()?;
    if arr.is_empty() || !arr.iter().all(Value::is_object) {
        return None;
    }
    Some(
        arr.iter()
            .enumerate()
            .filter_map(|(pos, v)| {
                let obj = PatternObject::deserialize(v).ok()?;
                let index = obj.idx.or(obj.id).unwrap_or(pos as i64);
                let index = u32::try_from(index).ok()?;
                Some(RawPattern {
                    index,
                    name: obj.name.unwrap_or_default().trim().to_owned(),
                })
            })
            .collect(),
    )
}

fn match_string_array(value: &Value) -> Option<Vec<RawPattern>> {
    let arr = value.as_array()?;
    if !arr.iter().all(Value::is_string) {
        return None;
    }
    Some(
        arr.iter()
            .enumerate()
            .filter_map(|(pos, v)| {
                Some(RawPattern {
                    index: pos as u32,
                    name: v.as_str()?.trim().to_owned(),
                })
            })
            .collect(),
    )
}

fn match_keyed_object(value: &Value) -> Option<Vec<RawPattern>> {
    let obj = value.as_object()?;

    for key in LIST_KEYS {
        if let Some(inner) = obj.get(key) {
            return match_object_array(inner)
                .or_else(|| match_string_array(inner))
                .or(Some(Vec::new()));
        }
    }

    let mut items: Vec<RawPattern> = obj
        .iter()
        .filter_map(|(k, v)| {
            let index = k.trim().parse::<u32>().ok()?;
            let name = match v {
                Value::String(s) => s.trim().to_owned(),
                Value::Object(o) => o
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_owned(),
                _ => return None,
            };
            Some(RawPattern { index, name })
        })
        .collect();
    items.sort_by_key(|p| p.index);
    Some(items)
}

/// Newline- or comma-separated items, each either `name` (index = position)
/// or `index:name` / `index=name`.
fn parse_delimited(text: &str) -> Vec<RawPattern> {
    text.split(['\n', ','])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(pos, item)| {
            if let Some((idx, name)) = item.split_once([':', '=']) {
                if let Ok(index) = idx.trim().parse::<u32>() {
                    return RawPattern {
                        index,
                        name: name.trim().to_owned(),
                    };
                }
            }
            RawPattern {
                index: pos as u32,
                name: item.to_owned(),
            }
        })
        .collect()
}

fn dedup_by_index(items: Vec<RawPattern>) -> Vec<RawPattern> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|p| seen.insert(p.index)).collect()
}

// ── Pattern description ───────────────────────────────────────────────────────

/// Decode a pattern-description read.
///
/// Accepts plain text, a JSON string, or a JSON object with a `description`
/// field.  Blank results become `None`.
pub fn parse_pattern_description(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    let text = match serde_json::from_str::<Value>(text) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(obj)) => obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        _ => text.to_owned(),
    };
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(list: &[RawPattern]) -> Vec<u32> {
        list.iter().map(|p| p.index).collect()
    }

    #[test]
    fn state_full_record() {
        let s = decode_state(
            br#"{"state":"strokeEngine.pattern","speed":40,"stroke":80,"depth":60,"sensation":50,"pattern":2}"#,
        )
        .unwrap();
        assert_eq!(
            s,
            DeviceState {
                status: Status::StrokeEnginePattern,
                speed: 40,
                stroke: 80,
                depth: 60,
                sensation: 50,
                pattern: 2,
            }
        );
    }

    #[test]
    fn state_missing_fields_default() {
        let s = decode_state(b"{}").unwrap();
        assert_eq!(s, DeviceState::default());
        assert_eq!(s.status, Status::Idle);
    }

    #[test]
    fn state_invalid_fields_default_individually() {
        let s = decode_state(br#"{"state":42,"speed":"fast","depth":250,"pattern":-3}"#).unwrap();
        assert_eq!(s.status, Status::Idle);
        assert_eq!(s.speed, 0);
        assert_eq!(s.depth, 100);
        assert_eq!(s.pattern, 0);
    }

    #[test]
    fn state_unknown_code_maps_to_error() {
        let s = decode_state(br#"{"state":"dancing"}"#).unwrap();
        assert_eq!(s.status, Status::Error);
    }

    #[test]
    fn state_rejects_non_objects() {
        assert!(decode_state(b"").is_none());
        assert!(decode_state(b"[1,2]").is_none());
        assert!(decode_state(b"{\"state\":").is_none());
    }

    #[test]
    fn object_array_uses_idx_then_id_then_position() {
        let list = parse_pattern_list(
            br#"[{"idx":3,"name":"A"},{"id":8,"name":"B"},{"name":"C"},{"idx":-1,"name":"bad"}]"#,
        )
        .unwrap();
        assert_eq!(indices(&list), vec![3, 8, 2]);
        assert_eq!(list[1].name, "B");
    }

    #[test]
    fn string_array_uses_position() {
        let list = parse_pattern_list(br#"["A","B","C"]"#).unwrap();
        assert_eq!(indices(&list), vec![0, 1, 2]);
        assert_eq!(list[2].name, "C");
    }

    #[test]
    fn keyed_object_with_list_key() {
        let list = parse_pattern_list(br#"{"count":2,"patterns":["A","B"]}"#).unwrap();
        assert_eq!(indices(&list), vec![0, 1]);
    }

    #[test]
    fn keyed_object_with_numeric_keys() {
        let list = parse_pattern_list(br#"{"7":{"name":"Custom"},"0":"Simple","meta":1}"#).unwrap();
        assert_eq!(indices(&list), vec![0, 7]);
        assert_eq!(list[1].name, "Custom");
    }

    #[test]
    fn delimited_text() {
        let list = parse_pattern_list(b"0:Simple\n9=Custom\nPlain").unwrap();
        assert_eq!(indices(&list), vec![0, 9, 2]);
        assert_eq!(list[2].name, "Plain");
    }

    #[test]
    fn duplicates_keep_first() {
        let list = parse_pattern_list(b"1:First,1:Second").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "First");
    }

    #[test]
    fn empty_and_unmatched_json_yield_nothing() {
        assert!(parse_pattern_list(b"   ").unwrap().is_empty());
        assert!(parse_pattern_list(b"42").unwrap().is_empty());
        assert!(parse_pattern_list(b"[1,2]").unwrap().is_empty());
    }

    #[test]
    fn corrupt_bytes_error() {
        assert!(matches!(
            parse_pattern_list(&[0xff, 0xfe, 0x00]),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn description_shapes() {
        assert_eq!(parse_pattern_description(b"  Long text \0"), Some("Long text".into()));
        assert_eq!(parse_pattern_description(br#""quoted""#), Some("quoted".into()));
        assert_eq!(
            parse_pattern_description(br#"{"description":"from json"}"#),
            Some("from json".into())
        );
        assert_eq!(parse_pattern_description(b""), None);
    }
}
