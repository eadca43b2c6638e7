//! # Trace Format
//!
//! Raw record types for the Chrome Trace Event Format, as seen by an
//! importer.
//!
//! The Chrome Trace Event Format is a JSON-based format for recording
//! performance traces. A trace arrives either as a bare JSON array of
//! events or as a JSON object wrapping that array together with auxiliary
//! payloads (stack frames, sampling data, display hints, free-form
//! metadata).
//!
//! Unlike a writer-side view of the format, an importer cannot assume any
//! field is present or well typed: traces are produced by many tools, get
//! truncated mid-write, and carry vendor extensions. The types here are
//! therefore deliberately permissive: every field of [`TraceEvent`] is
//! optional except the phase tag, numeric/string unions (`id`, `bind_id`,
//! `sf`) normalize to strings, and unknown top-level container keys are
//! preserved as metadata instead of being rejected.
//!
//! ## Timestamps
//!
//! All raw timestamps (`ts`, `dur`, `tts`, `tdur`) are microseconds. The
//! `displayTimeUnit` container key ("ms" or "ns") is a display hint for the
//! consumer and does not change the encoding.

use std::collections::HashMap;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported trace root: expected object or array, got {0}")]
    UnsupportedRoot(&'static str),
}

/// Sentinel value of `args` marking that arguments were stripped from the
/// trace before it was written out.
pub const STRIPPED_ARGS: &str = "__stripped__";

/// Event phase, decoded from the single-character `ph` tag.
///
/// The phase determines the shape of the record and which importer handles
/// it. The set below is exactly the set the importer dispatches on; a tag
/// outside it decodes to `None` from [`Phase::from_tag`] and the caller
/// decides how loudly to complain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `B`: open a synchronous slice on a thread.
    DurationBegin,
    /// `E`: close the most recently opened slice.
    DurationEnd,
    /// `X`: a complete slice with an explicit duration.
    Complete,
    /// `i`: instant event; scoped to thread, process, or global by `s`.
    Instant,
    /// `I`: legacy spelling of `i`.
    InstantLegacy,
    /// `R`: navigation/user-timing mark, treated as a thread instant.
    Mark,
    /// `b`: nestable async begin.
    NestableAsyncBegin,
    /// `n`: nestable async instant.
    NestableAsyncInstant,
    /// `e`: nestable async end.
    NestableAsyncEnd,
    /// `S`: legacy async start.
    AsyncStart,
    /// `T`: legacy async step-into.
    AsyncStepInto,
    /// `p`: legacy async step-past.
    AsyncStepPast,
    /// `F`: legacy async finish.
    AsyncFinish,
    /// `s`: flow start (v1).
    FlowStart,
    /// `t`: flow step (v1).
    FlowStep,
    /// `f`: flow finish (v1).
    FlowFinish,
    /// `C`: counter sample.
    Counter,
    /// `M`: process/thread metadata.
    Metadata,
    /// `N`: object created.
    ObjectCreated,
    /// `O`: object snapshot.
    ObjectSnapshot,
    /// `D`: object destroyed.
    ObjectDestroyed,
    /// `P`: trace sample from a sampling profiler.
    Sample,
    /// `v`: process memory dump.
    ProcessMemoryDump,
    /// `V`: global memory dump.
    GlobalMemoryDump,
    /// `c`: clock sync marker.
    ClockSync,
}

impl Phase {
    /// Decode a raw `ph` tag. Returns `None` for anything outside the
    /// dispatch table, including multi-character tags.
    pub fn from_tag(tag: &str) -> Option<Phase> {
        let mut chars = tag.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        let phase = match c {
            'B' => Phase::DurationBegin,
            'E' => Phase::DurationEnd,
            'X' => Phase::Complete,
            'i' => Phase::Instant,
            'I' => Phase::InstantLegacy,
            'R' => Phase::Mark,
            'b' => Phase::NestableAsyncBegin,
            'n' => Phase::NestableAsyncInstant,
            'e' => Phase::NestableAsyncEnd,
            'S' => Phase::AsyncStart,
            'T' => Phase::AsyncStepInto,
            'p' => Phase::AsyncStepPast,
            'F' => Phase::AsyncFinish,
            's' => Phase::FlowStart,
            't' => Phase::FlowStep,
            'f' => Phase::FlowFinish,
            'C' => Phase::Counter,
            'M' => Phase::Metadata,
            'N' => Phase::ObjectCreated,
            'O' => Phase::ObjectSnapshot,
            'D' => Phase::ObjectDestroyed,
            'P' => Phase::Sample,
            'v' => Phase::ProcessMemoryDump,
            'V' => Phase::GlobalMemoryDump,
            'c' => Phase::ClockSync,
            _ => return None,
        };
        Some(phase)
    }

    pub fn tag(&self) -> char {
        match self {
            Phase::DurationBegin => 'B',
            Phase::DurationEnd => 'E',
            Phase::Complete => 'X',
            Phase::Instant => 'i',
            Phase::InstantLegacy => 'I',
            Phase::Mark => 'R',
            Phase::NestableAsyncBegin => 'b',
            Phase::NestableAsyncInstant => 'n',
            Phase::NestableAsyncEnd => 'e',
            Phase::AsyncStart => 'S',
            Phase::AsyncStepInto => 'T',
            Phase::AsyncStepPast => 'p',
            Phase::AsyncFinish => 'F',
            Phase::FlowStart => 's',
            Phase::FlowStep => 't',
            Phase::FlowFinish => 'f',
            Phase::Counter => 'C',
            Phase::Metadata => 'M',
            Phase::ObjectCreated => 'N',
            Phase::ObjectSnapshot => 'O',
            Phase::ObjectDestroyed => 'D',
            Phase::Sample => 'P',
            Phase::ProcessMemoryDump => 'v',
            Phase::GlobalMemoryDump => 'V',
            Phase::ClockSync => 'c',
        }
    }
}

/// Explicit two-part identifier carried by the `id2` field.
///
/// `local` ids are scoped to the emitting process; `global` ids span the
/// whole trace, overriding the per-phase default scoping.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Id2 {
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    pub local: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    pub global: Option<String>,
}

/// A single raw trace event record.
///
/// Field names match the wire format. Everything except `ph` is optional;
/// handlers validate the fields their phase requires and report typed
/// warnings for the rest.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Builder)]
pub struct TraceEvent {
    /// Single-character phase tag. See [`Phase::from_tag`].
    #[serde(default)]
    pub ph: String,

    /// Display name. Required for most phases, absent on bare `E` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Comma-separated category list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cat: Option<String>,

    /// Emitting process id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,

    /// Emitting thread id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<i64>,

    /// Wall-clock timestamp in microseconds.
    #[serde(default)]
    pub ts: f64,

    /// Wall-clock duration in microseconds (`X` events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,

    /// Thread-clock timestamp in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<f64>,

    /// Thread-clock duration in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdur: Option<f64>,

    /// Free-form argument bag, or the string [`STRIPPED_ARGS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,

    /// Correlation id for async/object/flow phases. Strings and numbers
    /// are both accepted on the wire and normalize to strings here.
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Explicit local/global identifier, overriding `id` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id2: Option<Id2>,

    /// Flow-binding id for `X` events participating in flow v2.
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_id: Option<String>,

    /// Instant scope: `t`hread, `p`rocess, or `g`lobal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,

    /// Flow v1 bind point override (`e` binds a finish to its enclosing
    /// slice instead of the next one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bp: Option<String>,

    /// Marks an `X` slice as a flow consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_in: Option<bool>,

    /// Marks an `X` slice as a flow producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_out: Option<bool>,

    /// Start stack frame id, resolved against the trace-level frame table.
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sf: Option<String>,

    /// End stack frame id.
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub esf: Option<String>,

    /// Raw program-counter trace for the start of the event. Mutually
    /// exclusive with `sf`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<Value>>,

    /// Raw program-counter trace for the end of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estack: Option<Vec<Value>>,

    /// Reserved color name from the viewer's palette.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,

    /// Id-scope disambiguator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// When truthy, async slices built from this event derive thread-time
    /// bounds from `tts`.
    #[serde(default, deserialize_with = "de_opt_truthy")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_async_tts: Option<bool>,
}

impl TraceEvent {
    /// Decoded phase tag, `None` when `ph` is unknown.
    pub fn phase(&self) -> Option<Phase> {
        Phase::from_tag(&self.ph)
    }

    /// Whether the argument bag was replaced by the stripped-args sentinel.
    pub fn has_stripped_args(&self) -> bool {
        matches!(&self.args, Some(Value::String(s)) if s == STRIPPED_ARGS)
    }

    /// Effective correlation id: `id2.global` wins, then `id2.local`
    /// prefixed with the emitting pid, then plain `id`.
    pub fn scoped_id(&self) -> Option<String> {
        if let Some(id2) = &self.id2 {
            if let Some(global) = &id2.global {
                return Some(global.clone());
            }
            if let Some(local) = &id2.local {
                return Some(format!("{}:{}", self.pid.unwrap_or(0), local));
            }
        }
        self.id.clone()
    }
}

/// One entry of the trace-level `stackFrames` dictionary.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StackFrameRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// One entry of the trace-level `samples` array (OS-level sampling
/// profiler data).
#[derive(Debug, Clone, Default, Deserialize, Serialize, Builder)]
pub struct SampleRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<i64>,
    #[serde(default)]
    pub ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

/// Free-form top-level key preserved from the container.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    pub name: String,
    pub value: Value,
}

/// Normalized trace container.
///
/// Both input shapes (the bare event array and the wrapping object)
/// parse into this. Recognized top-level keys land in their fields; every
/// other key is preserved verbatim in `metadata`.
#[derive(Debug, Default)]
pub struct TraceContainer {
    pub trace_events: Vec<TraceEvent>,
    pub system_trace_events: Option<String>,
    pub battor_log: Option<String>,
    pub samples: Vec<SampleRecord>,
    pub stack_frames: HashMap<String, StackFrameRecord>,
    pub display_time_unit: Option<String>,
    pub trace_annotations: Option<Value>,
    pub metadata: Vec<MetadataEntry>,
    /// Per-record deserialization failures. One bad record never rejects
    /// the trace; the importer reports these as warnings.
    pub malformed_events: Vec<String>,
}

impl TraceContainer {
    /// Parse a serialized trace, applying the string repair of
    /// [`repair_trace_string`] first.
    pub fn from_str(input: &str) -> Result<TraceContainer, FormatError> {
        let repaired = repair_trace_string(input);
        let value: Value = serde_json::from_str(&repaired)?;
        TraceContainer::from_value(value)
    }

    /// Normalize a pre-parsed JSON value.
    pub fn from_value(value: Value) -> Result<TraceContainer, FormatError> {
        match value {
            Value::Array(events) => {
                let mut container = TraceContainer::default();
                parse_events(events, &mut container);
                Ok(container)
            }
            Value::Object(map) => {
                let mut container = TraceContainer::default();
                for (key, value) in map {
                    match key.as_str() {
                        "traceEvents" => {
                            if let Value::Array(events) = value {
                                parse_events(events, &mut container);
                            }
                        }
                        "systemTraceEvents" => {
                            container.system_trace_events = value.as_str().map(String::from);
                        }
                        "battorLogAsString" => {
                            container.battor_log = value.as_str().map(String::from);
                        }
                        "samples" => {
                            container.samples = serde_json::from_value(value)?;
                        }
                        "stackFrames" => {
                            container.stack_frames = serde_json::from_value(value)?;
                        }
                        "displayTimeUnit" => {
                            container.display_time_unit = value.as_str().map(String::from);
                        }
                        "traceAnnotations" => {
                            container.trace_annotations = Some(value);
                        }
                        _ => container.metadata.push(MetadataEntry { name: key, value }),
                    }
                }
                Ok(container)
            }
            Value::Null => Err(FormatError::UnsupportedRoot("null")),
            Value::Bool(_) => Err(FormatError::UnsupportedRoot("bool")),
            Value::Number(_) => Err(FormatError::UnsupportedRoot("number")),
            Value::String(_) => Err(FormatError::UnsupportedRoot("string")),
        }
    }
}

fn parse_events(events: Vec<Value>, container: &mut TraceContainer) {
    for (index, event) in events.into_iter().enumerate() {
        match serde_json::from_value(event) {
            Ok(event) => container.trace_events.push(event),
            Err(err) => container
                .malformed_events
                .push(format!("event {index}: {err}")),
        }
    }
}

/// Repair a serialized trace string.
///
/// The input is trimmed. A leading `[` indicates the bare array form;
/// tracers that died mid-write leave the closing `]` off, so a trailing
/// comma is stripped and the bracket appended.
pub fn repair_trace_string(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with('[') && !trimmed.ends_with(']') {
        let without_comma = trimmed.trim_end().trim_end_matches(',');
        let mut repaired = String::with_capacity(without_comma.len() + 1);
        repaired.push_str(without_comma);
        repaired.push(']');
        return repaired;
    }
    trimmed.to_string()
}

/// Acceptance predicate over a serialized trace.
pub fn can_import_str(input: &str) -> bool {
    let trimmed = input.trim();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

/// Acceptance predicate over a pre-parsed value: a bare array whose first
/// element carries `ph`, or an object whose `traceEvents` is such an array
/// or that carries both `samples` and `stackFrames`.
pub fn can_import_value(value: &Value) -> bool {
    fn is_event_array(value: &Value) -> bool {
        match value.as_array() {
            Some(events) => events
                .first()
                .map(|e| e.get("ph").is_some())
                .unwrap_or(false),
            None => false,
        }
    }

    match value {
        Value::Array(_) => is_event_array(value),
        Value::Object(map) => {
            if let Some(events) = map.get("traceEvents") {
                if is_event_array(events) {
                    return true;
                }
            }
            map.contains_key("samples") && map.contains_key("stackFrames")
        }
        _ => false,
    }
}

fn de_opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn de_opt_truthy<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => Some(n.as_f64().unwrap_or(0.0) != 0.0),
        _ => None,
    })
}
