//! The importer state machine: phase dispatch, deferred queues, and the
//! shared helpers the per-phase handlers build on.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tracing::debug;

use trace_format::{Phase, SampleRecord, StackFrameRecord, TraceContainer, TraceEvent};
use trace_model::{
    color_id_for_general_purpose_string, Annotation, ClockSyncRecord, Model, ModelMetadata,
    Sample, SliceHandle, ThreadKey, TimeDisplayUnit,
};

use crate::config::ImportConfig;
use crate::warning::{ImportWarning, WarningKind};
use crate::ImportError;

/// Microseconds on the wire, milliseconds in the model.
pub(crate) fn us_to_ms(us: f64) -> f64 {
    us / 1000.0
}

/// Finished import: the assembled model plus every warning in emission
/// order.
#[derive(Debug)]
pub struct ImportResult {
    pub model: Model,
    pub warnings: Vec<ImportWarning>,
}

/// A raw event buffered for deferred assembly, tagged with its input
/// position so deferred sorts stay deterministic.
#[derive(Debug)]
pub(crate) struct QueuedEvent {
    pub seq: usize,
    pub event: TraceEvent,
}

/// Flow role of an `X` slice carrying a `bind_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowDirection {
    Producer,
    Consumer,
    Step,
}

#[derive(Debug)]
pub(crate) enum FlowQueueEntry {
    V1(QueuedEvent),
    V2 {
        seq: usize,
        /// Microseconds; sort key shared with v1 entries.
        ts: f64,
        slice: SliceHandle,
        direction: FlowDirection,
        bind_id: String,
        category: String,
        title: String,
    },
}

impl FlowQueueEntry {
    pub(crate) fn sort_key(&self) -> (f64, usize) {
        match self {
            FlowQueueEntry::V1(q) => (q.event.ts, q.seq),
            FlowQueueEntry::V2 { ts, seq, .. } => (*ts, *seq),
        }
    }
}

/// Raw memory dump events grouped under one dump id.
#[derive(Debug, Default)]
pub(crate) struct MemoryDumpEvents {
    pub global: Option<TraceEvent>,
    pub process: Vec<TraceEvent>,
}

/// Assembles a [`Model`] from a raw trace container.
///
/// Single use: construct, [`import`](TraceEventImporter::import), done.
/// Handlers mutate the model in place and push deferred work onto the
/// async/flow/object queues, which drain in sorted order once the raw
/// event array has been fully dispatched.
pub struct TraceEventImporter {
    pub(crate) model: Model,
    pub(crate) config: ImportConfig,
    pub(crate) warnings: Vec<ImportWarning>,
    warned_kinds: BTreeSet<WarningKind>,
    pub(crate) async_queue: Vec<QueuedEvent>,
    pub(crate) flow_queue: Vec<FlowQueueEntry>,
    pub(crate) object_queue: Vec<QueuedEvent>,
    /// Dump ids in first-appearance order.
    pub(crate) memory_dump_ids: Vec<String>,
    pub(crate) memory_dump_events: HashMap<String, MemoryDumpEvents>,
}

impl TraceEventImporter {
    pub fn new(config: ImportConfig) -> TraceEventImporter {
        TraceEventImporter {
            model: Model::new(),
            config,
            warnings: Vec::new(),
            warned_kinds: BTreeSet::new(),
            async_queue: Vec::new(),
            flow_queue: Vec::new(),
            object_queue: Vec::new(),
            memory_dump_ids: Vec::new(),
            memory_dump_events: HashMap::new(),
        }
    }

    /// Run the full pipeline: dispatch every raw event, drain the
    /// deferred queues, assemble memory dumps, finalize.
    pub fn import(mut self, container: TraceContainer) -> Result<ImportResult, ImportError> {
        let TraceContainer {
            trace_events,
            system_trace_events,
            battor_log,
            samples,
            stack_frames,
            display_time_unit,
            trace_annotations,
            metadata,
            malformed_events,
        } = container;

        for message in malformed_events {
            self.warn(WarningKind::ParseError, message);
        }

        if let Some(raw) = &display_time_unit {
            let unit = TimeDisplayUnit::parse(raw)
                .ok_or_else(|| ImportError::UnknownDisplayTimeUnit(raw.clone()))?;
            self.model.set_intrinsic_time_unit(unit)?;
        }
        self.model.system_trace_events = system_trace_events;
        self.model.battor_log = battor_log;
        for entry in metadata {
            self.model.metadata.push(ModelMetadata {
                name: entry.name,
                value: entry.value,
            });
        }

        // Every run records exactly one synthetic clock sync entry.
        self.model.clock_sync_records.push(ClockSyncRecord {
            name: "ftrace_importer".to_string(),
            ts: 0.0,
            sync_id: None,
            issue_ts: None,
        });

        debug!(events = trace_events.len(), "dispatching trace events");
        for (seq, event) in trace_events.into_iter().enumerate() {
            self.dispatch(seq, event)?;
        }

        self.import_stack_frames(&stack_frames, "g", false);
        if let Some(annotations) = trace_annotations {
            self.import_annotations(annotations);
        }
        self.import_container_samples(samples);

        self.finish_async_events();
        self.finish_flow_events();
        self.finish_object_events()?;
        self.finish_memory_dump_events();

        self.finalize();

        debug!(
            processes = self.model.processes.len(),
            warnings = self.warnings.len(),
            "import complete"
        );
        Ok(ImportResult {
            model: self.model,
            warnings: self.warnings,
        })
    }

    fn dispatch(&mut self, seq: usize, event: TraceEvent) -> Result<(), ImportError> {
        let Some(phase) = event.phase() else {
            self.warn(
                WarningKind::ParseError,
                format!("unrecognized event phase '{}'", event.ph),
            );
            return Ok(());
        };

        match phase {
            Phase::DurationBegin => self.process_duration_begin(event),
            Phase::DurationEnd => self.process_duration_end(event),
            Phase::Complete => self.process_complete_event(seq, event),
            Phase::Instant | Phase::InstantLegacy | Phase::Mark => {
                // Prefilter: the handler treats anything else as a broken
                // invariant.
                match event.s.as_deref() {
                    None | Some("t") | Some("p") | Some("g") => {
                        self.process_instant_event(event)?
                    }
                    Some(other) => self.warn(
                        WarningKind::InstantParseError,
                        format!("unknown instant event scope '{other}'"),
                    ),
                }
            }
            Phase::NestableAsyncBegin
            | Phase::NestableAsyncInstant
            | Phase::NestableAsyncEnd
            | Phase::AsyncStart
            | Phase::AsyncStepInto
            | Phase::AsyncStepPast
            | Phase::AsyncFinish => self.async_queue.push(QueuedEvent { seq, event }),
            Phase::FlowStart | Phase::FlowStep | Phase::FlowFinish => self
                .flow_queue
                .push(FlowQueueEntry::V1(QueuedEvent { seq, event })),
            Phase::Counter => self.process_counter_event(event),
            Phase::Metadata => self.process_metadata_event(event),
            Phase::ObjectCreated | Phase::ObjectSnapshot | Phase::ObjectDestroyed => {
                self.object_queue.push(QueuedEvent { seq, event })
            }
            Phase::Sample => self.process_trace_sample_event(event),
            Phase::ProcessMemoryDump | Phase::GlobalMemoryDump => {
                self.queue_memory_dump_event(phase, event)
            }
            Phase::ClockSync => self.process_clock_sync_event(event),
        }
        Ok(())
    }

    /// Record a warning; the first occurrence of each kind also logs.
    pub(crate) fn warn(&mut self, kind: WarningKind, message: String) {
        if self.warned_kinds.insert(kind) {
            tracing::warn!(kind = kind.as_str(), message = %message, "import warning");
        } else {
            tracing::debug!(kind = kind.as_str(), message = %message, "import warning");
        }
        self.warnings.push(ImportWarning { kind, message });
    }

    pub(crate) fn event_thread_key(event: &TraceEvent) -> ThreadKey {
        ThreadKey {
            pid: event.pid.unwrap_or(0),
            tid: event.tid.unwrap_or(0),
        }
    }

    /// Resolve the start (or end) stack frame declared on an event. At
    /// most one of the direct frame id and the raw stack may be set.
    pub(crate) fn stack_frame_for_event(
        &mut self,
        event: &TraceEvent,
        end: bool,
    ) -> Option<String> {
        let (frame_id, stack) = if end {
            (event.esf.as_ref(), event.estack.as_ref())
        } else {
            (event.sf.as_ref(), event.stack.as_ref())
        };
        if frame_id.is_some() && stack.is_some() {
            self.warn(
                WarningKind::StackFrameAndStackError,
                format!(
                    "event '{}' specifies both a stack frame id and a raw stack",
                    event.name.as_deref().unwrap_or("")
                ),
            );
        }
        if let Some(frame_id) = frame_id {
            let qualified = format!("g{frame_id}");
            if self.model.stack_frames.contains(&qualified) {
                return Some(qualified);
            }
            return None;
        }
        stack.and_then(|s| Self::resolve_stack_to_frame(s))
    }

    /// Extension point for resolving raw program-counter stacks. Always
    /// `None` today; callers tolerate the absence.
    fn resolve_stack_to_frame(_stack: &[Value]) -> Option<String> {
        None
    }

    /// `P` events: one sampling-profiler hit on the emitting thread.
    fn process_trace_sample_event(&mut self, event: TraceEvent) {
        let leaf_frame_id = self.stack_frame_for_event(&event, false);
        let key = Self::event_thread_key(&event);
        self.model.thread_mut(key.pid, key.tid);
        let title = event.name.clone().unwrap_or_default();
        self.model.samples.push(Sample {
            thread: key,
            color_id: color_id_for_general_purpose_string(&title),
            title,
            ts: us_to_ms(event.ts),
            leaf_frame_id,
            weight: 1.0,
            cpu: None,
        });
    }

    /// `c` events: clock domain synchronization markers.
    fn process_clock_sync_event(&mut self, event: TraceEvent) {
        let sync_id = event
            .args
            .as_ref()
            .and_then(|a| a.get("sync_id"))
            .and_then(Value::as_str)
            .map(String::from);
        if sync_id.is_none() {
            self.warn(
                WarningKind::ParseError,
                "clock sync event without args.sync_id".to_string(),
            );
            return;
        }
        let issue_ts = event
            .args
            .as_ref()
            .and_then(|a| a.get("issue_ts"))
            .and_then(Value::as_f64)
            .map(us_to_ms);
        self.model.clock_sync_records.push(ClockSyncRecord {
            name: event.name.unwrap_or_else(|| "clock_sync".to_string()),
            ts: us_to_ms(event.ts),
            sync_id,
            issue_ts,
        });
    }

    /// Container-level `samples` array: OS profiler hits resolved against
    /// global-scope frames.
    fn import_container_samples(&mut self, samples: Vec<SampleRecord>) {
        for sample in samples {
            let Some(tid) = sample.tid else {
                self.warn(
                    WarningKind::SampleImportError,
                    "sample record without tid".to_string(),
                );
                continue;
            };
            let leaf_frame_id = match &sample.sf {
                Some(sf) => {
                    let qualified = format!("g{sf}");
                    if !self.model.stack_frames.contains(&qualified) {
                        self.warn(
                            WarningKind::SampleImportError,
                            format!("sample references missing stack frame {sf}"),
                        );
                        continue;
                    }
                    Some(qualified)
                }
                None => None,
            };
            // Sample records carry no pid; attribute to the first thread
            // with a matching tid.
            let found = self
                .model
                .processes
                .values()
                .flat_map(|p| p.threads.values())
                .chain(self.model.kernel.threads.values())
                .find(|t| t.key.tid == tid)
                .map(|t| t.key);
            let Some(key) = found else {
                self.warn(
                    WarningKind::SampleImportError,
                    format!("sample references unknown thread {tid}"),
                );
                continue;
            };
            let title = sample.name.clone().unwrap_or_default();
            self.model.samples.push(Sample {
                thread: key,
                color_id: color_id_for_general_purpose_string(&title),
                title,
                ts: us_to_ms(sample.ts),
                leaf_frame_id,
                weight: sample.weight.unwrap_or(1.0),
                cpu: sample.cpu,
            });
        }
    }

    /// `traceAnnotations` container key: guid-keyed annotation bags.
    fn import_annotations(&mut self, annotations: Value) {
        let Value::Object(map) = annotations else {
            self.warn(
                WarningKind::AnnotationWarning,
                "traceAnnotations is not an object".to_string(),
            );
            return;
        };
        for (guid, value) in map {
            self.model.annotations_by_guid.insert(
                guid.clone(),
                Annotation { guid, value },
            );
        }
    }

    /// Two-pass import of a raw stack frame dictionary under `prefix`.
    ///
    /// Pass one registers every frame (optionally plus a synthetic root
    /// named after the prefix); pass two links parents. A missing parent
    /// warns and falls back to the root when one exists.
    pub(crate) fn import_stack_frames(
        &mut self,
        frames: &HashMap<String, StackFrameRecord>,
        prefix: &str,
        add_root_frame: bool,
    ) {
        if frames.is_empty() && !add_root_frame {
            return;
        }

        let root_id = if add_root_frame {
            let root = trace_model::StackFrame {
                id: prefix.to_string(),
                parent: None,
                title: prefix.to_string(),
                category: None,
                color_id: color_id_for_general_purpose_string(prefix),
                source_info: None,
            };
            if self.model.stack_frames.insert(root).is_err() {
                self.warn(
                    WarningKind::ParseError,
                    format!("stack frame root '{prefix}' registered twice"),
                );
            }
            Some(prefix.to_string())
        } else {
            None
        };

        let mut ids: Vec<&String> = frames.keys().collect();
        ids.sort();

        for raw_id in &ids {
            let record = &frames[*raw_id];
            let title = record.name.clone().unwrap_or_default();
            let frame = trace_model::StackFrame {
                id: format!("{prefix}{raw_id}"),
                parent: None,
                title: title.clone(),
                category: record.category.clone(),
                color_id: color_id_for_general_purpose_string(&title),
                source_info: None,
            };
            if self.model.stack_frames.insert(frame).is_err() {
                self.warn(
                    WarningKind::ParseError,
                    format!("stack frame id '{prefix}{raw_id}' registered twice"),
                );
            }
        }

        for raw_id in &ids {
            let record = &frames[*raw_id];
            let child = format!("{prefix}{raw_id}");
            let parent = match &record.parent {
                Some(parent) => {
                    let qualified = format!("{prefix}{parent}");
                    if self.model.stack_frames.contains(&qualified) {
                        Some(qualified)
                    } else {
                        self.warn(
                            WarningKind::ParseError,
                            format!("stack frame '{child}' has missing parent '{qualified}'"),
                        );
                        root_id.clone()
                    }
                }
                None => root_id.clone(),
            };
            if let Some(parent) = parent {
                if let Err(err) = self.model.stack_frames.set_parent(&child, &parent) {
                    self.warn(WarningKind::ParseError, err.to_string());
                }
            }
        }
    }
}
