//! Metadata handler: process/thread naming, sort indices, and per-process
//! stack frame payloads.

use std::collections::HashMap;

use serde_json::Value;
use trace_format::StackFrameRecord;

use crate::importer::TraceEventImporter;
use crate::warning::WarningKind;

impl TraceEventImporter {
    pub(crate) fn process_metadata_event(&mut self, event: trace_format::TraceEvent) {
        let Some(name) = event.name.clone() else {
            self.warn(
                WarningKind::MetadataParseError,
                "metadata event without a name".to_string(),
            );
            return;
        };
        let pid = event.pid.unwrap_or(0);

        match name.as_str() {
            "process_name" => match arg_str(&event, "name") {
                Some(value) => self.model.process_mut(pid).name = Some(value),
                None => self.missing_arg(&name, "name"),
            },
            "process_labels" => match arg_str(&event, "labels") {
                Some(labels) => {
                    self.model.process_mut(pid).labels =
                        labels.split(',').map(str::to_string).collect()
                }
                None => self.missing_arg(&name, "labels"),
            },
            "process_sort_index" => match arg_f64(&event, "sort_index") {
                Some(value) => self.model.process_mut(pid).sort_index = Some(value),
                None => self.missing_arg(&name, "sort_index"),
            },
            "process_uptime_seconds" => match arg_f64(&event, "uptime") {
                Some(value) => self.model.process_mut(pid).uptime_seconds = Some(value),
                None => self.missing_arg(&name, "uptime"),
            },
            "thread_name" => match (event.tid, arg_str(&event, "name")) {
                (Some(tid), Some(value)) => {
                    self.model.thread_mut(pid, tid).name = Some(value);
                }
                _ => self.missing_arg(&name, "name"),
            },
            "thread_sort_index" => match (event.tid, arg_f64(&event, "sort_index")) {
                (Some(tid), Some(value)) => {
                    self.model.thread_mut(pid, tid).sort_index = Some(value);
                }
                _ => self.missing_arg(&name, "sort_index"),
            },
            "num_cpus" => match arg_f64(&event, "number") {
                Some(value) => {
                    let count = value as u32;
                    let existing = self.model.kernel.software_measured_cpu_count;
                    self.model.kernel.software_measured_cpu_count =
                        Some(existing.map_or(count, |e| e.max(count)));
                }
                None => self.missing_arg(&name, "number"),
            },
            "stackFrames" => {
                let frames: Option<HashMap<String, StackFrameRecord>> = event
                    .args
                    .as_ref()
                    .and_then(|a| a.get("stackFrames"))
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                match frames {
                    Some(frames) => {
                        let prefix = format!("p{pid}:");
                        self.import_stack_frames(&frames, &prefix, true);
                    }
                    None => self.missing_arg(&name, "stackFrames"),
                }
            }
            other => self.warn(
                WarningKind::MetadataParseError,
                format!("unrecognized metadata name '{other}'"),
            ),
        }
    }

    fn missing_arg(&mut self, metadata: &str, arg: &str) {
        self.warn(
            WarningKind::MetadataParseError,
            format!("metadata event '{metadata}' is missing args.{arg}"),
        );
    }
}

fn arg_str(event: &trace_format::TraceEvent, key: &str) -> Option<String> {
    event
        .args
        .as_ref()
        .and_then(|a| a.get(key))
        .and_then(Value::as_str)
        .map(String::from)
}

fn arg_f64(event: &trace_format::TraceEvent, key: &str) -> Option<f64> {
    event.args.as_ref().and_then(|a| a.get(key)).and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use trace_format::TraceEvent;

    use crate::config::ImportConfig;

    fn metadata(name: &str, args: Value) -> TraceEvent {
        let mut event = TraceEvent::builder()
            .ph("M".to_string())
            .name(name.to_string())
            .pid(7)
            .tid(8)
            .ts(0.0)
            .build();
        event.args = Some(args);
        event
    }

    #[rstest]
    fn names_and_sort_indices_apply() {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        imp.process_metadata_event(metadata("process_name", serde_json::json!({"name": "gpu"})));
        imp.process_metadata_event(metadata("thread_name", serde_json::json!({"name": "main"})));
        imp.process_metadata_event(metadata(
            "process_labels",
            serde_json::json!({"labels": "a,b"}),
        ));
        imp.process_metadata_event(metadata(
            "thread_sort_index",
            serde_json::json!({"sort_index": -5}),
        ));
        let process = &imp.model.processes[&7];
        assert_eq!(process.name.as_deref(), Some("gpu"));
        assert_eq!(process.labels, vec!["a", "b"]);
        assert_eq!(process.threads[&8].name.as_deref(), Some("main"));
        assert_eq!(process.threads[&8].sort_index, Some(-5.0));
        assert!(imp.warnings.is_empty());
    }

    #[rstest]
    fn unknown_metadata_warns() {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        imp.process_metadata_event(metadata("mystery", serde_json::json!({})));
        assert_eq!(imp.warnings[0].kind, WarningKind::MetadataParseError);
    }

    #[rstest]
    fn missing_required_arg_warns() {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        imp.process_metadata_event(metadata("process_name", serde_json::json!({})));
        assert_eq!(imp.warnings[0].kind, WarningKind::MetadataParseError);
    }

    #[rstest]
    fn num_cpus_lands_on_kernel() {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        imp.process_metadata_event(metadata("num_cpus", serde_json::json!({"number": 8})));
        assert_eq!(imp.model.kernel.software_measured_cpu_count, Some(8));
    }

    #[rstest]
    fn process_stack_frames_import_under_pid_prefix() {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        imp.process_metadata_event(metadata(
            "stackFrames",
            serde_json::json!({"stackFrames": {
                "1": {"name": "main"},
                "2": {"name": "leaf", "parent": "1"}
            }}),
        ));
        assert!(imp.model.stack_frames.contains("p7:1"));
        assert!(imp.model.stack_frames.contains("p7:2"));
        // Synthetic root carries the prefix as its id.
        assert!(imp.model.stack_frames.contains("p7:"));
        assert_eq!(
            imp.model.stack_frames.get("p7:2").unwrap().parent.as_deref(),
            Some("p7:1")
        );
        assert_eq!(
            imp.model.stack_frames.get("p7:1").unwrap().parent.as_deref(),
            Some("p7:")
        );
    }
}
