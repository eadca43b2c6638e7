//! Duration matcher: B/E pairs, X complete slices, and I/i/R instants.

use trace_format::TraceEvent;
use trace_model::{
    color_id_for_general_purpose_string, dict_from_json, merge_dicts, ArgDict, InstantEvent,
    Slice, SliceHandle,
};

use crate::importer::{us_to_ms, FlowDirection, FlowQueueEntry, TraceEventImporter};
use crate::warning::WarningKind;
use crate::ImportError;

pub(crate) fn event_color(event: &TraceEvent, title: &str) -> u32 {
    match &event.cname {
        Some(cname) => color_id_for_general_purpose_string(cname),
        None => color_id_for_general_purpose_string(title),
    }
}

/// Deep-copied args plus the stripped flag.
pub(crate) fn event_args(event: &TraceEvent) -> (ArgDict, bool) {
    if event.has_stripped_args() {
        (ArgDict::new(), true)
    } else {
        (dict_from_json(event.args.as_ref()), false)
    }
}

impl TraceEventImporter {
    fn build_slice(&mut self, event: &TraceEvent) -> Slice {
        let title = event.name.clone().unwrap_or_default();
        let color_id = event_color(event, &title);
        let (args, args_stripped) = event_args(event);
        let start_stack_frame = self.stack_frame_for_event(event, false);
        let mut slice = Slice::new(
            event.cat.clone().unwrap_or_default(),
            title,
            color_id,
            us_to_ms(event.ts),
        );
        slice.args = args;
        slice.args_stripped = args_stripped;
        slice.thread_start = event.tts.map(us_to_ms);
        slice.start_stack_frame = start_stack_frame;
        slice
    }

    /// Reject B/E records that move backward within their slice group.
    fn moves_backward(&mut self, event: &TraceEvent) -> bool {
        let key = Self::event_thread_key(event);
        let ts = us_to_ms(event.ts);
        let last = self
            .model
            .thread_mut(key.pid, key.tid)
            .slice_group
            .last_seen_ts();
        if last.is_some_and(|last| ts < last) {
            self.warn(
                WarningKind::DurationParseError,
                "Timestamps are moving backward.".to_string(),
            );
            return true;
        }
        false
    }

    pub(crate) fn process_duration_begin(&mut self, event: TraceEvent) {
        if self.moves_backward(&event) {
            return;
        }
        let slice = self.build_slice(&event);
        let key = Self::event_thread_key(&event);
        self.model
            .thread_mut(key.pid, key.tid)
            .slice_group
            .begin_slice(slice);
    }

    pub(crate) fn process_duration_end(&mut self, event: TraceEvent) {
        if self.moves_backward(&event) {
            return;
        }
        let end_stack_frame = self.stack_frame_for_event(&event, true);
        let key = Self::event_thread_key(&event);
        let ts = us_to_ms(event.ts);
        let thread_ts = event.tts.map(us_to_ms);
        let (end_args, _) = event_args(&event);

        let group = &mut self.model.thread_mut(key.pid, key.tid).slice_group;
        if group.open_slice_count() == 0 {
            self.warn(
                WarningKind::DurationParseError,
                format!(
                    "end event at {} on thread {}:{} has no open slice",
                    event.ts, key.pid, key.tid
                ),
            );
            return;
        }

        let mut title_mismatch = None;
        if let (Some(top), Some(name)) = (group.top_open_slice(), event.name.as_deref()) {
            if top.title != name {
                title_mismatch = Some((top.title.clone(), name.to_string()));
            }
        }

        let index = group
            .end_slice(ts, thread_ts)
            .expect("open slice count checked above");
        let slice = group.get_mut(index).expect("slice just closed");
        slice.end_stack_frame = end_stack_frame;
        let conflicts = merge_dicts(&mut slice.args, end_args);

        if let Some((open_title, end_title)) = title_mismatch {
            self.warn(
                WarningKind::TitleMatchError,
                format!("end event name '{end_title}' does not match open slice '{open_title}'"),
            );
        }
        for key in conflicts {
            self.warn(
                WarningKind::ArgMergeError,
                format!("end event argument '{key}' overwrites a begin argument"),
            );
        }
    }

    pub(crate) fn process_complete_event(&mut self, seq: usize, event: TraceEvent) {
        // Tracing's own bookkeeping slices carry no analytical value.
        if event
            .cat
            .as_deref()
            .is_some_and(|c| c.contains("trace_event_overhead"))
        {
            return;
        }

        let end_stack_frame = self.stack_frame_for_event(&event, true);
        let mut slice = self.build_slice(&event);
        slice.end_stack_frame = end_stack_frame;
        slice.bind_id = event.bind_id.clone();
        slice.thread_duration = event.tdur.map(us_to_ms);
        let duration = us_to_ms(event.dur.unwrap_or(0.0));
        let category = slice.category.clone();
        let title = slice.title.clone();

        let key = Self::event_thread_key(&event);
        let index = self
            .model
            .thread_mut(key.pid, key.tid)
            .slice_group
            .push_complete_slice(slice, duration);

        let direction = match (event.flow_out.unwrap_or(false), event.flow_in.unwrap_or(false)) {
            (true, true) => Some(FlowDirection::Step),
            (true, false) => Some(FlowDirection::Producer),
            (false, true) => Some(FlowDirection::Consumer),
            (false, false) => None,
        };
        if let (Some(bind_id), Some(direction)) = (event.bind_id.clone(), direction) {
            self.flow_queue.push(FlowQueueEntry::V2 {
                seq,
                ts: event.ts,
                slice: SliceHandle { thread: key, index },
                direction,
                bind_id,
                category,
                title,
            });
        }
    }

    /// I/i/R records. The dispatcher has already prefiltered the scope;
    /// anything else here is a broken invariant.
    pub(crate) fn process_instant_event(&mut self, event: TraceEvent) -> Result<(), ImportError> {
        match event.s.as_deref() {
            None | Some("t") => {
                let slice = self.build_slice(&event);
                let key = Self::event_thread_key(&event);
                self.model
                    .thread_mut(key.pid, key.tid)
                    .slice_group
                    .push_complete_slice(slice, 0.0);
                Ok(())
            }
            Some("p") => {
                let instant = self.build_instant(&event);
                let pid = event.pid.unwrap_or(0);
                self.model.process_mut(pid).instant_events.push(instant);
                Ok(())
            }
            Some("g") => {
                let instant = self.build_instant(&event);
                self.model.instant_events.push(instant);
                Ok(())
            }
            Some(other) => Err(ImportError::UnknownInstantScope(other.to_string())),
        }
    }

    fn build_instant(&mut self, event: &TraceEvent) -> InstantEvent {
        let title = event.name.clone().unwrap_or_default();
        let color_id = event_color(event, &title);
        let (args, _) = event_args(event);
        InstantEvent {
            category: event.cat.clone().unwrap_or_default(),
            title,
            color_id,
            ts: us_to_ms(event.ts),
            args,
        }
    }
}
