//! Async slice assembler: nestable (b/n/e) and legacy (S/T/p/F) dialects.
//!
//! Both dialects are buffered during dispatch and replayed here once the
//! whole queue can be sorted by (timestamp, input order).

use std::collections::HashMap;

use trace_format::{Phase, TraceEvent};
use trace_model::{dict_from_json, merge_async_dicts, AsyncSlice};

use crate::importer::{us_to_ms, QueuedEvent, TraceEventImporter};
use crate::slice_events::event_color;
use crate::warning::WarningKind;

struct OpenBegin {
    slice: AsyncSlice,
    children: Vec<AsyncSlice>,
    begin_tts: Option<f64>,
}

impl TraceEventImporter {
    pub(crate) fn finish_async_events(&mut self) {
        let mut queue = std::mem::take(&mut self.async_queue);
        queue.sort_by(|a, b| {
            a.event
                .ts
                .partial_cmp(&b.event.ts)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });

        // Nestable events group by (category, id); legacy events run
        // through a live state machine keyed by (name, id) so ids can be
        // reused after a finish.
        let mut nestable_keys: Vec<String> = Vec::new();
        let mut nestable: HashMap<String, Vec<QueuedEvent>> = HashMap::new();
        let mut legacy: Vec<QueuedEvent> = Vec::new();

        for queued in queue {
            let Some(id) = queued.event.scoped_id() else {
                self.warn(
                    WarningKind::AsyncSliceParseError,
                    format!(
                        "async event '{}' has no id",
                        queued.event.name.as_deref().unwrap_or("")
                    ),
                );
                continue;
            };
            match queued.event.phase() {
                Some(
                    Phase::NestableAsyncBegin
                    | Phase::NestableAsyncInstant
                    | Phase::NestableAsyncEnd,
                ) => {
                    let key = format!(
                        "{}:{id}",
                        queued.event.cat.as_deref().unwrap_or_default()
                    );
                    if !nestable.contains_key(&key) {
                        nestable_keys.push(key.clone());
                    }
                    nestable.entry(key).or_default().push(queued);
                }
                _ => legacy.push(queued),
            }
        }

        for key in nestable_keys {
            let events = nestable.remove(&key).unwrap_or_default();
            self.assemble_nestable(events);
        }
        self.assemble_legacy(legacy);
    }

    fn async_tts_enabled(&self, event: &TraceEvent) -> bool {
        self.config.use_async_tts || event.use_async_tts.unwrap_or(false)
    }

    fn new_async_slice(&mut self, event: &TraceEvent, id: &str, start: f64) -> AsyncSlice {
        let title = event.name.clone().unwrap_or_default();
        let color_id = event_color(event, &title);
        let thread = Self::event_thread_key(event);
        let mut slice = AsyncSlice::new(
            event.cat.clone().unwrap_or_default(),
            title,
            color_id,
            start,
            id.to_string(),
            thread,
        );
        slice.args = dict_from_json(event.args.as_ref());
        slice.start_stack_frame = self.stack_frame_for_event(event, false);
        slice
    }

    fn push_top_level(&mut self, mut slice: AsyncSlice) {
        slice.is_top_level = true;
        let key = slice.start_thread;
        self.model
            .thread_mut(key.pid, key.tid)
            .async_slice_group
            .push(slice);
    }

    /// One (category, id) group of nestable events, in sorted order.
    ///
    /// Ends match the nearest enclosing begin of the same name; parent
    /// links come from the begin that was open when the slice's start
    /// event was processed.
    fn assemble_nestable(&mut self, events: Vec<QueuedEvent>) {
        let Some(first) = events.first() else {
            return;
        };
        let first_ts = us_to_ms(first.event.ts);
        let last_ts = us_to_ms(events.last().map(|q| q.event.ts).unwrap_or(first.event.ts));
        let id = first
            .event
            .scoped_id()
            .unwrap_or_default();

        let mut stack: Vec<OpenBegin> = Vec::new();

        for queued in &events {
            let event = &queued.event;
            let ts = us_to_ms(event.ts);
            match event.phase() {
                Some(Phase::NestableAsyncBegin) => {
                    let mut slice = self.new_async_slice(event, &id, ts);
                    if self.async_tts_enabled(event) {
                        slice.thread_start = event.tts.map(us_to_ms);
                    }
                    let begin_tts = event.tts;
                    stack.push(OpenBegin {
                        slice,
                        children: Vec::new(),
                        begin_tts,
                    });
                }
                Some(Phase::NestableAsyncInstant) => {
                    let slice = self.new_async_slice(event, &id, ts);
                    match stack.last_mut() {
                        Some(top) => top.children.push(slice),
                        None => self.push_top_level(slice),
                    }
                }
                Some(Phase::NestableAsyncEnd) => {
                    let position = stack.iter().rposition(|open| match event.name.as_deref() {
                        Some(name) => open.slice.title == name,
                        None => true,
                    });
                    match position {
                        Some(position) => {
                            let mut open = stack.remove(position);
                            open.slice.duration = ts - open.slice.start;
                            merge_async_dicts(
                                &mut open.slice.args,
                                dict_from_json(event.args.as_ref()),
                            );
                            open.slice.end_thread = Self::event_thread_key(event);
                            open.slice.end_stack_frame = self.stack_frame_for_event(event, true);
                            if self.async_tts_enabled(event) {
                                if let (Some(begin), Some(end)) = (open.begin_tts, event.tts) {
                                    open.slice.thread_duration = Some(us_to_ms(end - begin));
                                }
                            }
                            open.slice.sub_slices = open.children;
                            if position > 0 {
                                stack[position - 1].children.push(open.slice);
                            } else {
                                self.push_top_level(open.slice);
                            }
                        }
                        None => {
                            // Unmatched end: synthesize from the group's
                            // first event onward.
                            let mut slice = self.new_async_slice(event, &id, first_ts);
                            slice.duration = (ts - first_ts).max(0.0);
                            slice.error = Some(
                                "Slice has no matching BEGIN. Start was clamped to the first event of its id."
                                    .to_string(),
                            );
                            match stack.last_mut() {
                                Some(top) => top.children.push(slice),
                                None => self.push_top_level(slice),
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Unmatched begins extend to the final event of the group.
        while let Some(mut open) = stack.pop() {
            open.slice.duration = (last_ts - open.slice.start).max(0.0);
            open.slice.error = Some(
                "Slice has no matching END. Duration was extended to the last event of its id."
                    .to_string(),
            );
            open.slice.sub_slices = open.children;
            match stack.last_mut() {
                Some(below) => below.children.push(open.slice),
                None => self.push_top_level(open.slice),
            }
        }
    }

    /// Legacy S/T/p/F matcher. Ids are reusable: F closes the state and a
    /// later S on the same (name, id) starts a fresh slice.
    fn assemble_legacy(&mut self, queue: Vec<QueuedEvent>) {
        let mut open: HashMap<(String, String), Vec<QueuedEvent>> = HashMap::new();
        let mut open_keys: Vec<(String, String)> = Vec::new();

        for queued in queue {
            let name = queued.event.name.clone().unwrap_or_default();
            let id = queued.event.scoped_id().unwrap_or_default();
            let key = (name.clone(), id.clone());
            match queued.event.phase() {
                Some(Phase::AsyncStart) => {
                    if open.contains_key(&key) {
                        self.warn(
                            WarningKind::AsyncSliceParseError,
                            format!("async slice '{name}' id {id} started twice"),
                        );
                        continue;
                    }
                    open_keys.push(key.clone());
                    open.insert(key, vec![queued]);
                }
                Some(Phase::AsyncStepInto | Phase::AsyncStepPast) => match open.get_mut(&key) {
                    Some(events) => events.push(queued),
                    None => self.warn(
                        WarningKind::AsyncSliceParseError,
                        format!("async step for '{name}' id {id} without a start"),
                    ),
                },
                Some(Phase::AsyncFinish) => match open.remove(&key) {
                    Some(mut events) => {
                        open_keys.retain(|k| k != &key);
                        events.push(queued);
                        self.assemble_legacy_slice(events);
                    }
                    None => self.warn(
                        WarningKind::AsyncSliceParseError,
                        format!("async finish for '{name}' id {id} without a start"),
                    ),
                },
                _ => {}
            }
        }

        for key in open_keys {
            if open.remove(&key).is_some() {
                self.warn(
                    WarningKind::AsyncSliceParseError,
                    format!("async slice '{}' id {} has no finish", key.0, key.1),
                );
            }
        }
    }

    fn assemble_legacy_slice(&mut self, events: Vec<QueuedEvent>) {
        let start_event = &events[0].event;
        let finish_event = &events[events.len() - 1].event;
        let id = start_event.scoped_id().unwrap_or_default();
        let start = us_to_ms(start_event.ts);

        let mut slice = self.new_async_slice(start_event, &id, start);
        slice.duration = us_to_ms(finish_event.ts) - start;
        slice.end_thread = Self::event_thread_key(finish_event);
        slice.end_stack_frame = self.stack_frame_for_event(finish_event, true);
        merge_async_dicts(&mut slice.args, dict_from_json(finish_event.args.as_ref()));
        if self.async_tts_enabled(start_event) {
            slice.thread_start = start_event.tts.map(us_to_ms);
            if let (Some(begin), Some(end)) = (start_event.tts, finish_event.tts) {
                slice.thread_duration = Some(us_to_ms(end - begin));
            }
        }

        let steps = &events[1..events.len() - 1];
        if !steps.is_empty() {
            let step_phase = steps[0].event.phase();
            if steps.iter().any(|s| s.event.phase() != step_phase) {
                self.warn(
                    WarningKind::AsyncSliceParseError,
                    format!(
                        "async slice '{}' id {} mixes step phases",
                        slice.title, slice.id
                    ),
                );
            } else {
                let offset = if step_phase == Some(Phase::AsyncStepInto) {
                    0
                } else {
                    -1
                };
                for (j, step) in steps.iter().enumerate() {
                    let start_index = j as isize + offset;
                    if start_index < 0 {
                        continue;
                    }
                    let start_index = start_index as usize;
                    let end_index = start_index + 1;
                    if end_index >= events.len() {
                        continue;
                    }
                    let sub = self.legacy_sub_slice(
                        &slice,
                        &step.event,
                        &events[start_index].event,
                        &events[end_index].event,
                    );
                    slice.sub_slices.push(sub);
                }
            }
        }

        self.push_top_level(slice);
    }

    fn legacy_sub_slice(
        &mut self,
        parent: &AsyncSlice,
        step_event: &TraceEvent,
        start_event: &TraceEvent,
        end_event: &TraceEvent,
    ) -> AsyncSlice {
        let mut title = step_event
            .name
            .clone()
            .unwrap_or_else(|| parent.title.clone());
        if let Some(step) = step_event.args.as_ref().and_then(|a| a.get("step")) {
            let step = match step.as_str() {
                Some(s) => s.to_string(),
                None => step.to_string(),
            };
            title = format!("{title}:{step}");
        }

        let start = us_to_ms(start_event.ts);
        let mut sub = AsyncSlice::new(
            parent.category.clone(),
            title,
            parent.color_id,
            start,
            parent.id.clone(),
            Self::event_thread_key(start_event),
        );
        sub.duration = us_to_ms(end_event.ts) - start;
        sub.end_thread = Self::event_thread_key(end_event);
        sub.args = dict_from_json(step_event.args.as_ref());
        sub
    }
}
