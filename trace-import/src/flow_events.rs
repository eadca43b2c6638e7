//! Flow event assembler: v1 (s/t/f records) and v2 (bind_id on complete
//! slices) stitching into slice-to-slice arcs.

use std::collections::BTreeMap;

use trace_format::Phase;
use trace_model::{
    color_id_for_general_purpose_string, ArgDict, FlowEvent, SliceHandle, ThreadKey,
};

use crate::importer::{us_to_ms, FlowDirection, FlowQueueEntry, QueuedEvent, TraceEventImporter};
use crate::warning::WarningKind;

/// The producer side of an open (or remembered) flow.
#[derive(Debug, Clone)]
struct FlowPoint {
    slice: SliceHandle,
    /// Milliseconds.
    ts: f64,
    category: String,
    title: String,
}

impl TraceEventImporter {
    pub(crate) fn finish_flow_events(&mut self) {
        let mut queue = std::mem::take(&mut self.flow_queue);
        queue.sort_by(|a, b| {
            let (ats, aseq) = a.sort_key();
            let (bts, bseq) = b.sort_key();
            ats.partial_cmp(&bts)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(aseq.cmp(&bseq))
        });

        let mut v1_open: BTreeMap<String, FlowPoint> = BTreeMap::new();
        let mut v2_open: BTreeMap<String, FlowPoint> = BTreeMap::new();
        let mut v2_remembered: BTreeMap<String, FlowPoint> = BTreeMap::new();

        for entry in queue {
            match entry {
                FlowQueueEntry::V1(queued) => self.process_flow_v1(queued, &mut v1_open),
                FlowQueueEntry::V2 {
                    ts,
                    slice,
                    direction,
                    bind_id,
                    category,
                    title,
                    ..
                } => self.process_flow_v2(
                    us_to_ms(ts),
                    slice,
                    direction,
                    bind_id,
                    category,
                    title,
                    &mut v2_open,
                    &mut v2_remembered,
                ),
            }
        }

        for (id, _) in v1_open {
            self.warn(
                WarningKind::FlowSliceOrderingError,
                format!("flow id {id} was never finished"),
            );
        }
        for (id, _) in v2_open {
            self.warn(
                WarningKind::FlowSliceOrderingError,
                format!("flow producer {id} was never consumed"),
            );
        }
    }

    fn process_flow_v1(&mut self, queued: QueuedEvent, open: &mut BTreeMap<String, FlowPoint>) {
        let event = queued.event;
        let Some(id) = event.scoped_id() else {
            self.warn(
                WarningKind::FlowSliceParseError,
                format!(
                    "flow event '{}' has no id",
                    event.name.as_deref().unwrap_or("")
                ),
            );
            return;
        };
        let key = Self::event_thread_key(&event);
        let ts = us_to_ms(event.ts);
        let category = event.cat.clone().unwrap_or_default();
        let title = event.name.clone().unwrap_or_default();

        match event.phase() {
            Some(Phase::FlowStart) => {
                let Some(slice) = self.find_slice_handle_at(key, ts) else {
                    self.warn(
                        WarningKind::FlowSliceStartError,
                        format!("flow start {id} has no enclosing slice at {}", event.ts),
                    );
                    return;
                };
                if open.contains_key(&id) {
                    self.warn(
                        WarningKind::FlowSliceOrderingError,
                        format!("flow id {id} started while already open"),
                    );
                }
                open.insert(
                    id,
                    FlowPoint {
                        slice,
                        ts,
                        category,
                        title,
                    },
                );
            }
            Some(Phase::FlowStep) => {
                let Some(previous) = open.get(&id).cloned() else {
                    self.warn(
                        WarningKind::FlowSliceOrderingError,
                        format!("flow step {id} without an open flow"),
                    );
                    return;
                };
                let Some(slice) = self.find_slice_handle_at(key, ts) else {
                    self.warn(
                        WarningKind::FlowSliceEndError,
                        format!("flow step {id} has no enclosing slice at {}", event.ts),
                    );
                    return;
                };
                self.add_flow_arc(&id, &previous, ts, slice);
                // A step terminates one arc and opens the next.
                open.insert(
                    id,
                    FlowPoint {
                        slice,
                        ts,
                        category,
                        title,
                    },
                );
            }
            Some(Phase::FlowFinish) => {
                let bind_to_parent = match event.bp.as_deref() {
                    None => false,
                    Some("e") => true,
                    Some(other) => {
                        self.warn(
                            WarningKind::FlowSliceBindPointError,
                            format!("flow finish {id} has invalid bind point '{other}'"),
                        );
                        return;
                    }
                } || category.contains("input")
                    || category.contains("ipc.flow");

                if !open.contains_key(&id) {
                    self.warn(
                        WarningKind::FlowSliceOrderingError,
                        format!("flow finish {id} without an open flow"),
                    );
                    return;
                }
                let slice = if bind_to_parent {
                    self.find_slice_handle_at(key, ts)
                } else {
                    self.find_next_slice_handle_after(key, ts)
                };
                let Some(slice) = slice else {
                    self.warn(
                        WarningKind::FlowSliceEndError,
                        format!("flow finish {id} has no slice to bind at {}", event.ts),
                    );
                    return;
                };
                let previous = open.remove(&id).expect("checked above");
                self.add_flow_arc(&id, &previous, ts, slice);
            }
            _ => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_flow_v2(
        &mut self,
        ts: f64,
        slice: SliceHandle,
        direction: FlowDirection,
        bind_id: String,
        category: String,
        title: String,
        open: &mut BTreeMap<String, FlowPoint>,
        remembered: &mut BTreeMap<String, FlowPoint>,
    ) {
        let point = FlowPoint {
            slice,
            ts,
            category,
            title,
        };
        match direction {
            FlowDirection::Producer => {
                if open.contains_key(&bind_id) {
                    self.warn(
                        WarningKind::FlowSliceOrderingError,
                        format!("flow id {bind_id} reopened while still open"),
                    );
                }
                remembered.remove(&bind_id);
                open.insert(bind_id, point);
            }
            FlowDirection::Consumer => {
                if let Some(producer) = open.remove(&bind_id) {
                    self.add_flow_arc(&bind_id, &producer, ts, slice);
                    // Later consumers of the same id get fresh arcs from
                    // this producer.
                    remembered.insert(bind_id, producer);
                } else if let Some(producer) = remembered.get(&bind_id).cloned() {
                    self.add_flow_arc(&bind_id, &producer, ts, slice);
                } else {
                    self.warn(
                        WarningKind::FlowSliceOrderingError,
                        format!("flow consumer {bind_id} without a producer"),
                    );
                }
            }
            FlowDirection::Step => {
                if let Some(producer) = open.remove(&bind_id) {
                    self.add_flow_arc(&bind_id, &producer, ts, slice);
                } else if let Some(producer) = remembered.get(&bind_id).cloned() {
                    self.add_flow_arc(&bind_id, &producer, ts, slice);
                } else {
                    self.warn(
                        WarningKind::FlowSliceOrderingError,
                        format!("flow step {bind_id} without a producer"),
                    );
                }
                remembered.remove(&bind_id);
                open.insert(bind_id, point);
            }
        }
    }

    fn add_flow_arc(&mut self, id: &str, producer: &FlowPoint, end_ts: f64, end: SliceHandle) {
        let index = self.model.flow_events.len();
        self.model.flow_events.push(FlowEvent {
            id: id.to_string(),
            category: producer.category.clone(),
            title: producer.title.clone(),
            color_id: color_id_for_general_purpose_string(&producer.title),
            start: producer.ts,
            end: end_ts,
            args: ArgDict::new(),
            start_slice: Some(producer.slice),
            end_slice: Some(end),
        });
        if let Some(slice) = self.slice_mut(producer.slice) {
            slice.out_flow_events.push(index);
        }
        if let Some(slice) = self.slice_mut(end) {
            slice.in_flow_events.push(index);
        }
    }

    fn slice_mut(&mut self, handle: SliceHandle) -> Option<&mut trace_model::Slice> {
        let thread = if handle.thread.pid == trace_model::Kernel::PSEUDO_PID {
            self.model.kernel.threads.get_mut(&handle.thread.tid)
        } else {
            self.model
                .processes
                .get_mut(&handle.thread.pid)?
                .threads
                .get_mut(&handle.thread.tid)
        };
        thread?.slice_group.get_mut(handle.index)
    }

    fn find_slice_handle_at(&self, key: ThreadKey, ts: f64) -> Option<SliceHandle> {
        let thread = self.model.thread(key)?;
        thread
            .slice_group
            .find_slice_at_ts(ts)
            .map(|index| SliceHandle { thread: key, index })
    }

    fn find_next_slice_handle_after(&self, key: ThreadKey, ts: f64) -> Option<SliceHandle> {
        let thread = self.model.thread(key)?;
        thread
            .slice_group
            .find_next_slice_after(ts)
            .map(|index| SliceHandle { thread: key, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use trace_format::TraceEvent;
    use trace_model::Slice;

    use crate::config::ImportConfig;

    fn importer_with_slices(slices: &[(&str, f64, f64)]) -> TraceEventImporter {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        let group = &mut imp.model.thread_mut(1, 1).slice_group;
        for (title, start, duration) in slices {
            group.push_complete_slice(
                Slice::new("cat".into(), (*title).into(), 0, *start),
                *duration,
            );
        }
        imp
    }

    fn flow_event(ph: &str, id: &str, ts: f64) -> FlowQueueEntry {
        let mut event = TraceEvent::builder()
            .ph(ph.to_string())
            .name("flow".to_string())
            .pid(1)
            .tid(1)
            .ts(ts)
            .build();
        event.id = Some(id.to_string());
        FlowQueueEntry::V1(QueuedEvent { seq: 0, event })
    }

    #[rstest]
    fn v1_start_finish_links_two_slices() {
        // Slices at 0..1ms and 2..3ms; s@500µs inside the first, f@1500µs
        // binds to the next slice after.
        let mut imp = importer_with_slices(&[("producer", 0.0, 1.0), ("consumer", 2.0, 1.0)]);
        imp.flow_queue.push(flow_event("s", "7", 500.0));
        imp.flow_queue.push(flow_event("f", "7", 1500.0));
        imp.finish_flow_events();

        assert_eq!(imp.model.flow_events.len(), 1);
        let flow = &imp.model.flow_events[0];
        assert_eq!(flow.start_slice.unwrap().index, 0);
        assert_eq!(flow.end_slice.unwrap().index, 1);
        let group = &imp.model.processes[&1].threads[&1].slice_group;
        assert_eq!(group.slices()[0].out_flow_events, vec![0]);
        assert_eq!(group.slices()[1].in_flow_events, vec![0]);
        assert!(imp.warnings.is_empty());
    }

    #[rstest]
    fn v1_finish_with_bp_e_binds_to_enclosing_slice() {
        let mut imp = importer_with_slices(&[("producer", 0.0, 1.0), ("enclosing", 2.0, 2.0)]);
        imp.flow_queue.push(flow_event("s", "7", 500.0));
        let mut finish = TraceEvent::builder()
            .ph("f".to_string())
            .name("flow".to_string())
            .pid(1)
            .tid(1)
            .ts(2500.0)
            .build();
        finish.id = Some("7".to_string());
        finish.bp = Some("e".to_string());
        imp.flow_queue.push(FlowQueueEntry::V1(QueuedEvent { seq: 1, event: finish }));
        imp.finish_flow_events();
        assert_eq!(imp.model.flow_events.len(), 1);
        assert_eq!(imp.model.flow_events[0].end_slice.unwrap().index, 1);
    }

    #[rstest]
    fn v1_invalid_bp_warns_and_drops() {
        let mut imp = importer_with_slices(&[("a", 0.0, 1.0)]);
        imp.flow_queue.push(flow_event("s", "7", 500.0));
        let mut finish = TraceEvent::builder()
            .ph("f".to_string())
            .name("flow".to_string())
            .pid(1)
            .tid(1)
            .ts(800.0)
            .build();
        finish.id = Some("7".to_string());
        finish.bp = Some("x".to_string());
        imp.flow_queue.push(FlowQueueEntry::V1(QueuedEvent { seq: 1, event: finish }));
        imp.finish_flow_events();
        assert!(imp.model.flow_events.is_empty());
        assert!(imp
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::FlowSliceBindPointError));
    }

    #[rstest]
    fn v1_start_outside_any_slice_warns() {
        let mut imp = importer_with_slices(&[("a", 0.0, 1.0)]);
        imp.flow_queue.push(flow_event("s", "7", 5000.0));
        imp.finish_flow_events();
        assert_eq!(imp.warnings[0].kind, WarningKind::FlowSliceStartError);
    }

    #[rstest]
    fn v1_step_chains_arcs() {
        let mut imp =
            importer_with_slices(&[("a", 0.0, 1.0), ("b", 2.0, 1.0), ("c", 4.0, 1.0)]);
        imp.flow_queue.push(flow_event("s", "7", 500.0));
        imp.flow_queue.push(flow_event("t", "7", 2500.0));
        let mut finish = TraceEvent::builder()
            .ph("f".to_string())
            .name("flow".to_string())
            .pid(1)
            .tid(1)
            .ts(3500.0)
            .build();
        finish.id = Some("7".to_string());
        imp.flow_queue
            .push(FlowQueueEntry::V1(QueuedEvent { seq: 2, event: finish }));
        imp.finish_flow_events();
        assert_eq!(imp.model.flow_events.len(), 2);
        assert_eq!(imp.model.flow_events[0].start_slice.unwrap().index, 0);
        assert_eq!(imp.model.flow_events[0].end_slice.unwrap().index, 1);
        assert_eq!(imp.model.flow_events[1].start_slice.unwrap().index, 1);
        assert_eq!(imp.model.flow_events[1].end_slice.unwrap().index, 2);
    }

    fn v2_entry(
        seq: usize,
        ts: f64,
        index: usize,
        direction: FlowDirection,
        bind_id: &str,
    ) -> FlowQueueEntry {
        FlowQueueEntry::V2 {
            seq,
            ts,
            slice: SliceHandle {
                thread: ThreadKey { pid: 1, tid: 1 },
                index,
            },
            direction,
            bind_id: bind_id.to_string(),
            category: "cat".to_string(),
            title: "x".to_string(),
        }
    }

    #[rstest]
    fn v2_producer_consumer_links() {
        let mut imp = importer_with_slices(&[("p", 0.0, 0.1), ("c", 0.2, 0.05)]);
        imp.flow_queue
            .push(v2_entry(0, 0.0, 0, FlowDirection::Producer, "7"));
        imp.flow_queue
            .push(v2_entry(1, 200.0, 1, FlowDirection::Consumer, "7"));
        imp.finish_flow_events();
        assert_eq!(imp.model.flow_events.len(), 1);
        let group = &imp.model.processes[&1].threads[&1].slice_group;
        assert_eq!(group.slices()[0].out_flow_events, vec![0]);
        assert_eq!(group.slices()[1].in_flow_events, vec![0]);
        assert!(imp.warnings.is_empty());
    }

    #[rstest]
    fn v2_second_consumer_gets_fresh_arc_from_producer() {
        let mut imp =
            importer_with_slices(&[("p", 0.0, 0.1), ("c1", 0.2, 0.05), ("c2", 0.4, 0.05)]);
        imp.flow_queue
            .push(v2_entry(0, 0.0, 0, FlowDirection::Producer, "7"));
        imp.flow_queue
            .push(v2_entry(1, 200.0, 1, FlowDirection::Consumer, "7"));
        imp.flow_queue
            .push(v2_entry(2, 400.0, 2, FlowDirection::Consumer, "7"));
        imp.finish_flow_events();
        assert_eq!(imp.model.flow_events.len(), 2);
        assert_eq!(imp.model.flow_events[1].start_slice.unwrap().index, 0);
        assert_eq!(imp.model.flow_events[1].end_slice.unwrap().index, 2);
    }

    #[rstest]
    fn v2_reopening_open_flow_warns() {
        let mut imp = importer_with_slices(&[("p1", 0.0, 0.1), ("p2", 0.2, 0.1)]);
        imp.flow_queue
            .push(v2_entry(0, 0.0, 0, FlowDirection::Producer, "7"));
        imp.flow_queue
            .push(v2_entry(1, 200.0, 1, FlowDirection::Producer, "7"));
        imp.finish_flow_events();
        assert!(imp
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::FlowSliceOrderingError));
    }

    #[rstest]
    fn v2_step_consumes_and_produces() {
        let mut imp =
            importer_with_slices(&[("p", 0.0, 0.1), ("s", 0.2, 0.05), ("c", 0.4, 0.05)]);
        imp.flow_queue
            .push(v2_entry(0, 0.0, 0, FlowDirection::Producer, "7"));
        imp.flow_queue
            .push(v2_entry(1, 200.0, 1, FlowDirection::Step, "7"));
        imp.flow_queue
            .push(v2_entry(2, 400.0, 2, FlowDirection::Consumer, "7"));
        imp.finish_flow_events();
        assert_eq!(imp.model.flow_events.len(), 2);
        assert_eq!(imp.model.flow_events[1].start_slice.unwrap().index, 1);
        assert_eq!(imp.model.flow_events[1].end_slice.unwrap().index, 2);
        assert!(imp.warnings.is_empty());
    }
}
