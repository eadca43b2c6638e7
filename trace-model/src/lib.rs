//! # Trace Model
//!
//! The structured, queryable in-memory model assembled from a Chrome-style
//! trace event stream: processes and threads, nested slices, asynchronous
//! operations, flow arcs, counters, samples, object lifecycles with
//! snapshots, and memory dumps.
//!
//! The model is a plain ownership tree ([`Model`] owns processes, a
//! process owns threads, a thread owns its slice groups) with
//! cross-references expressed as ids and indices rather than pointers
//! (slice handles, snapshot arena ids, allocator dump GUIDs). All
//! container maps are ordered so that two imports of the same event array
//! produce identical iteration order everywhere.
//!
//! Timestamps are milliseconds throughout; the importer converts from the
//! wire format's microseconds at the boundary.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

pub mod args;
pub mod async_slice;
pub mod bounds;
pub mod counter;
pub mod events;
pub mod flow;
pub mod memory_dump;
pub mod object;
pub mod process;
pub mod slice;
pub mod stack_frame;
pub mod thread;

pub use args::{dict_from_json, merge_async_dicts, merge_dicts, ArgDict, ArgValue};
pub use async_slice::{AsyncSlice, AsyncSliceGroup};
pub use bounds::Bounds;
pub use counter::{Counter, CounterSample, CounterSeries};
pub use events::{
    Alert, Annotation, ClockSyncRecord, InstantEvent, InteractionRecord, ModelMetadata, Sample,
};
pub use flow::{FlowEvent, FlowIntervalTree, SliceHandle};
pub use memory_dump::{
    AllocatorAttribute, AllocatorDumpSet, GlobalMemoryDump, HeapDump, HeapEntry,
    MemoryAllocatorDump, MemoryDumpEdge, MemoryDumpEdgeType, MemoryDumpLevel, ProcessMemoryDump,
    VmRegion, VmRegionByteStats,
};
pub use object::{InstanceId, ObjectCollection, ObjectInstance, ObjectSnapshot, SnapshotId};
pub use process::{Device, Kernel, Process};
pub use slice::{Slice, SliceGroup, SliceIndex};
pub use stack_frame::{StackFrame, StackFrameRegistry};
pub use thread::{Thread, ThreadKey};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("object id {0} already has a live instance")]
    ObjectIdInUse(String),

    #[error("object id {0} creation precedes an earlier live range")]
    ObjectCreationOverlap(String),

    #[error("object id {0} has no live instance")]
    NoLiveObject(String),

    #[error("snapshot of object id {0} falls outside the instance lifetime")]
    SnapshotOutsideLifetime(String),

    #[error("stack frame id {0} registered twice")]
    DuplicateStackFrame(String),

    #[error("stack frame id {0} does not exist")]
    MissingStackFrame(String),

    #[error("stack frame id {0} parent chain forms a cycle")]
    StackFrameCycle(String),

    #[error("intrinsic time unit already set to {0:?}")]
    TimeUnitAlreadySet(TimeDisplayUnit),
}

/// Display unit for model timestamps. The internal representation stays
/// milliseconds either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeDisplayUnit {
    Milliseconds,
    Nanoseconds,
}

impl TimeDisplayUnit {
    pub fn parse(raw: &str) -> Option<TimeDisplayUnit> {
        match raw {
            "ms" => Some(TimeDisplayUnit::Milliseconds),
            "ns" => Some(TimeDisplayUnit::Nanoseconds),
            _ => None,
        }
    }
}

/// Reverse indices built by the final import phase.
#[derive(Debug, Default)]
pub struct ModelIndices {
    /// Flow event positions grouped by flow id.
    pub flow_events_by_id: BTreeMap<String, Vec<usize>>,
}

/// Number of color ids the general-purpose hash maps onto. The palette
/// itself belongs to the presentation layer.
pub const GENERAL_PURPOSE_COLOR_IDS: u32 = 23;

/// Stable color id for a display string. Pure function; the UI maps ids
/// to actual colors.
pub fn color_id_for_general_purpose_string(string: &str) -> u32 {
    // FNV-1a, folded onto the palette size.
    let mut hash: u32 = 0x811c9dc5;
    for byte in string.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash % GENERAL_PURPOSE_COLOR_IDS
}

/// Root aggregate of the assembled trace.
#[derive(Debug, Default)]
pub struct Model {
    pub device: Device,
    pub kernel: Kernel,
    pub processes: BTreeMap<i64, Process>,
    /// Global-scope instant events.
    pub instant_events: Vec<InstantEvent>,
    pub flow_events: Vec<FlowEvent>,
    pub alerts: Vec<Alert>,
    pub interaction_records: Vec<InteractionRecord>,
    pub samples: Vec<Sample>,
    pub global_memory_dumps: Vec<GlobalMemoryDump>,
    pub clock_sync_records: Vec<ClockSyncRecord>,
    pub annotations_by_guid: BTreeMap<String, Annotation>,
    pub stack_frames: StackFrameRegistry,
    pub flow_interval_tree: FlowIntervalTree,
    pub metadata: Vec<ModelMetadata>,
    pub system_trace_events: Option<String>,
    pub battor_log: Option<String>,
    intrinsic_time_unit: Option<TimeDisplayUnit>,
    pub bounds: Bounds,
    pub categories: BTreeSet<String>,
    pub indices: ModelIndices,
}

impl Model {
    pub fn new() -> Model {
        Model::default()
    }

    pub fn process_mut(&mut self, pid: i64) -> &mut Process {
        self.processes.entry(pid).or_insert_with(|| Process::new(pid))
    }

    pub fn thread_mut(&mut self, pid: i64, tid: i64) -> &mut Thread {
        self.process_mut(pid).thread_mut(tid)
    }

    pub fn thread(&self, key: ThreadKey) -> Option<&Thread> {
        if key.pid == Kernel::PSEUDO_PID {
            return self.kernel.threads.get(&key.tid);
        }
        self.processes.get(&key.pid)?.threads.get(&key.tid)
    }

    /// Every thread in the model: process threads first, then kernel
    /// threads. The two sets are disjoint by construction.
    pub fn all_threads(&self) -> Vec<&Thread> {
        let mut threads: Vec<&Thread> = self
            .processes
            .values()
            .flat_map(|p| p.threads.values())
            .collect();
        threads.extend(self.kernel.threads.values());
        threads
    }

    pub fn find_all_threads_named(&self, name: &str) -> Vec<&Thread> {
        let mut threads: Vec<&Thread> = self
            .processes
            .values()
            .flat_map(|p| p.find_all_threads_named(name))
            .collect();
        threads.extend(self.kernel.find_all_threads_named(name));
        threads
    }

    pub fn intrinsic_time_unit(&self) -> Option<TimeDisplayUnit> {
        self.intrinsic_time_unit
    }

    /// Set the display unit. May happen at most once; a second set with
    /// the same value is a no-op.
    pub fn set_intrinsic_time_unit(&mut self, unit: TimeDisplayUnit) -> Result<(), ModelError> {
        match self.intrinsic_time_unit {
            None => {
                self.intrinsic_time_unit = Some(unit);
                Ok(())
            }
            Some(existing) if existing == unit => Ok(()),
            Some(existing) => Err(ModelError::TimeUnitAlreadySet(existing)),
        }
    }

    pub fn sort_samples(&mut self) {
        self.samples
            .sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap_or(std::cmp::Ordering::Equal));
    }

    /// Recompute world bounds and the category set from every container.
    /// Clock sync records are synthetic and do not contribute.
    pub fn update_bounds(&mut self) {
        let mut bounds = Bounds::new();
        for process in self.processes.values() {
            process.add_bounds(&mut bounds);
        }
        self.kernel.add_bounds(&mut bounds);
        for instant in &self.instant_events {
            bounds.add_value(instant.ts);
        }
        for flow in &self.flow_events {
            flow.add_bounds(&mut bounds);
        }
        for sample in &self.samples {
            bounds.add_value(sample.ts);
        }
        for dump in &self.global_memory_dumps {
            dump.add_bounds(&mut bounds);
        }
        for record in &self.interaction_records {
            bounds.add_range(record.start, record.end());
        }
        for alert in &self.alerts {
            bounds.add_value(alert.ts);
        }
        self.bounds = bounds;
        self.rebuild_categories();
    }

    fn rebuild_categories(&mut self) {
        let mut categories = BTreeSet::new();
        let mut add = |cat: &str| {
            if !cat.is_empty() {
                categories.insert(cat.to_string());
            }
        };
        for thread in self.all_threads() {
            for slice in thread.slice_group.slices() {
                add(&slice.category);
            }
            for async_slice in &thread.async_slice_group.slices {
                add(&async_slice.category);
            }
        }
        for process in self.processes.values() {
            for counter in process.counters.values() {
                add(&counter.category);
            }
            for instant in &process.instant_events {
                add(&instant.category);
            }
        }
        for instant in &self.instant_events {
            add(&instant.category);
        }
        for flow in &self.flow_events {
            add(&flow.category);
        }
        self.categories = categories;
    }

    /// Close every still-open synchronous slice at `end_ts`.
    pub fn auto_close_open_slices(&mut self, end_ts: f64) {
        for process in self.processes.values_mut() {
            for thread in process.threads.values_mut() {
                thread.slice_group.auto_close_open_slices(end_ts);
            }
        }
        for thread in self.kernel.threads.values_mut() {
            thread.slice_group.auto_close_open_slices(end_ts);
        }
    }

    /// Translate every timed entity by `-bounds.min`, leaving the world
    /// starting at zero. Applying it twice is equivalent to applying it
    /// once: after the first shift `bounds.min` is zero.
    pub fn shift_world_to_zero(&mut self) {
        let Some(min) = self.bounds.min else {
            return;
        };
        if min == 0.0 {
            return;
        }
        let delta = -min;
        for process in self.processes.values_mut() {
            process.shift_timestamps(delta);
        }
        self.kernel.shift_timestamps(delta);
        for instant in &mut self.instant_events {
            instant.ts += delta;
        }
        for flow in &mut self.flow_events {
            flow.shift_timestamps(delta);
        }
        for sample in &mut self.samples {
            sample.ts += delta;
        }
        for dump in &mut self.global_memory_dumps {
            dump.shift_timestamps(delta);
        }
        for record in &mut self.clock_sync_records {
            record.ts += delta;
            if let Some(issue) = record.issue_ts.as_mut() {
                *issue += delta;
            }
        }
        for record in &mut self.interaction_records {
            record.start += delta;
        }
        for alert in &mut self.alerts {
            alert.ts += delta;
        }
        self.update_bounds();
    }

    /// Rebuild slice nesting rows on every thread.
    pub fn create_sub_slices(&mut self) {
        for process in self.processes.values_mut() {
            for thread in process.threads.values_mut() {
                thread.slice_group.create_sub_slices();
            }
        }
        for thread in self.kernel.threads.values_mut() {
            thread.slice_group.create_sub_slices();
        }
    }

    /// Drop threads with no events, then processes left with nothing.
    pub fn prune_empty_containers(&mut self) {
        let mut sampled: BTreeSet<ThreadKey> = BTreeSet::new();
        for sample in &self.samples {
            sampled.insert(sample.thread);
        }
        for process in self.processes.values_mut() {
            process
                .threads
                .retain(|_, t| !t.is_empty() || sampled.contains(&t.key));
        }
        self.kernel
            .threads
            .retain(|_, t| !t.is_empty() || sampled.contains(&t.key));
        self.processes.retain(|_, p| !p.is_empty());
    }

    /// Index every flow event into the interval tree keyed by its
    /// (start, end) range.
    pub fn build_flow_event_interval_tree(&mut self) {
        self.flow_interval_tree = FlowIntervalTree::build(
            self.flow_events
                .iter()
                .enumerate()
                .map(|(i, f)| (f.start, f.end, i)),
        );
    }

    /// Stamp a deletion timestamp on every still-live object instance.
    pub fn cleanup_undeleted_objects(&mut self) {
        let max = self.bounds.max.unwrap_or(0.0);
        for process in self.processes.values_mut() {
            process.objects.cleanup_undeleted(max);
        }
    }

    pub fn sort_memory_dumps(&mut self) {
        self.global_memory_dumps.sort_by(|a, b| {
            a.start
                .partial_cmp(&b.start)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        // Process dump references index into the sorted vector; rebuild.
        for process in self.processes.values_mut() {
            process.memory_dump_refs.clear();
        }
        for (global_index, dump) in self.global_memory_dumps.iter().enumerate() {
            for (pmd_index, pmd) in dump.process_dumps.iter().enumerate() {
                if let Some(process) = self.processes.get_mut(&pmd.pid) {
                    process.memory_dump_refs.push((global_index, pmd_index));
                }
            }
        }
    }

    pub fn sort_interaction_records(&mut self) {
        self.interaction_records.sort_by(|a, b| {
            a.start
                .partial_cmp(&b.start)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn sort_alerts(&mut self) {
        self.alerts
            .sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap_or(std::cmp::Ordering::Equal));
    }

    /// Build the reverse indices consumed by downstream analysis.
    pub fn build_event_indices(&mut self) {
        let mut by_id: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, flow) in self.flow_events.iter().enumerate() {
            by_id.entry(flow.id.clone()).or_default().push(index);
        }
        self.indices = ModelIndices {
            flow_events_by_id: by_id,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn closed_slice(title: &str, start: f64, duration: f64) -> Slice {
        let mut s = Slice::new("cat".into(), title.into(), 0, start);
        s.duration = Some(duration);
        s
    }

    #[rstest]
    fn containers_are_created_lazily() {
        let mut model = Model::new();
        assert!(model.processes.is_empty());
        model.thread_mut(1, 10);
        model.thread_mut(1, 11);
        assert_eq!(model.processes.len(), 1);
        assert_eq!(model.processes[&1].threads.len(), 2);
    }

    #[rstest]
    fn all_threads_unions_processes_and_kernel() {
        let mut model = Model::new();
        model.thread_mut(1, 10).name = Some("io".into());
        model.kernel.thread_mut(99).name = Some("io".into());
        assert_eq!(model.all_threads().len(), 2);
        assert_eq!(model.find_all_threads_named("io").len(), 2);
        assert!(model.find_all_threads_named("gpu").is_empty());
    }

    #[rstest]
    fn intrinsic_time_unit_sets_at_most_once() {
        let mut model = Model::new();
        model
            .set_intrinsic_time_unit(TimeDisplayUnit::Milliseconds)
            .unwrap();
        model
            .set_intrinsic_time_unit(TimeDisplayUnit::Milliseconds)
            .unwrap();
        assert!(model
            .set_intrinsic_time_unit(TimeDisplayUnit::Nanoseconds)
            .is_err());
    }

    #[rstest]
    fn shift_world_to_zero_is_idempotent() {
        let mut model = Model::new();
        let group = &mut model.thread_mut(1, 1).slice_group;
        group.push_complete_slice(Slice::new("c".into(), "a".into(), 0, 5.0), 3.0);
        model.update_bounds();
        model.shift_world_to_zero();
        assert_eq!(model.bounds.min, Some(0.0));
        assert_eq!(model.bounds.max, Some(3.0));
        let start_after_first = model.processes[&1].threads[&1].slice_group.slices()[0].start;
        model.shift_world_to_zero();
        let start_after_second = model.processes[&1].threads[&1].slice_group.slices()[0].start;
        assert_eq!(start_after_first, start_after_second);
    }

    #[rstest]
    fn prune_drops_threads_without_events() {
        let mut model = Model::new();
        model.thread_mut(1, 1);
        model
            .thread_mut(1, 2)
            .slice_group
            .push_complete_slice(closed_slice("a", 0.0, 1.0), 1.0);
        model.thread_mut(2, 1);
        model.prune_empty_containers();
        assert_eq!(model.processes.len(), 1);
        assert_eq!(model.processes[&1].threads.len(), 1);
        assert!(model.processes[&1].threads.contains_key(&2));
    }

    #[rstest]
    fn prune_keeps_sampled_threads() {
        let mut model = Model::new();
        model.thread_mut(3, 7);
        model.samples.push(Sample {
            thread: ThreadKey { pid: 3, tid: 7 },
            title: "cycles".into(),
            ts: 1.0,
            leaf_frame_id: None,
            weight: 1.0,
            cpu: None,
            color_id: 0,
        });
        model.prune_empty_containers();
        assert!(model.processes[&3].threads.contains_key(&7));
    }

    #[rstest]
    fn bounds_ignore_clock_sync_records() {
        let mut model = Model::new();
        model.clock_sync_records.push(ClockSyncRecord {
            name: "ftrace_importer".into(),
            ts: 0.0,
            sync_id: None,
            issue_ts: None,
        });
        model
            .thread_mut(1, 1)
            .slice_group
            .push_complete_slice(closed_slice("a", 4.0, 2.0), 2.0);
        model.update_bounds();
        assert_eq!(model.bounds.min, Some(4.0));
    }

    #[rstest]
    fn categories_collect_across_containers() {
        let mut model = Model::new();
        model
            .thread_mut(1, 1)
            .slice_group
            .push_complete_slice(Slice::new("blink".into(), "a".into(), 0, 0.0), 1.0);
        model.instant_events.push(InstantEvent {
            category: "ipc".into(),
            title: "ping".into(),
            color_id: 0,
            ts: 0.5,
            args: ArgDict::new(),
        });
        model.update_bounds();
        assert!(model.categories.contains("blink"));
        assert!(model.categories.contains("ipc"));
    }

    #[rstest]
    fn color_id_is_stable_and_in_range() {
        let a = color_id_for_general_purpose_string("CrRendererMain");
        assert_eq!(a, color_id_for_general_purpose_string("CrRendererMain"));
        assert!(a < GENERAL_PURPOSE_COLOR_IDS);
    }

    #[rstest]
    fn event_indices_group_flow_events_by_id() {
        let mut model = Model::new();
        for (id, start) in [("7", 0.0), ("7", 5.0), ("9", 1.0)] {
            model.flow_events.push(FlowEvent {
                id: id.into(),
                category: String::new(),
                title: String::new(),
                color_id: 0,
                start,
                end: start + 1.0,
                args: ArgDict::new(),
                start_slice: None,
                end_slice: None,
            });
        }
        model.build_event_indices();
        assert_eq!(model.indices.flow_events_by_id["7"], vec![0, 1]);
        assert_eq!(model.indices.flow_events_by_id["9"], vec![2]);
    }
}
