//! Processes, the kernel pseudo-process, and the device container.

use std::collections::BTreeMap;

use crate::bounds::Bounds;
use crate::counter::Counter;
use crate::events::InstantEvent;
use crate::object::ObjectCollection;
use crate::thread::{Thread, ThreadKey};

/// A traced process: threads, counters, tracked objects, and references
/// into the model's global memory dumps.
#[derive(Debug)]
pub struct Process {
    pub pid: i64,
    pub name: Option<String>,
    pub labels: Vec<String>,
    pub sort_index: Option<f64>,
    pub uptime_seconds: Option<f64>,
    pub threads: BTreeMap<i64, Thread>,
    /// Keyed by (category, counter name).
    pub counters: BTreeMap<(String, String), Counter>,
    pub objects: ObjectCollection,
    pub instant_events: Vec<InstantEvent>,
    /// (global dump index, process dump index within it).
    pub memory_dump_refs: Vec<(usize, usize)>,
}

impl Process {
    pub fn new(pid: i64) -> Process {
        Process {
            pid,
            name: None,
            labels: Vec::new(),
            sort_index: None,
            uptime_seconds: None,
            threads: BTreeMap::new(),
            counters: BTreeMap::new(),
            objects: ObjectCollection::new(),
            instant_events: Vec::new(),
            memory_dump_refs: Vec::new(),
        }
    }

    pub fn thread_mut(&mut self, tid: i64) -> &mut Thread {
        let pid = self.pid;
        self.threads
            .entry(tid)
            .or_insert_with(|| Thread::new(ThreadKey { pid, tid }))
    }

    pub fn counter_mut(&mut self, category: &str, name: &str) -> &mut Counter {
        self.counters
            .entry((category.to_string(), name.to_string()))
            .or_insert_with(|| Counter::new(category.to_string(), name.to_string()))
    }

    pub fn find_all_threads_named(&self, name: &str) -> Vec<&Thread> {
        self.threads
            .values()
            .filter(|t| t.name.as_deref() == Some(name))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
            && self.counters.is_empty()
            && self.objects.is_empty()
            && self.instant_events.is_empty()
            && self.memory_dump_refs.is_empty()
    }

    pub fn shift_timestamps(&mut self, delta: f64) {
        for thread in self.threads.values_mut() {
            thread.shift_timestamps(delta);
        }
        for counter in self.counters.values_mut() {
            counter.shift_timestamps(delta);
        }
        self.objects.shift_timestamps(delta);
        for instant in &mut self.instant_events {
            instant.ts += delta;
        }
    }

    pub fn add_bounds(&self, bounds: &mut Bounds) {
        for thread in self.threads.values() {
            thread.add_bounds(bounds);
        }
        for counter in self.counters.values() {
            counter.add_bounds(bounds);
        }
        self.objects.add_bounds(bounds);
        for instant in &self.instant_events {
            bounds.add_value(instant.ts);
        }
    }
}

/// The kernel pseudo-container: its threads are disjoint from every
/// process's threads.
#[derive(Debug, Default)]
pub struct Kernel {
    pub threads: BTreeMap<i64, Thread>,
    pub software_measured_cpu_count: Option<u32>,
}

impl Kernel {
    /// Kernel threads get this pseudo-pid in their key.
    pub const PSEUDO_PID: i64 = -1;

    pub fn new() -> Kernel {
        Kernel::default()
    }

    pub fn thread_mut(&mut self, tid: i64) -> &mut Thread {
        self.threads.entry(tid).or_insert_with(|| {
            Thread::new(ThreadKey {
                pid: Kernel::PSEUDO_PID,
                tid,
            })
        })
    }

    pub fn find_all_threads_named(&self, name: &str) -> Vec<&Thread> {
        self.threads
            .values()
            .filter(|t| t.name.as_deref() == Some(name))
            .collect()
    }

    pub fn shift_timestamps(&mut self, delta: f64) {
        for thread in self.threads.values_mut() {
            thread.shift_timestamps(delta);
        }
    }

    pub fn add_bounds(&self, bounds: &mut Bounds) {
        for thread in self.threads.values() {
            thread.add_bounds(bounds);
        }
    }
}

/// Hardware-level container. Nothing in the trace event stream populates
/// it today; it exists so device-scoped importers can share the model.
#[derive(Debug, Default)]
pub struct Device {}

impl Device {
    pub fn new() -> Device {
        Device::default()
    }
}
