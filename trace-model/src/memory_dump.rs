//! Memory dumps: global snapshots spanning per-process dumps, each with a
//! tree of allocator dumps, VM regions, and optional heap profiles.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::bounds::Bounds;

/// Granularity a memory dump was captured at. Orders
/// `None < Light < Detailed` through `Option`'s ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryDumpLevel {
    Light,
    Detailed,
}

impl MemoryDumpLevel {
    pub fn parse(raw: &str) -> Option<MemoryDumpLevel> {
        match raw {
            "light" => Some(MemoryDumpLevel::Light),
            "detailed" => Some(MemoryDumpLevel::Detailed),
            _ => None,
        }
    }
}

/// Per-mapping byte statistics, all in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VmRegionByteStats {
    pub private_clean_resident: Option<u64>,
    pub private_dirty_resident: Option<u64>,
    pub shared_clean_resident: Option<u64>,
    pub shared_dirty_resident: Option<u64>,
    pub proportional_resident: Option<u64>,
    pub swapped: Option<u64>,
}

/// One virtual memory mapping of a process.
#[derive(Debug, Clone, Default)]
pub struct VmRegion {
    pub start_address: u64,
    pub size_in_bytes: u64,
    /// Bitmask of the `PROTECTION_FLAG_*` constants.
    pub protection_flags: u32,
    pub mapped_file: Option<String>,
    pub byte_stats: VmRegionByteStats,
}

impl VmRegion {
    pub const PROTECTION_FLAG_READ: u32 = 4;
    pub const PROTECTION_FLAG_WRITE: u32 = 2;
    pub const PROTECTION_FLAG_EXECUTE: u32 = 1;
    pub const PROTECTION_FLAG_MAYSHARE: u32 = 128;
}

/// One attribute of an allocator dump (`{type, units, value}` on the wire).
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorAttribute {
    pub attr_type: Option<String>,
    pub units: Option<String>,
    pub value: Value,
}

/// A node in the '/'-separated allocator dump tree.
#[derive(Debug, Clone)]
pub struct MemoryAllocatorDump {
    pub full_name: String,
    pub guid: Option<String>,
    pub attributes: BTreeMap<String, AllocatorAttribute>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl MemoryAllocatorDump {
    pub fn new(full_name: String) -> MemoryAllocatorDump {
        MemoryAllocatorDump {
            full_name,
            guid: None,
            attributes: BTreeMap::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    /// Last path segment of the full name.
    pub fn name(&self) -> &str {
        self.full_name
            .rsplit_once('/')
            .map_or(self.full_name.as_str(), |(_, last)| last)
    }
}

/// The allocator dumps of one container (a process dump or the global
/// dump), indexed by full name.
#[derive(Debug, Default)]
pub struct AllocatorDumpSet {
    dumps: Vec<MemoryAllocatorDump>,
    by_full_name: HashMap<String, usize>,
}

impl AllocatorDumpSet {
    pub fn new() -> AllocatorDumpSet {
        AllocatorDumpSet::default()
    }

    pub fn dumps(&self) -> &[MemoryAllocatorDump] {
        &self.dumps
    }

    pub fn get(&self, index: usize) -> Option<&MemoryAllocatorDump> {
        self.dumps.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MemoryAllocatorDump> {
        self.dumps.get_mut(index)
    }

    pub fn index_of(&self, full_name: &str) -> Option<usize> {
        self.by_full_name.get(full_name).copied()
    }

    pub fn by_name(&self, full_name: &str) -> Option<&MemoryAllocatorDump> {
        self.index_of(full_name).map(|i| &self.dumps[i])
    }

    pub fn len(&self) -> usize {
        self.dumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dumps.is_empty()
    }

    pub fn get_or_create(&mut self, full_name: &str) -> usize {
        if let Some(&index) = self.by_full_name.get(full_name) {
            return index;
        }
        let index = self.dumps.len();
        self.dumps.push(MemoryAllocatorDump::new(full_name.to_string()));
        self.by_full_name.insert(full_name.to_string(), index);
        index
    }

    /// Roots of the tree: dumps whose name has no '/'.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.dumps.len())
            .filter(|&i| !self.dumps[i].full_name.contains('/'))
            .collect()
    }

    /// Infer the parent/child structure from full names, creating implicit
    /// intermediate dumps as needed. Names are processed in lexicographic
    /// order so implicit nodes are allocated deterministically.
    pub fn infer_tree(&mut self) {
        let mut names: Vec<String> = self.by_full_name.keys().cloned().collect();
        names.sort();
        for name in names {
            let mut child = self.get_or_create(&name);
            while let Some((parent_name, _)) = self.dumps[child].full_name.rsplit_once('/') {
                let parent_name = parent_name.to_string();
                let parent = self.get_or_create(&parent_name);
                if self.dumps[child].parent.is_some() {
                    break;
                }
                self.dumps[child].parent = Some(parent);
                self.dumps[parent].children.push(child);
                child = parent;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryDumpEdgeType {
    Ownership,
    Retention,
}

/// Second-class link between two allocator dumps, identified by GUIDs.
#[derive(Debug, Clone)]
pub struct MemoryDumpEdge {
    pub source_guid: String,
    pub target_guid: String,
    pub edge_type: MemoryDumpEdgeType,
    pub importance: i64,
}

/// One heap profiler entry: bytes attributed to a leaf stack frame. An
/// entry without a frame is the allocator-wide total.
#[derive(Debug, Clone)]
pub struct HeapEntry {
    pub leaf_frame_id: Option<String>,
    pub size_in_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HeapDump {
    pub allocator_name: String,
    pub entries: Vec<HeapEntry>,
}

/// Per-process slice of a global memory dump.
#[derive(Debug)]
pub struct ProcessMemoryDump {
    pub pid: i64,
    /// Milliseconds.
    pub ts: f64,
    pub level_of_detail: Option<MemoryDumpLevel>,
    pub total_resident_bytes: Option<u64>,
    pub peak_resident_bytes: Option<u64>,
    pub are_peak_resident_bytes_resettable: Option<bool>,
    pub vm_regions: Vec<VmRegion>,
    pub allocator_dumps: AllocatorDumpSet,
    pub heap_dumps: BTreeMap<String, HeapDump>,
}

impl ProcessMemoryDump {
    pub fn new(pid: i64, ts: f64) -> ProcessMemoryDump {
        ProcessMemoryDump {
            pid,
            ts,
            level_of_detail: None,
            total_resident_bytes: None,
            peak_resident_bytes: None,
            are_peak_resident_bytes_resettable: None,
            vm_regions: Vec::new(),
            allocator_dumps: AllocatorDumpSet::new(),
            heap_dumps: BTreeMap::new(),
        }
    }
}

/// A simultaneous snapshot of memory across the system: the time range
/// covering every contributing process dump, the `global/` allocator dump
/// tree, and the cross-dump edge graph.
#[derive(Debug)]
pub struct GlobalMemoryDump {
    pub id: String,
    /// Milliseconds.
    pub start: f64,
    pub duration: f64,
    pub level_of_detail: Option<MemoryDumpLevel>,
    pub allocator_dumps: AllocatorDumpSet,
    pub process_dumps: Vec<ProcessMemoryDump>,
    pub edges: Vec<MemoryDumpEdge>,
}

impl GlobalMemoryDump {
    pub fn new(id: String, start: f64, duration: f64) -> GlobalMemoryDump {
        GlobalMemoryDump {
            id,
            start,
            duration,
            level_of_detail: None,
            allocator_dumps: AllocatorDumpSet::new(),
            process_dumps: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn shift_timestamps(&mut self, delta: f64) {
        self.start += delta;
        for pmd in &mut self.process_dumps {
            pmd.ts += delta;
        }
    }

    pub fn add_bounds(&self, bounds: &mut Bounds) {
        bounds.add_range(self.start, self.end());
        for pmd in &self.process_dumps {
            bounds.add_value(pmd.ts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn tree_inference_creates_implicit_parents() {
        let mut set = AllocatorDumpSet::new();
        set.get_or_create("malloc/allocated_objects/arena");
        set.get_or_create("malloc/metadata");
        set.get_or_create("v8");
        set.infer_tree();

        let malloc = set.by_name("malloc").expect("implicit root");
        assert!(malloc.parent.is_none());
        let objects = set.by_name("malloc/allocated_objects").expect("implicit mid");
        assert_eq!(set.dumps()[objects.parent.unwrap()].full_name, "malloc");
        let arena = set.by_name("malloc/allocated_objects/arena").unwrap();
        assert_eq!(
            set.dumps()[arena.parent.unwrap()].full_name,
            "malloc/allocated_objects"
        );

        let roots: Vec<&str> = set
            .roots()
            .into_iter()
            .map(|i| set.dumps()[i].full_name.as_str())
            .collect();
        assert_eq!(roots, vec!["malloc", "v8"]);
    }

    #[rstest]
    fn parent_full_name_is_strict_prefix() {
        let mut set = AllocatorDumpSet::new();
        set.get_or_create("a/b/c");
        set.get_or_create("a/bc");
        set.infer_tree();
        for dump in set.dumps() {
            if let Some(parent) = dump.parent {
                let parent = &set.dumps()[parent];
                assert!(dump
                    .full_name
                    .strip_prefix(&parent.full_name)
                    .is_some_and(|rest| rest.starts_with('/')));
            }
        }
    }

    #[rstest]
    fn dump_name_is_last_segment() {
        let dump = MemoryAllocatorDump::new("malloc/allocated_objects".into());
        assert_eq!(dump.name(), "allocated_objects");
        let root = MemoryAllocatorDump::new("malloc".into());
        assert_eq!(root.name(), "malloc");
    }

    #[rstest]
    fn levels_order_none_light_detailed() {
        let none: Option<MemoryDumpLevel> = None;
        assert!(none < Some(MemoryDumpLevel::Light));
        assert!(Some(MemoryDumpLevel::Light) < Some(MemoryDumpLevel::Detailed));
        assert_eq!(MemoryDumpLevel::parse("detailed"), Some(MemoryDumpLevel::Detailed));
        assert_eq!(MemoryDumpLevel::parse("bogus"), None);
    }
}
