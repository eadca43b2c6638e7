//! Memory dump assembler: pairs `V`/`v` events by dump id, parses process
//! totals, VM regions, allocator dump trees, the edge graph, and heap
//! dumps.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use trace_format::{Phase, TraceEvent};
use trace_model::{
    AllocatorAttribute, GlobalMemoryDump, HeapDump, HeapEntry, MemoryDumpEdge,
    MemoryDumpEdgeType, MemoryDumpLevel, ProcessMemoryDump, VmRegion, VmRegionByteStats,
};

use crate::importer::{us_to_ms, MemoryDumpEvents, TraceEventImporter};
use crate::warning::WarningKind;

/// Hex string ("1af0" or "0x1af0") or plain number.
fn parse_hex(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::String(s) => {
            let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
            u64::from_str_radix(digits, 16).ok()
        }
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Where a guid-bearing allocator dump lives within one global dump.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GuidContainer {
    Global,
    Process(i64),
}

#[derive(Debug)]
struct GuidTarget {
    container: GuidContainer,
    full_name: String,
}

#[derive(Debug)]
struct RawEdge {
    source: String,
    target: String,
    edge_type: String,
    importance: i64,
}

impl TraceEventImporter {
    pub(crate) fn queue_memory_dump_event(&mut self, phase: Phase, event: TraceEvent) {
        let Some(id) = event.id.clone() else {
            self.warn(
                WarningKind::MemoryDumpParseError,
                "memory dump event without a dump id".to_string(),
            );
            return;
        };
        if !self.memory_dump_events.contains_key(&id) {
            self.memory_dump_ids.push(id.clone());
        }
        let entry = self.memory_dump_events.entry(id.clone()).or_default();
        match phase {
            Phase::GlobalMemoryDump => {
                if entry.global.is_some() {
                    self.warn(
                        WarningKind::MemoryDumpParseError,
                        format!("dump id {id} already has a global dump event"),
                    );
                    return;
                }
                entry.global = Some(event);
            }
            Phase::ProcessMemoryDump => entry.process.push(event),
            _ => {}
        }
    }

    pub(crate) fn finish_memory_dump_events(&mut self) {
        let ids = std::mem::take(&mut self.memory_dump_ids);
        let mut events = std::mem::take(&mut self.memory_dump_events);
        for id in ids {
            if let Some(entry) = events.remove(&id) {
                self.assemble_memory_dump(id, entry);
            }
        }
    }

    fn assemble_memory_dump(&mut self, id: String, events: MemoryDumpEvents) {
        let Some(global_event) = events.global else {
            self.warn(
                WarningKind::MemoryDumpParseError,
                format!("dump id {id} has process dumps but no global dump event"),
            );
            return;
        };

        let mut min_ts = global_event.ts;
        let mut max_ts = global_event.ts;
        for event in &events.process {
            min_ts = min_ts.min(event.ts);
            max_ts = max_ts.max(event.ts);
        }
        let mut dump =
            GlobalMemoryDump::new(id, us_to_ms(min_ts), us_to_ms(max_ts) - us_to_ms(min_ts));

        let mut guid_index: HashMap<String, GuidTarget> = HashMap::new();
        let mut raw_edges: Vec<RawEdge> = Vec::new();
        let mut seen_pids: HashSet<i64> = HashSet::new();

        for event in events.process {
            let pid = event.pid.unwrap_or(0);
            if !seen_pids.insert(pid) {
                self.warn(
                    WarningKind::MemoryDumpParseError,
                    format!("dump id {} has two process dumps for pid {pid}", dump.id),
                );
                continue;
            }
            let mut pmd = ProcessMemoryDump::new(pid, us_to_ms(event.ts));

            match event.args.as_ref().and_then(|a| a.get("dumps")) {
                Some(dumps) => {
                    self.parse_process_totals(&mut pmd, dumps);
                    self.parse_vm_regions(&mut pmd, dumps);
                    self.parse_level_of_detail(&mut pmd, dumps);
                    self.parse_allocator_dumps(&mut dump, &mut pmd, dumps, &mut guid_index);
                    self.collect_raw_edges(&mut raw_edges, dumps);
                    self.parse_heap_dumps(&mut pmd, dumps);
                }
                None => self.warn(
                    WarningKind::MemoryDumpParseError,
                    format!("process dump for pid {pid} has no args.dumps"),
                ),
            }
            dump.process_dumps.push(pmd);
        }

        self.resolve_dump_level(&mut dump);

        dump.allocator_dumps.infer_tree();
        for pmd in &mut dump.process_dumps {
            pmd.allocator_dumps.infer_tree();
        }

        self.resolve_edges(&mut dump, raw_edges, &guid_index);

        let global_index = self.model.global_memory_dumps.len();
        for (pmd_index, pmd) in dump.process_dumps.iter().enumerate() {
            self.model
                .process_mut(pmd.pid)
                .memory_dump_refs
                .push((global_index, pmd_index));
        }
        self.model.global_memory_dumps.push(dump);
    }

    fn parse_process_totals(&mut self, pmd: &mut ProcessMemoryDump, dumps: &Value) {
        let totals = dumps.get("process_totals");
        pmd.total_resident_bytes =
            totals.and_then(|t| parse_hex(t.get("resident_set_bytes")));
        if pmd.total_resident_bytes.is_none() {
            self.warn(
                WarningKind::MemoryDumpParseError,
                format!(
                    "process dump for pid {} has no resident_set_bytes",
                    pmd.pid
                ),
            );
        }

        let peak = totals.and_then(|t| parse_hex(t.get("peak_resident_set_bytes")));
        let resettable = totals
            .and_then(|t| t.get("is_peak_rss_resetable"))
            .and_then(Value::as_bool);
        match (peak, resettable) {
            (Some(peak), Some(resettable)) => {
                pmd.peak_resident_bytes = Some(peak);
                pmd.are_peak_resident_bytes_resettable = Some(resettable);
            }
            (None, None) => {}
            _ => self.warn(
                WarningKind::MemoryDumpParseError,
                format!(
                    "process dump for pid {} has only one of peak_resident_set_bytes and is_peak_rss_resetable",
                    pmd.pid
                ),
            ),
        }
    }

    fn parse_vm_regions(&mut self, pmd: &mut ProcessMemoryDump, dumps: &Value) {
        let Some(regions) = dumps
            .get("process_mmaps")
            .and_then(|m| m.get("vm_regions"))
            .and_then(Value::as_array)
        else {
            return;
        };
        for region in regions {
            let (Some(start_address), Some(size_in_bytes)) =
                (parse_hex(region.get("sa")), parse_hex(region.get("sz")))
            else {
                self.warn(
                    WarningKind::MemoryDumpParseError,
                    format!("vm region in pid {} dump has no address or size", pmd.pid),
                );
                continue;
            };
            let byte_stats = region.get("bs");
            let stat = |key: &str| byte_stats.and_then(|bs| parse_hex(bs.get(key)));
            pmd.vm_regions.push(VmRegion {
                start_address,
                size_in_bytes,
                protection_flags: region
                    .get("pf")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                mapped_file: region
                    .get("mf")
                    .and_then(Value::as_str)
                    .map(String::from),
                byte_stats: VmRegionByteStats {
                    private_clean_resident: stat("pc"),
                    private_dirty_resident: stat("pd"),
                    shared_clean_resident: stat("sc"),
                    shared_dirty_resident: stat("sd"),
                    proportional_resident: stat("pss"),
                    swapped: stat("sw"),
                },
            });
        }
    }

    fn parse_level_of_detail(&mut self, pmd: &mut ProcessMemoryDump, dumps: &Value) {
        match dumps.get("level_of_detail") {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) => match MemoryDumpLevel::parse(raw) {
                Some(level) => pmd.level_of_detail = Some(level),
                None => self.warn(
                    WarningKind::MemoryDumpParseError,
                    format!("unknown memory dump level of detail '{raw}'"),
                ),
            },
            Some(other) => self.warn(
                WarningKind::MemoryDumpParseError,
                format!("unexpected level_of_detail value {other}"),
            ),
        }
    }

    fn resolve_dump_level(&mut self, dump: &mut GlobalMemoryDump) {
        let mut level: Option<MemoryDumpLevel> = None;
        let mut mismatch = false;
        for (index, pmd) in dump.process_dumps.iter().enumerate() {
            if index > 0 && pmd.level_of_detail != level && !mismatch {
                mismatch = true;
            }
            level = level.max(pmd.level_of_detail);
        }
        if mismatch {
            self.warn(
                WarningKind::MemoryDumpParseError,
                format!(
                    "dump id {} has process dumps with differing levels of detail",
                    dump.id
                ),
            );
        }
        dump.level_of_detail = level;
    }

    fn parse_allocator_dumps(
        &mut self,
        dump: &mut GlobalMemoryDump,
        pmd: &mut ProcessMemoryDump,
        dumps: &Value,
        guid_index: &mut HashMap<String, GuidTarget>,
    ) {
        let Some(allocators) = dumps.get("allocators").and_then(Value::as_object) else {
            return;
        };
        for (raw_name, raw_dump) in allocators {
            let (is_global, full_name) = match raw_name.strip_prefix("global/") {
                Some(stripped) => (true, stripped.to_string()),
                None => (false, raw_name.clone()),
            };
            let guid = raw_dump
                .get("guid")
                .and_then(Value::as_str)
                .map(String::from);

            let container = if is_global {
                GuidContainer::Global
            } else {
                GuidContainer::Process(pmd.pid)
            };

            if let (Some(guid), Some(existing)) =
                (guid.as_ref(), guid.as_ref().and_then(|g| guid_index.get(g)))
            {
                if existing.container != container {
                    self.warn(
                        WarningKind::MemoryDumpParseError,
                        format!("allocator dump guid {guid} reused across containers"),
                    );
                    continue;
                }
                if existing.full_name != full_name {
                    self.warn(
                        WarningKind::MemoryDumpParseError,
                        format!(
                            "allocator dump guid {guid} reused for '{full_name}' and '{}'",
                            existing.full_name
                        ),
                    );
                    continue;
                }
            }

            let set = if is_global {
                &mut dump.allocator_dumps
            } else {
                &mut pmd.allocator_dumps
            };
            let index = set.get_or_create(&full_name);
            let node = set.get_mut(index).expect("just created");
            if node.guid.is_none() {
                node.guid = guid.clone();
            }

            let mut duplicate_attrs: Vec<String> = Vec::new();
            if let Some(attrs) = raw_dump.get("attrs").and_then(Value::as_object) {
                for (attr_name, attr) in attrs {
                    if node.attributes.contains_key(attr_name) {
                        duplicate_attrs.push(attr_name.clone());
                        continue;
                    }
                    node.attributes.insert(
                        attr_name.clone(),
                        AllocatorAttribute {
                            attr_type: attr
                                .get("type")
                                .and_then(Value::as_str)
                                .map(String::from),
                            units: attr
                                .get("units")
                                .and_then(Value::as_str)
                                .map(String::from),
                            value: attr.get("value").cloned().unwrap_or(Value::Null),
                        },
                    );
                }
            }
            for attr_name in duplicate_attrs {
                self.warn(
                    WarningKind::MemoryDumpParseError,
                    format!("allocator dump '{full_name}' defines attribute '{attr_name}' twice"),
                );
            }

            if let Some(guid) = guid {
                guid_index.entry(guid).or_insert(GuidTarget {
                    container,
                    full_name,
                });
            }
        }
    }

    fn collect_raw_edges(&mut self, edges: &mut Vec<RawEdge>, dumps: &Value) {
        let Some(graph) = dumps.get("allocators_graph").and_then(Value::as_array) else {
            return;
        };
        for entry in graph {
            let source = entry.get("source").and_then(Value::as_str);
            let target = entry.get("target").and_then(Value::as_str);
            let (Some(source), Some(target)) = (source, target) else {
                self.warn(
                    WarningKind::MemoryDumpParseError,
                    "allocator graph edge without source or target guid".to_string(),
                );
                continue;
            };
            edges.push(RawEdge {
                source: source.to_string(),
                target: target.to_string(),
                edge_type: entry
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                importance: entry
                    .get("importance")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            });
        }
    }

    fn resolve_edges(
        &mut self,
        dump: &mut GlobalMemoryDump,
        raw_edges: Vec<RawEdge>,
        guid_index: &HashMap<String, GuidTarget>,
    ) {
        let mut ownership_sources: HashSet<String> = HashSet::new();
        for edge in raw_edges {
            if !guid_index.contains_key(&edge.source) {
                self.warn(
                    WarningKind::MemoryDumpParseError,
                    format!("allocator graph edge references unknown source guid {}", edge.source),
                );
                continue;
            }
            if !guid_index.contains_key(&edge.target) {
                self.warn(
                    WarningKind::MemoryDumpParseError,
                    format!("allocator graph edge references unknown target guid {}", edge.target),
                );
                continue;
            }
            let edge_type = match edge.edge_type.as_str() {
                "ownership" => {
                    if !ownership_sources.insert(edge.source.clone()) {
                        self.warn(
                            WarningKind::MemoryDumpParseError,
                            format!("allocator dump guid {} owns more than one target", edge.source),
                        );
                        continue;
                    }
                    MemoryDumpEdgeType::Ownership
                }
                "retention" => MemoryDumpEdgeType::Retention,
                other => {
                    self.warn(
                        WarningKind::MemoryDumpParseError,
                        format!("unknown allocator graph edge type '{other}'"),
                    );
                    continue;
                }
            };
            dump.edges.push(MemoryDumpEdge {
                source_guid: edge.source,
                target_guid: edge.target,
                edge_type,
                importance: edge.importance,
            });
        }
    }

    fn parse_heap_dumps(&mut self, pmd: &mut ProcessMemoryDump, dumps: &Value) {
        let Some(heaps) = dumps.get("heaps").and_then(Value::as_object) else {
            return;
        };
        for (allocator_name, heap) in heaps {
            let mut heap_dump = HeapDump {
                allocator_name: allocator_name.clone(),
                entries: Vec::new(),
            };
            let entries = heap.get("entries").and_then(Value::as_array);
            for entry in entries.into_iter().flatten() {
                let Some(size_in_bytes) = parse_hex(entry.get("size")) else {
                    self.warn(
                        WarningKind::MemoryDumpParseError,
                        format!("heap entry in '{allocator_name}' has no size"),
                    );
                    continue;
                };
                let leaf_frame_id = match entry.get("bt") {
                    None | Some(Value::Null) => None,
                    Some(bt) => {
                        let raw = match bt {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        if raw.is_empty() {
                            None
                        } else {
                            let qualified = format!("p{}:{raw}", pmd.pid);
                            if !self.model.stack_frames.contains(&qualified) {
                                self.warn(
                                    WarningKind::MemoryDumpParseError,
                                    format!(
                                        "heap entry in '{allocator_name}' references missing stack frame {raw}"
                                    ),
                                );
                                continue;
                            }
                            Some(qualified)
                        }
                    }
                };
                heap_dump.entries.push(HeapEntry {
                    leaf_frame_id,
                    size_in_bytes,
                });
            }
            pmd.heap_dumps.insert(allocator_name.clone(), heap_dump);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    use crate::config::ImportConfig;

    fn importer() -> TraceEventImporter {
        TraceEventImporter::new(ImportConfig::default())
    }

    fn dump_event(ph: &str, pid: i64, ts: f64, id: &str, args: Value) -> TraceEvent {
        let mut event = TraceEvent::builder()
            .ph(ph.to_string())
            .pid(pid)
            .tid(pid)
            .ts(ts)
            .build();
        event.id = Some(id.to_string());
        event.args = Some(args);
        event
    }

    fn push(imp: &mut TraceEventImporter, event: TraceEvent) {
        let phase = event.phase().unwrap();
        imp.queue_memory_dump_event(phase, event);
    }

    #[rstest]
    fn global_and_process_dumps_pair_by_id() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        push(
            &mut imp,
            dump_event(
                "v",
                1,
                50.0,
                "abc",
                json!({"dumps": {"process_totals": {"resident_set_bytes": "0x1000"}}}),
            ),
        );
        push(
            &mut imp,
            dump_event(
                "v",
                2,
                150.0,
                "abc",
                json!({"dumps": {"process_totals": {"resident_set_bytes": "2000"}}}),
            ),
        );
        imp.finish_memory_dump_events();

        assert_eq!(imp.model.global_memory_dumps.len(), 1);
        let dump = &imp.model.global_memory_dumps[0];
        assert_eq!(dump.start, 0.05);
        assert_eq!(dump.duration, 0.1);
        assert_eq!(dump.process_dumps.len(), 2);
        assert_eq!(dump.process_dumps[0].total_resident_bytes, Some(0x1000));
        assert_eq!(dump.process_dumps[1].total_resident_bytes, Some(0x2000));
        assert_eq!(imp.model.processes[&1].memory_dump_refs, vec![(0, 0)]);
        assert!(imp.warnings.is_empty());
    }

    #[rstest]
    fn duplicate_global_event_warns() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        push(&mut imp, dump_event("V", 0, 200.0, "abc", json!({})));
        assert_eq!(imp.warnings[0].kind, WarningKind::MemoryDumpParseError);
    }

    #[rstest]
    fn duplicate_pid_is_skipped() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        let args = json!({"dumps": {"process_totals": {"resident_set_bytes": "1"}}});
        push(&mut imp, dump_event("v", 1, 50.0, "abc", args.clone()));
        push(&mut imp, dump_event("v", 1, 60.0, "abc", args));
        imp.finish_memory_dump_events();
        assert_eq!(imp.model.global_memory_dumps[0].process_dumps.len(), 1);
        assert!(imp
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MemoryDumpParseError));
    }

    #[rstest]
    fn missing_resident_bytes_warns() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        push(
            &mut imp,
            dump_event("v", 1, 50.0, "abc", json!({"dumps": {"process_totals": {}}})),
        );
        imp.finish_memory_dump_events();
        assert!(imp
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MemoryDumpParseError));
    }

    #[rstest]
    fn peak_bytes_require_resettable_flag() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        push(
            &mut imp,
            dump_event(
                "v",
                1,
                50.0,
                "abc",
                json!({"dumps": {"process_totals": {
                    "resident_set_bytes": "1000",
                    "peak_resident_set_bytes": "2000"
                }}}),
            ),
        );
        imp.finish_memory_dump_events();
        let pmd = &imp.model.global_memory_dumps[0].process_dumps[0];
        assert_eq!(pmd.peak_resident_bytes, None);
        assert!(imp
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MemoryDumpParseError));
    }

    #[rstest]
    fn vm_regions_parse_hex_fields() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        push(
            &mut imp,
            dump_event(
                "v",
                1,
                50.0,
                "abc",
                json!({"dumps": {
                    "process_totals": {"resident_set_bytes": "1000"},
                    "process_mmaps": {"vm_regions": [{
                        "sa": "8000",
                        "sz": "2000",
                        "pf": 5,
                        "mf": "/usr/lib/libc.so",
                        "bs": {"pss": "1a0", "pd": "40", "sw": "0"}
                    }]}
                }}),
            ),
        );
        imp.finish_memory_dump_events();
        let regions = &imp.model.global_memory_dumps[0].process_dumps[0].vm_regions;
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start_address, 0x8000);
        assert_eq!(regions[0].size_in_bytes, 0x2000);
        assert_eq!(
            regions[0].protection_flags,
            VmRegion::PROTECTION_FLAG_READ | VmRegion::PROTECTION_FLAG_EXECUTE
        );
        assert_eq!(regions[0].byte_stats.proportional_resident, Some(0x1a0));
        assert_eq!(regions[0].byte_stats.swapped, Some(0));
    }

    #[rstest]
    fn shared_global_allocator_merges_across_processes() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        for pid in [1, 2] {
            push(
                &mut imp,
                dump_event(
                    "v",
                    pid,
                    100.0,
                    "abc",
                    json!({"dumps": {
                        "process_totals": {"resident_set_bytes": "1000"},
                        "allocators": {
                            "global/shared": {"guid": "g1", "attrs": {
                                "size": {"type": "scalar", "units": "bytes", "value": "100"}
                            }}
                        }
                    }}),
                ),
            );
        }
        imp.finish_memory_dump_events();
        let dump = &imp.model.global_memory_dumps[0];
        assert_eq!(dump.allocator_dumps.len(), 1);
        let shared = dump.allocator_dumps.by_name("shared").unwrap();
        assert_eq!(shared.guid.as_deref(), Some("g1"));
        assert!(shared.attributes.contains_key("size"));
        assert!(imp.warnings.is_empty());
    }

    #[rstest]
    fn allocator_tree_is_inferred_per_process() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        push(
            &mut imp,
            dump_event(
                "v",
                1,
                100.0,
                "abc",
                json!({"dumps": {
                    "process_totals": {"resident_set_bytes": "1000"},
                    "allocators": {
                        "malloc/allocated_objects": {"guid": "a1", "attrs": {}},
                        "v8": {"guid": "a2", "attrs": {}}
                    }
                }}),
            ),
        );
        imp.finish_memory_dump_events();
        let pmd = &imp.model.global_memory_dumps[0].process_dumps[0];
        assert_eq!(pmd.allocator_dumps.len(), 3);
        let roots: Vec<&str> = pmd
            .allocator_dumps
            .roots()
            .into_iter()
            .map(|i| pmd.allocator_dumps.dumps()[i].full_name.as_str())
            .collect();
        assert_eq!(roots, vec!["malloc", "v8"]);
    }

    #[rstest]
    fn ownership_edges_are_unique_per_source() {
        let mut imp = importer();
        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        push(
            &mut imp,
            dump_event(
                "v",
                1,
                100.0,
                "abc",
                json!({"dumps": {
                    "process_totals": {"resident_set_bytes": "1000"},
                    "allocators": {
                        "a": {"guid": "g-a", "attrs": {}},
                        "b": {"guid": "g-b", "attrs": {}},
                        "c": {"guid": "g-c", "attrs": {}}
                    },
                    "allocators_graph": [
                        {"source": "g-a", "target": "g-b", "type": "ownership", "importance": 1},
                        {"source": "g-a", "target": "g-c", "type": "ownership", "importance": 2},
                        {"source": "g-b", "target": "g-c", "type": "retention", "importance": 0},
                        {"source": "g-x", "target": "g-c", "type": "retention", "importance": 0}
                    ]
                }}),
            ),
        );
        imp.finish_memory_dump_events();
        let dump = &imp.model.global_memory_dumps[0];
        assert_eq!(dump.edges.len(), 2);
        assert_eq!(dump.edges[0].edge_type, MemoryDumpEdgeType::Ownership);
        assert_eq!(dump.edges[1].edge_type, MemoryDumpEdgeType::Retention);
        assert_eq!(
            imp.warnings
                .iter()
                .filter(|w| w.kind == WarningKind::MemoryDumpParseError)
                .count(),
            2
        );
    }

    #[rstest]
    fn heap_entries_resolve_process_scoped_frames() {
        let mut imp = importer();
        // Register the process-scoped frame table first, as the metadata
        // handler would.
        let frames: std::collections::HashMap<String, trace_format::StackFrameRecord> =
            serde_json::from_value(json!({"42": {"name": "malloc"}})).unwrap();
        imp.import_stack_frames(&frames, "p1:", true);

        push(&mut imp, dump_event("V", 0, 100.0, "abc", json!({})));
        push(
            &mut imp,
            dump_event(
                "v",
                1,
                100.0,
                "abc",
                json!({"dumps": {
                    "process_totals": {"resident_set_bytes": "1000"},
                    "heaps": {"malloc": {"entries": [
                        {"bt": "42", "size": "a0"},
                        {"bt": "", "size": "100"},
                        {"bt": "99", "size": "10"}
                    ]}}
                }}),
            ),
        );
        imp.finish_memory_dump_events();
        let pmd = &imp.model.global_memory_dumps[0].process_dumps[0];
        let heap = &pmd.heap_dumps["malloc"];
        assert_eq!(heap.entries.len(), 2);
        assert_eq!(heap.entries[0].leaf_frame_id.as_deref(), Some("p1:42"));
        assert_eq!(heap.entries[0].size_in_bytes, 0xa0);
        assert_eq!(heap.entries[1].leaf_frame_id, None);
        assert!(imp
            .warnings
            .iter()
            .any(|w| w.message.contains("missing stack frame 99")));
    }

    #[rstest]
    fn dump_without_global_event_warns_and_skips() {
        let mut imp = importer();
        push(
            &mut imp,
            dump_event("v", 1, 50.0, "abc", json!({"dumps": {}})),
        );
        imp.finish_memory_dump_events();
        assert!(imp.model.global_memory_dumps.is_empty());
        assert!(imp
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MemoryDumpParseError));
    }
}
