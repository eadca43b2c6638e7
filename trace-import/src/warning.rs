//! Typed import warnings.
//!
//! Tier-2 and tier-3 conditions never abort the import; they are recorded
//! here in emission order. Kinds deduplicate for operator-facing logging
//! while every record stays on the importer.

/// Kind tag of an import warning. The string forms are the stable names
/// downstream tooling matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WarningKind {
    DurationParseError,
    TitleMatchError,
    ArgMergeError,
    AsyncSliceParseError,
    FlowSliceParseError,
    FlowSliceStartError,
    FlowSliceEndError,
    FlowSliceOrderingError,
    FlowSliceBindPointError,
    CounterParseError,
    ObjectParseError,
    ObjectSnapshotParseError,
    MemoryDumpParseError,
    MetadataParseError,
    StackFrameAndStackError,
    SampleImportError,
    InstantParseError,
    AnnotationWarning,
    ParseError,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::DurationParseError => "duration_parse_error",
            WarningKind::TitleMatchError => "title_match_error",
            WarningKind::ArgMergeError => "arg_merge_error",
            WarningKind::AsyncSliceParseError => "async_slice_parse_error",
            WarningKind::FlowSliceParseError => "flow_slice_parse_error",
            WarningKind::FlowSliceStartError => "flow_slice_start_error",
            WarningKind::FlowSliceEndError => "flow_slice_end_error",
            WarningKind::FlowSliceOrderingError => "flow_slice_ordering_error",
            WarningKind::FlowSliceBindPointError => "flow_slice_bind_point_error",
            WarningKind::CounterParseError => "counter_parse_error",
            WarningKind::ObjectParseError => "object_parse_error",
            WarningKind::ObjectSnapshotParseError => "object_snapshot_parse_error",
            WarningKind::MemoryDumpParseError => "memory_dump_parse_error",
            WarningKind::MetadataParseError => "metadata_parse_error",
            WarningKind::StackFrameAndStackError => "stack_frame_and_stack_error",
            WarningKind::SampleImportError => "sample_import_error",
            WarningKind::InstantParseError => "instant_parse_error",
            WarningKind::AnnotationWarning => "annotation_warning",
            WarningKind::ParseError => "parse_error",
        }
    }
}

impl std::fmt::Display for WarningKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportWarning {
    pub kind: WarningKind,
    pub message: String,
}
