//! # Trace Import
//!
//! Importer for Chrome-style trace event streams. Raw phase-tagged
//! records go in; a finalized [`trace_model::Model`] with typed warnings
//! comes out.
//!
//! ```no_run
//! use trace_import::{import_events_str, ImportConfig};
//!
//! let json = std::fs::read_to_string("trace.json").unwrap();
//! let result = import_events_str(&json, &ImportConfig::default()).unwrap();
//! println!(
//!     "{} processes, {} warnings",
//!     result.model.processes.len(),
//!     result.warnings.len()
//! );
//! ```
//!
//! The importer runs to completion or discards the model: recoverable
//! problems (unmatched ends, malformed counters, unresolvable flows)
//! surface as [`ImportWarning`] records while broken invariants abort the
//! import with an [`ImportError`].

use serde_json::Value;
use thiserror::Error;

use trace_format::TraceContainer;

mod async_events;
mod config;
mod counter_events;
mod finalize;
mod flow_events;
mod importer;
mod memory_dump_events;
mod metadata_events;
mod object_events;
mod slice_events;
mod warning;

pub use config::ImportConfig;
pub use importer::{ImportResult, TraceEventImporter};
pub use warning::{ImportWarning, WarningKind};

pub use trace_format::{can_import_str, can_import_value};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Format(#[from] trace_format::FormatError),

    #[error(transparent)]
    Model(#[from] trace_model::ModelError),

    #[error("unknown displayTimeUnit '{0}'")]
    UnknownDisplayTimeUnit(String),

    #[error("unknown instant event scope '{0}'")]
    UnknownInstantScope(String),

    #[error("implicit snapshot id '{0}' is not of the form name/id")]
    ImplicitSnapshotName(String),

    #[error("top-level snapshot args carry an unliftable id field")]
    TopLevelSnapshotId,
}

/// Import a serialized trace (bare event array or container object).
pub fn import_events_str(
    input: &str,
    config: &ImportConfig,
) -> Result<ImportResult, ImportError> {
    let container = TraceContainer::from_str(input)?;
    import_container(container, config)
}

/// Import a pre-parsed trace value.
pub fn import_events_value(
    value: Value,
    config: &ImportConfig,
) -> Result<ImportResult, ImportError> {
    let container = TraceContainer::from_value(value)?;
    import_container(container, config)
}

/// Import a normalized container.
pub fn import_container(
    container: TraceContainer,
    config: &ImportConfig,
) -> Result<ImportResult, ImportError> {
    TraceEventImporter::new(config.clone()).import(container)
}

/// Warning kinds in first-emission order, for operator-facing summaries.
pub fn distinct_warning_kinds(warnings: &[ImportWarning]) -> Vec<WarningKind> {
    let mut kinds = Vec::new();
    for warning in warnings {
        if !kinds.contains(&warning.kind) {
            kinds.push(warning.kind);
        }
    }
    kinds
}
