//! Ordered finalization pipeline. Each step reads the results of the
//! previous one; the sequence is a hard dependency chain.

use tracing::debug;

use crate::importer::TraceEventImporter;

impl TraceEventImporter {
    pub(crate) fn finalize(&mut self) {
        debug!("finalizing model");
        self.model.sort_samples();

        // First bounds pass only exists to learn where the world ends so
        // dangling slices can be closed there.
        self.model.update_bounds();
        if let Some(max) = self.model.bounds.max {
            self.model.auto_close_open_slices(max);
        }
        self.model.update_bounds();

        if self.config.shift_world_to_zero {
            self.model.shift_world_to_zero();
        }

        self.model.create_sub_slices();

        if self.config.prune_empty_containers {
            self.model.prune_empty_containers();
        }

        self.model.build_flow_event_interval_tree();
        self.model.cleanup_undeleted_objects();
        self.model.sort_memory_dumps();
        self.model.sort_interaction_records();
        self.model.sort_alerts();
        self.model.build_event_indices();
    }
}
