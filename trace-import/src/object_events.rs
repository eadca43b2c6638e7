//! Object lifecycle engine: explicit N/O/D records, then implicit
//! snapshot extraction from nested argument fields.

use trace_format::{Phase, TraceEvent};
use trace_model::{color_id_for_general_purpose_string, ArgDict, ArgValue, SnapshotId};

use crate::importer::{us_to_ms, TraceEventImporter};
use crate::warning::WarningKind;
use crate::ImportError;

impl TraceEventImporter {
    pub(crate) fn finish_object_events(&mut self) -> Result<(), ImportError> {
        let mut queue = std::mem::take(&mut self.object_queue);
        queue.sort_by(|a, b| {
            a.event
                .ts
                .partial_cmp(&b.event.ts)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });
        for queued in queue {
            self.process_object_event(queued.event);
        }

        let pids: Vec<i64> = self.model.processes.keys().copied().collect();
        for pid in pids {
            self.materialize_implicit_snapshots(pid)?;
        }
        Ok(())
    }

    fn process_object_event(&mut self, event: TraceEvent) {
        let Some(id) = event.scoped_id() else {
            self.warn(
                WarningKind::ObjectParseError,
                format!(
                    "object event '{}' has no id",
                    event.name.as_deref().unwrap_or("")
                ),
            );
            return;
        };
        let pid = event.pid.unwrap_or(0);
        let name = event.name.clone().unwrap_or_default();
        let category = event.cat.clone().unwrap_or_default();
        let ts = us_to_ms(event.ts);
        let color_id = color_id_for_general_purpose_string(&name);

        match event.phase() {
            Some(Phase::ObjectCreated) => {
                if let Err(err) = self
                    .model
                    .process_mut(pid)
                    .objects
                    .id_was_created(&id, &category, &name, ts, color_id)
                {
                    self.warn(WarningKind::ObjectParseError, err.to_string());
                }
            }
            Some(Phase::ObjectSnapshot) => {
                let Some(snapshot_value) =
                    event.args.as_ref().and_then(|a| a.get("snapshot")).cloned()
                else {
                    self.warn(
                        WarningKind::ObjectSnapshotParseError,
                        format!("object snapshot of '{name}' at {} has no args.snapshot", event.ts),
                    );
                    return;
                };

                // `cat` and `base_type` are control keys, not payload.
                let mut snapshot_category = category;
                let mut base_type = None;
                let mut args = ArgValue::from(&snapshot_value);
                if let Some(dict) = args.as_dict_mut() {
                    if let Some(ArgValue::String(cat)) = dict.remove("cat") {
                        snapshot_category = cat;
                    }
                    if let Some(ArgValue::String(base)) = dict.remove("base_type") {
                        base_type = Some(base);
                    }
                }

                if let Err(err) = self.model.process_mut(pid).objects.add_snapshot(
                    &id,
                    &snapshot_category,
                    &name,
                    ts,
                    args,
                    base_type,
                    color_id,
                ) {
                    self.warn(WarningKind::ObjectSnapshotParseError, err.to_string());
                }
            }
            Some(Phase::ObjectDestroyed) => {
                match self.model.process_mut(pid).objects.id_was_deleted(&id, ts) {
                    Ok(instance_id) => {
                        let typename = self
                            .model
                            .process_mut(pid)
                            .objects
                            .instance(instance_id)
                            .typename
                            .clone();
                        if !name.is_empty() && typename != name {
                            self.warn(
                                WarningKind::ObjectParseError,
                                format!(
                                    "object id {id} deleted as '{name}' but created as '{typename}'"
                                ),
                            );
                        }
                    }
                    Err(err) => self.warn(WarningKind::ObjectParseError, err.to_string()),
                }
            }
            _ => {}
        }
    }

    /// Walk the args of every explicit snapshot, lifting nested objects
    /// with a `"name/localId"` id field into their own instances.
    fn materialize_implicit_snapshots(&mut self, pid: i64) -> Result<(), ImportError> {
        let explicit_count = self
            .model
            .processes
            .get(&pid)
            .map_or(0, |p| p.objects.snapshot_count());

        for index in 0..explicit_count {
            let snapshot_id = SnapshotId(index);
            let (ts, parent_category) = {
                let objects = &self.model.processes[&pid].objects;
                let snapshot = objects.snapshot(snapshot_id);
                (
                    snapshot.ts,
                    objects.instance(snapshot.instance).category.clone(),
                )
            };
            let args = std::mem::replace(
                &mut self
                    .model
                    .process_mut(pid)
                    .objects
                    .snapshot_mut(snapshot_id)
                    .args,
                ArgValue::Null,
            );
            let args = self.lift_value(pid, ts, &parent_category, args, true)?;
            self.model
                .process_mut(pid)
                .objects
                .snapshot_mut(snapshot_id)
                .args = args;
        }
        Ok(())
    }

    /// Lift one value. Dicts carrying a string id of form `name/localId`
    /// become snapshot references; dicts and arrays recurse; everything
    /// else is a leaf.
    fn lift_value(
        &mut self,
        pid: i64,
        ts: f64,
        parent_category: &str,
        value: ArgValue,
        top_level: bool,
    ) -> Result<ArgValue, ImportError> {
        match value {
            ArgValue::Dict(mut dict) => match dict.get("id").cloned() {
                Some(ArgValue::String(raw_id)) => {
                    let Some((name, _local)) = raw_id.split_once('/') else {
                        return Err(ImportError::ImplicitSnapshotName(raw_id));
                    };
                    let name = name.to_string();
                    dict.remove("id");
                    let category = match dict.remove("cat") {
                        Some(ArgValue::String(cat)) => cat,
                        _ => parent_category.to_string(),
                    };
                    let base_type = match dict.remove("base_type") {
                        Some(ArgValue::String(base)) => Some(base),
                        _ => None,
                    };
                    let residual = self.lift_dict(pid, ts, parent_category, dict)?;
                    match self.model.process_mut(pid).objects.add_snapshot(
                        &raw_id,
                        &category,
                        &name,
                        ts,
                        ArgValue::Dict(residual),
                        base_type,
                        color_id_for_general_purpose_string(&name),
                    ) {
                        Ok(snapshot_id) => Ok(ArgValue::Snapshot(snapshot_id)),
                        Err(err) => {
                            self.warn(WarningKind::ObjectSnapshotParseError, err.to_string());
                            Ok(ArgValue::Null)
                        }
                    }
                }
                Some(_) if top_level => Err(ImportError::TopLevelSnapshotId),
                _ => Ok(ArgValue::Dict(self.lift_dict(pid, ts, parent_category, dict)?)),
            },
            ArgValue::Array(items) => {
                let mut lifted = Vec::with_capacity(items.len());
                for item in items {
                    lifted.push(self.lift_value(pid, ts, parent_category, item, false)?);
                }
                Ok(ArgValue::Array(lifted))
            }
            leaf => Ok(leaf),
        }
    }

    fn lift_dict(
        &mut self,
        pid: i64,
        ts: f64,
        parent_category: &str,
        dict: ArgDict,
    ) -> Result<ArgDict, ImportError> {
        let mut lifted = ArgDict::new();
        for (key, value) in dict {
            lifted.insert(key, self.lift_value(pid, ts, parent_category, value, false)?);
        }
        Ok(lifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    use crate::config::ImportConfig;
    use crate::importer::QueuedEvent;

    fn importer() -> TraceEventImporter {
        TraceEventImporter::new(ImportConfig::default())
    }

    fn object_event(ph: &str, name: &str, id: &str, ts: f64) -> TraceEvent {
        let mut event = TraceEvent::builder()
            .ph(ph.to_string())
            .name(name.to_string())
            .pid(1)
            .tid(1)
            .ts(ts)
            .build();
        event.id = Some(id.to_string());
        event.cat = Some("disabled-by-default-cc".to_string());
        event
    }

    fn queue(imp: &mut TraceEventImporter, events: Vec<TraceEvent>) {
        for (seq, event) in events.into_iter().enumerate() {
            imp.object_queue.push(QueuedEvent { seq, event });
        }
    }

    #[rstest]
    fn explicit_lifecycle_assembles() {
        let mut imp = importer();
        let mut snapshot = object_event("O", "Foo", "0x1", 1.0);
        snapshot.args = Some(json!({"snapshot": {"size": 3}}));
        queue(
            &mut imp,
            vec![
                object_event("N", "Foo", "0x1", 0.0),
                snapshot,
                object_event("D", "Foo", "0x1", 2.0),
            ],
        );
        imp.finish_object_events().unwrap();
        let objects = &imp.model.processes[&1].objects;
        assert_eq!(objects.instance_count(), 1);
        assert_eq!(objects.snapshot_count(), 1);
        let instance = &objects.instances()[0];
        assert_eq!(instance.typename, "Foo");
        assert_eq!(instance.deletion_ts, Some(0.002));
        assert!(imp.warnings.is_empty());
    }

    #[rstest]
    fn snapshot_without_args_snapshot_warns() {
        let mut imp = importer();
        let mut snapshot = object_event("O", "Foo", "0x1", 1.0);
        snapshot.args = Some(json!({"other": 1}));
        queue(&mut imp, vec![snapshot]);
        imp.finish_object_events().unwrap();
        assert_eq!(imp.warnings[0].kind, WarningKind::ObjectSnapshotParseError);
    }

    #[rstest]
    fn snapshot_cat_and_base_type_are_control_keys() {
        let mut imp = importer();
        let mut snapshot = object_event("O", "PictureImpl", "0x1", 1.0);
        snapshot.args = Some(json!({"snapshot": {
            "cat": "cc",
            "base_type": "Picture",
            "width": 10
        }}));
        queue(&mut imp, vec![snapshot]);
        imp.finish_object_events().unwrap();
        let objects = &imp.model.processes[&1].objects;
        let instance = &objects.instances()[0];
        assert_eq!(instance.category, "cc");
        assert_eq!(instance.base_type.as_deref(), Some("Picture"));
        let args = objects.snapshots()[0].args.as_dict().unwrap();
        assert!(args.contains_key("width"));
        assert!(!args.contains_key("cat"));
        assert!(!args.contains_key("base_type"));
    }

    #[rstest]
    fn delete_with_mismatched_name_warns_but_deletes() {
        let mut imp = importer();
        queue(
            &mut imp,
            vec![
                object_event("N", "Foo", "0x1", 0.0),
                object_event("D", "Bar", "0x1", 2.0),
            ],
        );
        imp.finish_object_events().unwrap();
        let objects = &imp.model.processes[&1].objects;
        assert!(objects.instances()[0].deletion_ts.is_some());
        assert_eq!(imp.warnings[0].kind, WarningKind::ObjectParseError);
    }

    #[rstest]
    fn double_create_warns() {
        let mut imp = importer();
        queue(
            &mut imp,
            vec![
                object_event("N", "Foo", "0x1", 0.0),
                object_event("N", "Foo", "0x1", 1.0),
            ],
        );
        imp.finish_object_events().unwrap();
        assert_eq!(imp.warnings[0].kind, WarningKind::ObjectParseError);
        assert_eq!(imp.model.processes[&1].objects.instance_count(), 1);
    }

    #[rstest]
    fn implicit_snapshot_lifts_nested_id() {
        let mut imp = importer();
        let mut snapshot = object_event("O", "Foo", "0x1", 1.0);
        snapshot.args = Some(json!({"snapshot": {
            "child": {"id": "Bar/y", "field": 42}
        }}));
        queue(
            &mut imp,
            vec![
                object_event("N", "Foo", "0x1", 0.0),
                snapshot,
                object_event("D", "Foo", "0x1", 2.0),
            ],
        );
        imp.finish_object_events().unwrap();

        let objects = &imp.model.processes[&1].objects;
        assert_eq!(objects.instance_count(), 2);
        assert_eq!(objects.snapshot_count(), 2);

        let bar = objects
            .instances()
            .iter()
            .find(|i| i.typename == "Bar")
            .unwrap();
        assert!(bar.implicitly_created);
        assert_eq!(bar.id, "Bar/y");
        assert_eq!(bar.creation_ts, 0.001);

        let bar_snapshot = objects.snapshot(bar.snapshots[0]);
        let bar_args = bar_snapshot.args.as_dict().unwrap();
        assert_eq!(bar_args["field"], ArgValue::Number(42.0));
        assert!(!bar_args.contains_key("id"));

        // The containing field now references the lifted snapshot.
        let foo_snapshot = &objects.snapshots()[0];
        assert_eq!(
            foo_snapshot.args.as_dict().unwrap()["child"],
            ArgValue::Snapshot(bar.snapshots[0])
        );
    }

    #[rstest]
    fn top_level_snapshot_with_liftable_id_becomes_reference() {
        let mut imp = importer();
        let mut snapshot = object_event("O", "Foo", "0x1", 1.0);
        snapshot.args = Some(json!({"snapshot": {"id": "Bar/y", "field": 42}}));
        queue(
            &mut imp,
            vec![object_event("N", "Foo", "0x1", 0.0), snapshot],
        );
        imp.finish_object_events().unwrap();
        let objects = &imp.model.processes[&1].objects;
        assert_eq!(objects.instance_count(), 2);
        assert!(matches!(
            objects.snapshots()[0].args,
            ArgValue::Snapshot(_)
        ));
    }

    #[rstest]
    fn implicit_id_without_slash_is_fatal() {
        let mut imp = importer();
        let mut snapshot = object_event("O", "Foo", "0x1", 1.0);
        snapshot.args = Some(json!({"snapshot": {"child": {"id": "nopattern"}}}));
        queue(&mut imp, vec![snapshot]);
        assert!(matches!(
            imp.finish_object_events(),
            Err(ImportError::ImplicitSnapshotName(_))
        ));
    }

    #[rstest]
    fn arrays_are_walked_element_wise() {
        let mut imp = importer();
        let mut snapshot = object_event("O", "Foo", "0x1", 1.0);
        snapshot.args = Some(json!({"snapshot": {
            "children": [{"id": "Bar/a"}, {"id": "Bar/b"}]
        }}));
        queue(&mut imp, vec![snapshot]);
        imp.finish_object_events().unwrap();
        let objects = &imp.model.processes[&1].objects;
        // Foo plus two lifted Bars.
        assert_eq!(objects.instance_count(), 3);
    }
}
