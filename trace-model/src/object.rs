//! Object lifecycle arena.
//!
//! Instances and snapshots live in per-process arenas and reference each
//! other by stable integer ids, never by owning pointers: snapshot args
//! can reference other snapshots, and the resulting graph is cyclic in
//! general.

use std::collections::HashMap;

use crate::args::ArgValue;
use crate::bounds::Bounds;
use crate::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub usize);

/// A tracked domain object: one live range of an id within a process.
#[derive(Debug, Clone)]
pub struct ObjectInstance {
    pub id: String,
    pub category: String,
    pub typename: String,
    pub base_type: Option<String>,
    /// Milliseconds.
    pub creation_ts: f64,
    /// True when the instance was synthesized by a snapshot that arrived
    /// before any explicit creation record.
    pub implicitly_created: bool,
    pub deletion_ts: Option<f64>,
    pub color_id: u32,
    pub snapshots: Vec<SnapshotId>,
}

impl ObjectInstance {
    fn is_live_at(&self, ts: f64) -> bool {
        self.creation_ts <= ts && self.deletion_ts.map_or(true, |d| ts <= d)
    }
}

/// A dated args bag belonging to exactly one instance.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    pub instance: InstanceId,
    pub ts: f64,
    pub args: ArgValue,
}

/// Per-process arena of instances and snapshots.
#[derive(Debug, Default)]
pub struct ObjectCollection {
    instances: Vec<ObjectInstance>,
    snapshots: Vec<ObjectSnapshot>,
    by_id: HashMap<String, Vec<InstanceId>>,
}

impl ObjectCollection {
    pub fn new() -> ObjectCollection {
        ObjectCollection::default()
    }

    pub fn instances(&self) -> &[ObjectInstance] {
        &self.instances
    }

    pub fn instance(&self, id: InstanceId) -> &ObjectInstance {
        &self.instances[id.0]
    }

    pub fn snapshots(&self) -> &[ObjectSnapshot] {
        &self.snapshots
    }

    pub fn snapshot(&self, id: SnapshotId) -> &ObjectSnapshot {
        &self.snapshots[id.0]
    }

    pub fn snapshot_mut(&mut self, id: SnapshotId) -> &mut ObjectSnapshot {
        &mut self.snapshots[id.0]
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    fn latest_for_id(&self, id: &str) -> Option<InstanceId> {
        self.by_id.get(id).and_then(|v| v.last().copied())
    }

    /// Explicit creation (`N`). Fails when the id already has a live
    /// instance, or when the new live range would start inside an earlier
    /// one.
    pub fn id_was_created(
        &mut self,
        id: &str,
        category: &str,
        typename: &str,
        ts: f64,
        color_id: u32,
    ) -> Result<InstanceId, ModelError> {
        if let Some(latest) = self.latest_for_id(id) {
            let latest = self.instance(latest);
            match latest.deletion_ts {
                None => return Err(ModelError::ObjectIdInUse(id.to_string())),
                Some(deleted) if ts < deleted => {
                    return Err(ModelError::ObjectCreationOverlap(id.to_string()))
                }
                Some(_) => {}
            }
        }
        let instance_id = InstanceId(self.instances.len());
        self.instances.push(ObjectInstance {
            id: id.to_string(),
            category: category.to_string(),
            typename: typename.to_string(),
            base_type: None,
            creation_ts: ts,
            implicitly_created: false,
            deletion_ts: None,
            color_id,
            snapshots: Vec::new(),
        });
        self.by_id
            .entry(id.to_string())
            .or_default()
            .push(instance_id);
        Ok(instance_id)
    }

    /// Snapshot (`O`). Attaches to the instance live at `ts`, synthesizing
    /// an implicit instance when the id has none.
    #[allow(clippy::too_many_arguments)]
    pub fn add_snapshot(
        &mut self,
        id: &str,
        category: &str,
        typename: &str,
        ts: f64,
        args: ArgValue,
        base_type: Option<String>,
        color_id: u32,
    ) -> Result<SnapshotId, ModelError> {
        let instance_id = match self.latest_for_id(id) {
            Some(latest) if self.instance(latest).is_live_at(ts) => latest,
            Some(latest) if self.instance(latest).deletion_ts.is_none() => {
                // Live range exists but starts after ts.
                return Err(ModelError::SnapshotOutsideLifetime(id.to_string()));
            }
            _ => {
                let instance_id = InstanceId(self.instances.len());
                self.instances.push(ObjectInstance {
                    id: id.to_string(),
                    category: category.to_string(),
                    typename: typename.to_string(),
                    base_type: base_type.clone(),
                    creation_ts: ts,
                    implicitly_created: true,
                    deletion_ts: None,
                    color_id,
                    snapshots: Vec::new(),
                });
                self.by_id
                    .entry(id.to_string())
                    .or_default()
                    .push(instance_id);
                instance_id
            }
        };

        let snapshot_id = SnapshotId(self.snapshots.len());
        self.snapshots.push(ObjectSnapshot {
            instance: instance_id,
            ts,
            args,
        });
        let instance = &mut self.instances[instance_id.0];
        if instance.typename.is_empty() {
            instance.typename = typename.to_string();
            instance.color_id = color_id;
        }
        if instance.base_type.is_none() {
            instance.base_type = base_type;
        }
        instance.snapshots.push(snapshot_id);
        Ok(snapshot_id)
    }

    /// Deletion (`D`). Stamps `deletion_ts` on the latest live instance.
    pub fn id_was_deleted(&mut self, id: &str, ts: f64) -> Result<InstanceId, ModelError> {
        let latest = self
            .latest_for_id(id)
            .ok_or_else(|| ModelError::NoLiveObject(id.to_string()))?;
        let instance = &mut self.instances[latest.0];
        if instance.deletion_ts.is_some() {
            return Err(ModelError::NoLiveObject(id.to_string()));
        }
        instance.deletion_ts = Some(ts.max(instance.creation_ts));
        Ok(latest)
    }

    /// Mark every still-live instance deleted at `max_ts`.
    pub fn cleanup_undeleted(&mut self, max_ts: f64) {
        for instance in &mut self.instances {
            if instance.deletion_ts.is_none() {
                instance.deletion_ts = Some(max_ts.max(instance.creation_ts));
            }
        }
    }

    pub fn shift_timestamps(&mut self, delta: f64) {
        for instance in &mut self.instances {
            instance.creation_ts += delta;
            if let Some(d) = instance.deletion_ts.as_mut() {
                *d += delta;
            }
        }
        for snapshot in &mut self.snapshots {
            snapshot.ts += delta;
        }
    }

    pub fn add_bounds(&self, bounds: &mut Bounds) {
        for instance in &self.instances {
            bounds.add_value(instance.creation_ts);
            if let Some(d) = instance.deletion_ts {
                bounds.add_value(d);
            }
        }
        for snapshot in &self.snapshots {
            bounds.add_value(snapshot.ts);
        }
    }
}
