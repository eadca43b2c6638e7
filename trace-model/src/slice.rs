//! Synchronous slices and the per-thread slice group.

use crate::args::ArgDict;
use crate::bounds::Bounds;

/// Index of a slice within its owning [`SliceGroup`].
pub type SliceIndex = usize;

/// A time interval on a thread.
///
/// A slice without a duration is *open*: its `B` record has been seen but
/// its `E` has not. Open slices form a stack ordered by start time.
#[derive(Debug, Clone)]
pub struct Slice {
    pub category: String,
    pub title: String,
    pub color_id: u32,
    /// Start timestamp, milliseconds.
    pub start: f64,
    /// Wall duration in milliseconds; `None` while open.
    pub duration: Option<f64>,
    /// Thread-clock start, milliseconds.
    pub thread_start: Option<f64>,
    /// Thread-clock duration, milliseconds.
    pub thread_duration: Option<f64>,
    pub args: ArgDict,
    pub args_stripped: bool,
    /// Fully-qualified stack frame ids.
    pub start_stack_frame: Option<String>,
    pub end_stack_frame: Option<String>,
    pub bind_id: Option<String>,
    /// Indices into the model's flow event list.
    pub in_flow_events: Vec<usize>,
    pub out_flow_events: Vec<usize>,
    /// Nesting structure, rebuilt by [`SliceGroup::create_sub_slices`].
    pub parent_slice: Option<SliceIndex>,
    pub sub_slices: Vec<SliceIndex>,
}

impl Slice {
    pub fn new(category: String, title: String, color_id: u32, start: f64) -> Slice {
        Slice {
            category,
            title,
            color_id,
            start,
            duration: None,
            thread_start: None,
            thread_duration: None,
            args: ArgDict::new(),
            args_stripped: false,
            start_stack_frame: None,
            end_stack_frame: None,
            bind_id: None,
            in_flow_events: Vec::new(),
            out_flow_events: Vec::new(),
            parent_slice: None,
            sub_slices: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.duration.is_none()
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration.unwrap_or(0.0)
    }
}

/// Per-thread container of synchronous slices.
///
/// Maintains the stack of open slices during import and the greatest
/// timestamp observed so far, which the importer uses to reject records
/// that move backward in time.
#[derive(Debug, Default)]
pub struct SliceGroup {
    slices: Vec<Slice>,
    open_stack: Vec<SliceIndex>,
    last_seen_ts: Option<f64>,
}

impl SliceGroup {
    pub fn new() -> SliceGroup {
        SliceGroup::default()
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn slices_mut(&mut self) -> &mut Vec<Slice> {
        &mut self.slices
    }

    pub fn get(&self, index: SliceIndex) -> Option<&Slice> {
        self.slices.get(index)
    }

    pub fn get_mut(&mut self, index: SliceIndex) -> Option<&mut Slice> {
        self.slices.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn open_slice_count(&self) -> usize {
        self.open_stack.len()
    }

    /// The most recently opened, still-open slice.
    pub fn top_open_slice(&self) -> Option<&Slice> {
        self.open_stack.last().map(|&i| &self.slices[i])
    }

    /// Greatest timestamp pushed into this group so far.
    pub fn last_seen_ts(&self) -> Option<f64> {
        self.last_seen_ts
    }

    fn note_ts(&mut self, ts: f64) {
        self.last_seen_ts = Some(self.last_seen_ts.map_or(ts, |m| m.max(ts)));
    }

    /// Open a slice at `start` and push it onto the open stack.
    pub fn begin_slice(&mut self, mut slice: Slice) -> SliceIndex {
        self.note_ts(slice.start);
        slice.duration = None;
        let index = self.slices.len();
        self.slices.push(slice);
        self.open_stack.push(index);
        index
    }

    /// Close the top open slice at `ts`. Returns the closed slice's index,
    /// or `None` when no slice is open.
    pub fn end_slice(&mut self, ts: f64, thread_ts: Option<f64>) -> Option<SliceIndex> {
        let index = self.open_stack.pop()?;
        self.note_ts(ts);
        let slice = &mut self.slices[index];
        slice.duration = Some(ts - slice.start);
        if let (Some(start), Some(end)) = (slice.thread_start, thread_ts) {
            slice.thread_duration = Some(end - start);
        }
        Some(index)
    }

    /// Push an already-closed slice (`X` records, degenerate instants).
    pub fn push_complete_slice(&mut self, mut slice: Slice, duration: f64) -> SliceIndex {
        self.note_ts(slice.start);
        self.note_ts(slice.start + duration);
        slice.duration = Some(duration);
        let index = self.slices.len();
        self.slices.push(slice);
        index
    }

    /// Close every still-open slice at `end_ts` (clamped so durations stay
    /// non-negative). Invoked once world bounds are known.
    pub fn auto_close_open_slices(&mut self, end_ts: f64) {
        for index in self.open_stack.drain(..) {
            let slice = &mut self.slices[index];
            slice.duration = Some((end_ts - slice.start).max(0.0));
        }
    }

    /// Most deeply nested slice containing `ts`. Open slices count as
    /// containing everything at or after their start.
    pub fn find_slice_at_ts(&self, ts: f64) -> Option<SliceIndex> {
        let mut best: Option<SliceIndex> = None;
        for (index, slice) in self.slices.iter().enumerate() {
            let contains = match slice.duration {
                Some(d) => slice.start <= ts && ts <= slice.start + d,
                None => slice.start <= ts,
            };
            if !contains {
                continue;
            }
            match best {
                Some(b) if self.slices[b].start > slice.start => {}
                _ => best = Some(index),
            }
        }
        best
    }

    /// First slice starting at or after `ts`; ties resolve to trace-buffer
    /// order (lowest index).
    pub fn find_next_slice_after(&self, ts: f64) -> Option<SliceIndex> {
        let mut best: Option<SliceIndex> = None;
        for (index, slice) in self.slices.iter().enumerate() {
            if slice.start < ts {
                continue;
            }
            match best {
                Some(b)
                    if self.slices[b].start < slice.start
                        || (self.slices[b].start == slice.start && b < index) => {}
                _ => best = Some(index),
            }
        }
        best
    }

    /// Rebuild the nesting rows from slice intervals.
    pub fn create_sub_slices(&mut self) {
        for slice in &mut self.slices {
            slice.parent_slice = None;
            slice.sub_slices.clear();
        }
        let mut order: Vec<SliceIndex> = (0..self.slices.len()).collect();
        order.sort_by(|&a, &b| {
            let (sa, sb) = (&self.slices[a], &self.slices[b]);
            sa.start
                .partial_cmp(&sb.start)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    sb.end()
                        .partial_cmp(&sa.end())
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.cmp(&b))
        });

        let mut stack: Vec<SliceIndex> = Vec::new();
        for index in order {
            let (start, end) = (self.slices[index].start, self.slices[index].end());
            while let Some(&top) = stack.last() {
                if self.slices[top].end() < end || self.slices[top].end() < start {
                    stack.pop();
                } else {
                    break;
                }
            }
            if let Some(&parent) = stack.last() {
                if parent != index {
                    self.slices[index].parent_slice = Some(parent);
                    self.slices[parent].sub_slices.push(index);
                }
            }
            stack.push(index);
        }
    }

    pub fn shift_timestamps(&mut self, delta: f64) {
        for slice in &mut self.slices {
            slice.start += delta;
        }
        if let Some(ts) = self.last_seen_ts {
            self.last_seen_ts = Some(ts + delta);
        }
    }

    pub fn add_bounds(&self, bounds: &mut Bounds) {
        for slice in &self.slices {
            bounds.add_value(slice.start);
            if let Some(d) = slice.duration {
                bounds.add_value(slice.start + d);
            }
        }
    }
}
