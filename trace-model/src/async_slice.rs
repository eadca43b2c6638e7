//! Asynchronous slices: multi-thread operations assembled from begin /
//! step / end records.

use crate::args::ArgDict;
use crate::bounds::Bounds;
use crate::thread::ThreadKey;

/// One assembled asynchronous operation, possibly with nested steps.
///
/// Unlike synchronous slices, async slices own their sub-slices directly:
/// the hierarchy is fixed at assembly time and never rebuilt.
#[derive(Debug, Clone)]
pub struct AsyncSlice {
    pub category: String,
    pub title: String,
    pub color_id: u32,
    /// Start timestamp, milliseconds.
    pub start: f64,
    pub duration: f64,
    pub id: String,
    pub args: ArgDict,
    pub start_thread: ThreadKey,
    pub end_thread: ThreadKey,
    pub start_stack_frame: Option<String>,
    pub end_stack_frame: Option<String>,
    pub thread_start: Option<f64>,
    pub thread_duration: Option<f64>,
    /// Set when begin/end matching failed and the bounds were synthesized.
    pub error: Option<String>,
    /// True for slices with no enclosing async parent.
    pub is_top_level: bool,
    pub sub_slices: Vec<AsyncSlice>,
}

impl AsyncSlice {
    pub fn new(
        category: String,
        title: String,
        color_id: u32,
        start: f64,
        id: String,
        thread: ThreadKey,
    ) -> AsyncSlice {
        AsyncSlice {
            category,
            title,
            color_id,
            start,
            duration: 0.0,
            id,
            args: ArgDict::new(),
            start_thread: thread,
            end_thread: thread,
            start_stack_frame: None,
            end_stack_frame: None,
            thread_start: None,
            thread_duration: None,
            error: None,
            is_top_level: false,
            sub_slices: Vec::new(),
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn shift_timestamps(&mut self, delta: f64) {
        self.start += delta;
        for sub in &mut self.sub_slices {
            sub.shift_timestamps(delta);
        }
    }

    pub fn add_bounds(&self, bounds: &mut Bounds) {
        bounds.add_range(self.start, self.end());
        for sub in &self.sub_slices {
            sub.add_bounds(bounds);
        }
    }
}

/// Per-thread container for top-level async slices.
#[derive(Debug, Default)]
pub struct AsyncSliceGroup {
    pub slices: Vec<AsyncSlice>,
}

impl AsyncSliceGroup {
    pub fn new() -> AsyncSliceGroup {
        AsyncSliceGroup::default()
    }

    pub fn push(&mut self, slice: AsyncSlice) {
        self.slices.push(slice);
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn shift_timestamps(&mut self, delta: f64) {
        for slice in &mut self.slices {
            slice.shift_timestamps(delta);
        }
    }

    pub fn add_bounds(&self, bounds: &mut Bounds) {
        for slice in &self.slices {
            slice.add_bounds(bounds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn bounds_include_sub_slices() {
        let key = ThreadKey { pid: 1, tid: 2 };
        let mut slice = AsyncSlice::new("c".into(), "t".into(), 0, 5.0, "7".into(), key);
        slice.duration = 10.0;
        let mut sub = AsyncSlice::new("c".into(), "t:step".into(), 0, 6.0, "7".into(), key);
        sub.duration = 2.0;
        slice.sub_slices.push(sub);

        let mut bounds = Bounds::new();
        slice.add_bounds(&mut bounds);
        assert_eq!(bounds.min, Some(5.0));
        assert_eq!(bounds.max, Some(15.0));

        slice.shift_timestamps(-5.0);
        assert_eq!(slice.start, 0.0);
        assert_eq!(slice.sub_slices[0].start, 1.0);
    }
}
