//! Model-wide stack frame table.
//!
//! Frames are keyed by fully-qualified id: raw ids get a scope prefix
//! (`g` for trace-global frames, `p<pid>:` for process-local ones) so
//! tables from different scopes can share one registry.

use std::collections::BTreeMap;

use crate::ModelError;

#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Fully-qualified id, unique across the model.
    pub id: String,
    /// Fully-qualified parent id.
    pub parent: Option<String>,
    pub title: String,
    pub category: Option<String>,
    pub color_id: u32,
    pub source_info: Option<String>,
}

#[derive(Debug, Default)]
pub struct StackFrameRegistry {
    frames: BTreeMap<String, StackFrame>,
}

impl StackFrameRegistry {
    pub fn new() -> StackFrameRegistry {
        StackFrameRegistry::default()
    }

    pub fn insert(&mut self, frame: StackFrame) -> Result<(), ModelError> {
        if self.frames.contains_key(&frame.id) {
            return Err(ModelError::DuplicateStackFrame(frame.id));
        }
        self.frames.insert(frame.id.clone(), frame);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.frames.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&StackFrame> {
        self.frames.get(id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StackFrame> {
        self.frames.values()
    }

    /// Link `id` under `parent`. Both must exist, and the link must not
    /// close a cycle.
    pub fn set_parent(&mut self, id: &str, parent: &str) -> Result<(), ModelError> {
        if !self.frames.contains_key(parent) {
            return Err(ModelError::MissingStackFrame(parent.to_string()));
        }
        if !self.frames.contains_key(id) {
            return Err(ModelError::MissingStackFrame(id.to_string()));
        }
        let mut cursor = Some(parent.to_string());
        while let Some(current) = cursor {
            if current == id {
                return Err(ModelError::StackFrameCycle(id.to_string()));
            }
            cursor = self.frames.get(&current).and_then(|f| f.parent.clone());
        }
        if let Some(frame) = self.frames.get_mut(id) {
            frame.parent = Some(parent.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn frame(id: &str, title: &str) -> StackFrame {
        StackFrame {
            id: id.into(),
            parent: None,
            title: title.into(),
            category: None,
            color_id: 0,
            source_info: None,
        }
    }

    #[rstest]
    fn duplicate_ids_are_rejected() {
        let mut registry = StackFrameRegistry::new();
        registry.insert(frame("g1", "main")).unwrap();
        assert!(matches!(
            registry.insert(frame("g1", "other")),
            Err(ModelError::DuplicateStackFrame(_))
        ));
    }

    #[rstest]
    fn parent_links_reject_cycles() {
        let mut registry = StackFrameRegistry::new();
        registry.insert(frame("g1", "a")).unwrap();
        registry.insert(frame("g2", "b")).unwrap();
        registry.set_parent("g2", "g1").unwrap();
        assert!(matches!(
            registry.set_parent("g1", "g2"),
            Err(ModelError::StackFrameCycle(_))
        ));
    }

    #[rstest]
    fn missing_parent_is_an_error() {
        let mut registry = StackFrameRegistry::new();
        registry.insert(frame("g1", "a")).unwrap();
        assert!(matches!(
            registry.set_parent("g1", "g9"),
            Err(ModelError::MissingStackFrame(_))
        ));
    }
}
