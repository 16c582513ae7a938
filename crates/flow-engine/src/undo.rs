//! Edit history as compressed graph descriptions
//!
//! The engine records a [`GraphDescription`] after every structural edit.
//! Each entry is stored as zstd-compressed JSON; undo and redo move a
//! cursor through the entries and hand back the description to restore.

use std::collections::VecDeque;

use crate::description::GraphDescription;
use crate::error::{FlowEngineError, Result};

const COMPRESSION_LEVEL: i32 = 3;

/// Bounded history of graph descriptions
pub struct UndoStack {
    entries: VecDeque<Vec<u8>>,
    cursor: usize,
    capacity: usize,
}

impl UndoStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: 0,
            capacity: capacity.max(1),
        }
    }

    /// Record the graph as it is after an edit
    ///
    /// Discards any redo history. Recording a description identical to the
    /// current entry is a no-op.
    pub fn record(&mut self, description: &GraphDescription) -> Result<()> {
        let compressed = compress(description)?;
        if self.entries.get(self.cursor) == Some(&compressed) {
            return Ok(());
        }

        self.entries.truncate(self.cursor + 1);
        self.entries.push_back(compressed);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len() - 1;
        Ok(())
    }

    /// Step back one edit, returning the description to restore
    pub fn undo(&mut self) -> Option<Result<GraphDescription>> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        Some(self.decompress(self.cursor))
    }

    /// Step forward one edit, returning the description to restore
    pub fn redo(&mut self) -> Option<Result<GraphDescription>> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        Some(self.decompress(self.cursor))
    }

    pub fn current(&self) -> Option<Result<GraphDescription>> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.decompress(self.cursor))
        }
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything, then record `description` as the only entry
    pub fn reset(&mut self, description: &GraphDescription) -> Result<()> {
        self.entries.clear();
        self.cursor = 0;
        self.record(description)
    }

    /// Total compressed bytes held
    pub fn compressed_size(&self) -> usize {
        self.entries.iter().map(|e| e.len()).sum()
    }

    fn decompress(&self, index: usize) -> Result<GraphDescription> {
        let compressed = self
            .entries
            .get(index)
            .ok_or_else(|| FlowEngineError::invariant("undo cursor out of range"))?;
        let json = zstd::decode_all(&compressed[..])
            .map_err(|e| FlowEngineError::Compression(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(100)
    }
}

fn compress(description: &GraphDescription) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(description)?;
    zstd::encode_all(&json[..], COMPRESSION_LEVEL)
        .map_err(|e| FlowEngineError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::SCHEMA_VERSION;

    fn named(name: &str) -> GraphDescription {
        GraphDescription {
            schema_version: SCHEMA_VERSION.to_string(),
            id: "g".into(),
            name: name.into(),
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    #[test]
    fn test_undo_redo_cursor() {
        let mut stack = UndoStack::new(10);
        stack.record(&named("empty")).unwrap();
        stack.record(&named("one node")).unwrap();
        stack.record(&named("two nodes")).unwrap();

        assert_eq!(stack.undo().unwrap().unwrap().name, "one node");
        assert_eq!(stack.undo().unwrap().unwrap().name, "empty");
        assert!(stack.undo().is_none());
        assert_eq!(stack.redo().unwrap().unwrap().name, "one node");
        assert!(stack.can_redo());
    }

    #[test]
    fn test_record_discards_redo_history() {
        let mut stack = UndoStack::new(10);
        stack.record(&named("a")).unwrap();
        stack.record(&named("b")).unwrap();
        stack.undo();
        stack.record(&named("c")).unwrap();
        assert!(!stack.can_redo());
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.current().unwrap().unwrap().name, "c");
    }

    #[test]
    fn test_identical_record_is_ignored() {
        let mut stack = UndoStack::new(10);
        stack.record(&named("a")).unwrap();
        stack.record(&named("a")).unwrap();
        assert_eq!(stack.len(), 1);
        assert!(stack.compressed_size() > 0);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut stack = UndoStack::new(3);
        for i in 0..5 {
            stack.record(&named(&format!("edit {}", i))).unwrap();
        }
        assert_eq!(stack.len(), 3);
        stack.undo();
        assert_eq!(stack.undo().unwrap().unwrap().name, "edit 2");
        assert!(!stack.can_undo());

        stack.reset(&named("fresh")).unwrap();
        assert_eq!(stack.len(), 1);
    }
}
