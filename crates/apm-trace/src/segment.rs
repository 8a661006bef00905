// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Segments are the nodes of a trace tree.
//!
//! Segments live in an arena owned by their [`crate::trace::Trace`] and refer
//! to each other by index. The parent link is a non-owning back reference;
//! ownership flows strictly root to children, so the tree cannot form cycles
//! and serialization never chases pointers.

use serde::Serialize;

/// Index of a segment inside its trace's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SegmentId(pub(crate) u32);

impl SegmentId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node in a trace tree.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    /// Name assigned by the instrumentation that created the segment.
    pub name: String,
    /// Exclusive duration of this unit of work, in milliseconds.
    pub duration_ms: f64,
    /// Number of times this unit of work ran.
    pub call_count: u64,
    #[serde(skip)]
    pub(crate) parent: Option<SegmentId>,
    pub(crate) children: Vec<SegmentId>,
}

impl Segment {
    pub(crate) fn new(name: &str, parent: Option<SegmentId>) -> Self {
        Segment {
            name: name.to_string(),
            duration_ms: 0.0,
            call_count: 1,
            parent,
            children: Vec::new(),
        }
    }

    /// The segment's parent, if it is not the root.
    pub fn parent(&self) -> Option<SegmentId> {
        self.parent
    }

    /// Ids of the segment's children, in creation order.
    pub fn children(&self) -> &[SegmentId] {
        &self.children
    }
}
