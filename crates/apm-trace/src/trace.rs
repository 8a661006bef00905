// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! A trace is the segment tree captured for one transaction.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::warn;

use crate::segment::{Segment, SegmentId};

/// Default cap on stored segments per trace.
///
/// Instrumentation can create far more segments than are useful to ship; only
/// the first `max_segments` are retained and the total seen is tracked so the
/// overflow can be surfaced at harvest time.
pub const DEFAULT_MAX_SEGMENTS: usize = 3000;

/// The segment tree recorded for one transaction.
///
/// Owned by exactly one [`crate::transaction::Transaction`]. The duration is
/// settable independently of wall clock since some traces are finalized
/// asynchronously.
#[derive(Debug, Clone)]
pub struct Trace {
    segments: Vec<Segment>,
    root: SegmentId,
    duration_ms: Option<f64>,
    segments_seen: usize,
    max_segments: usize,
    /// Attributes recorded by user code.
    pub custom_attributes: HashMap<String, Value>,
    /// Attributes recorded by the agent itself.
    pub agent_attributes: HashMap<String, Value>,
}

impl Trace {
    /// Creates a trace with a single root segment.
    pub fn new(root_name: &str, max_segments: usize) -> Self {
        Trace {
            segments: vec![Segment::new(root_name, None)],
            root: SegmentId(0),
            duration_ms: None,
            segments_seen: 1,
            max_segments,
            custom_attributes: HashMap::new(),
            agent_attributes: HashMap::new(),
        }
    }

    pub fn root(&self) -> SegmentId {
        self.root
    }

    /// Adds a child segment under `parent`.
    ///
    /// Returns `None` once the stored-segment cap is reached; the creation is
    /// still counted in [`Trace::segments_seen`] and the first overflow logs a
    /// warning.
    pub fn add_segment(&mut self, parent: SegmentId, name: &str) -> Option<SegmentId> {
        self.segments_seen += 1;
        if self.segments.len() >= self.max_segments {
            if self.segments_seen == self.max_segments + 1 {
                warn!(
                    "trace segment limit of {} reached, further segments will be dropped",
                    self.max_segments
                );
            }
            return None;
        }
        let id = SegmentId(self.segments.len() as u32);
        self.segments.push(Segment::new(name, Some(parent)));
        self.segments[parent.index()].children.push(id);
        Some(id)
    }

    pub fn segment(&self, id: SegmentId) -> &Segment {
        &self.segments[id.index()]
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> &mut Segment {
        &mut self.segments[id.index()]
    }

    /// Number of segments actually stored.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of segment creations observed, including dropped ones.
    pub fn segments_seen(&self) -> usize {
        self.segments_seen
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Whether more segments were created than the trace could retain.
    pub fn exceeded_segment_limit(&self) -> bool {
        self.segments_seen > self.max_segments
    }

    /// Overrides the trace duration, for traces finalized off the wall clock.
    pub fn set_duration_ms(&mut self, duration_ms: f64) {
        self.duration_ms = Some(duration_ms);
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.duration_ms
    }

    /// Serializes the segment tree into a nested JSON structure.
    pub fn to_payload(&self) -> Value {
        json!({
            "duration_ms": self.duration_ms,
            "custom_attributes": self.custom_attributes,
            "agent_attributes": self.agent_attributes,
            "root": self.node_payload(self.root),
        })
    }

    fn node_payload(&self, id: SegmentId) -> Value {
        let segment = self.segment(id);
        let children: Vec<Value> = segment
            .children
            .iter()
            .map(|child| self.node_payload(*child))
            .collect();
        json!({
            "name": segment.name,
            "duration_ms": segment.duration_ms,
            "call_count": segment.call_count,
            "children": children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_only_trace() {
        let trace = Trace::new("ROOT", 10);
        assert_eq!(trace.segment_count(), 1);
        assert_eq!(trace.segments_seen(), 1);
        assert_eq!(trace.segment(trace.root()).name, "ROOT");
        assert!(trace.segment(trace.root()).parent().is_none());
    }

    #[test]
    fn test_parent_child_links() {
        let mut trace = Trace::new("ROOT", 10);
        let root = trace.root();
        let db = trace.add_segment(root, "db.query").unwrap();
        let render = trace.add_segment(root, "render").unwrap();
        let nested = trace.add_segment(db, "db.connect").unwrap();

        assert_eq!(trace.segment(db).parent(), Some(root));
        assert_eq!(trace.segment(nested).parent(), Some(db));
        assert_eq!(trace.segment(root).children(), &[db, render]);
        assert_eq!(trace.segment_count(), 4);
    }

    #[test]
    fn test_segment_cap_drops_but_counts() {
        let mut trace = Trace::new("ROOT", 3);
        let root = trace.root();
        assert!(trace.add_segment(root, "a").is_some());
        assert!(trace.add_segment(root, "b").is_some());
        // Cap reached: stored count stays at 3, seen keeps climbing.
        assert!(trace.add_segment(root, "c").is_none());
        assert!(trace.add_segment(root, "d").is_none());
        assert_eq!(trace.segment_count(), 3);
        assert_eq!(trace.segments_seen(), 5);
        assert!(trace.exceeded_segment_limit());
    }

    #[test]
    fn test_duration_override() {
        let mut trace = Trace::new("ROOT", 10);
        assert_eq!(trace.duration_ms(), None);
        trace.set_duration_ms(123.5);
        assert_eq!(trace.duration_ms(), Some(123.5));
    }

    #[test]
    fn test_payload_nests_children() {
        let mut trace = Trace::new("ROOT", 10);
        let root = trace.root();
        let child = trace.add_segment(root, "middleware").unwrap();
        trace.add_segment(child, "handler").unwrap();
        trace.segment_mut(child).duration_ms = 12.0;

        let payload = trace.to_payload();
        assert_eq!(payload["root"]["name"], "ROOT");
        assert_eq!(payload["root"]["children"][0]["name"], "middleware");
        assert_eq!(payload["root"]["children"][0]["duration_ms"], 12.0);
        assert_eq!(
            payload["root"]["children"][0]["children"][0]["name"],
            "handler"
        );
    }
}
