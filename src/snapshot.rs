//! Value-tree snapshots.
//!
//! The minimal serializable unit per value node is `(depth, kind tag,
//! feature-or-null, parent, statistics)`. A snapshot is enough to
//! reconstruct the tree provided the matching network is rebuilt by
//! re-running rule compilation and replaying the split history; it does not
//! attempt to serialize network topology. Content integrity is tagged with a
//! blake3 fingerprint over the canonical JSON of the records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::{ExecutionError, GraftError, GraftResult};
use crate::feature::FeatureTest;
use crate::stats::{QValue, QValueKind};
use crate::token::TokenIndex;
use crate::tree::{ValueNode, ValueNodeId, ValueNodeKind};

/// Serializable image of a feature descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub axis: TokenIndex,
    pub test: FeatureTest,
}

/// Serializable image of one statistics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QValueRecord {
    pub kind: QValueKind,
    pub depth: usize,
    pub estimate: f64,
    pub mean2: f64,
    pub variance: f64,
    pub secondary: f64,
    pub update_count: u64,
    pub sq_error: f64,
    pub sq_error_post_commit: f64,
    pub created_at_step: u64,
}

impl QValueRecord {
    fn of(q: &QValue) -> Self {
        Self {
            kind: q.kind,
            depth: q.depth,
            estimate: q.estimate,
            mean2: q.mean2,
            variance: q.variance,
            secondary: q.secondary,
            update_count: q.update_count,
            sq_error: q.sq_error,
            sq_error_post_commit: q.sq_error_post_commit,
            created_at_step: q.created_at_step,
        }
    }
}

/// Serializable image of one value node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueNodeRecord {
    /// Stable slot index within this snapshot.
    pub id: u32,
    /// Rule name of the anchored action.
    pub rule: String,
    pub depth: usize,
    /// Node state tag.
    pub kind: QValueKind,
    pub feature: Option<FeatureRecord>,
    /// Parent's slot index, `None` at a root.
    pub parent: Option<u32>,
    /// Committed statistics, when the node has them.
    pub weight: Option<QValueRecord>,
    pub probe: QValueRecord,
}

/// A point-in-time image of the value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub created_at: DateTime<Utc>,
    pub step: u64,
    pub nodes: Vec<ValueNodeRecord>,
    /// blake3 hex digest over the canonical JSON of `nodes`.
    pub fingerprint: String,
}

fn fingerprint_nodes(nodes: &[ValueNodeRecord]) -> GraftResult<String> {
    let canonical = serde_json::to_vec(nodes).map_err(codec_error)?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}

fn codec_error(error: serde_json::Error) -> GraftError {
    GraftError::Execution(ExecutionError::SnapshotCodec {
        message: error.to_string(),
    })
}

fn node_record(engine: &Engine, id: ValueNodeId, node: &ValueNode) -> ValueNodeRecord {
    let probe = node.probe.borrow();
    let kind = match node.kind {
        ValueNodeKind::Split { .. } => QValueKind::Split,
        ValueNodeKind::Unsplit { .. } => QValueKind::Unsplit,
        ValueNodeKind::Fringe => QValueKind::Fringe,
    };
    ValueNodeRecord {
        id: id.index(),
        rule: engine
            .rule_name(node.action)
            .unwrap_or_default()
            .to_string(),
        depth: probe.depth,
        kind,
        feature: probe.feature.as_ref().map(|f| FeatureRecord {
            axis: f.axis,
            test: f.test.clone(),
        }),
        parent: node.parent.map(|p| p.index()),
        weight: node.weight.as_ref().map(|w| QValueRecord::of(&w.borrow())),
        probe: QValueRecord::of(&probe),
    }
}

impl TreeSnapshot {
    /// Serializes to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns a codec error when serialization fails.
    pub fn to_json(&self) -> GraftResult<String> {
        serde_json::to_string_pretty(self).map_err(codec_error)
    }

    /// Parses a snapshot and verifies its fingerprint.
    ///
    /// # Errors
    ///
    /// Returns a codec error for malformed JSON and a corruption error when
    /// the fingerprint does not match the records.
    pub fn from_json(json: &str) -> GraftResult<Self> {
        let snapshot: Self = serde_json::from_str(json).map_err(codec_error)?;
        let actual = fingerprint_nodes(&snapshot.nodes)?;
        if actual != snapshot.fingerprint {
            return Err(GraftError::Execution(ExecutionError::SnapshotCorrupt {
                expected: snapshot.fingerprint,
                actual,
            }));
        }
        Ok(snapshot)
    }
}

impl Engine {
    /// Captures the current value tree.
    ///
    /// # Errors
    ///
    /// Returns a codec error when fingerprinting fails.
    pub fn snapshot(&self) -> GraftResult<TreeSnapshot> {
        let mut nodes: Vec<ValueNodeRecord> = self
            .tree()
            .iter()
            .map(|(id, node)| node_record(self, id, node))
            .collect();
        nodes.sort_by_key(|record| record.id);
        let fingerprint = fingerprint_nodes(&nodes)?;
        Ok(TreeSnapshot {
            created_at: Utc::now(),
            step: self.step(),
            nodes,
            fingerprint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use crate::network::builder::{Condition, RuleSpec};
    use crate::symbol::Symbol;

    fn engine_with_root() -> (Engine, ValueNodeId) {
        let mut engine = Engine::new();
        let spec = RuleSpec::new(
            "value-root",
            vec![Condition::Pattern(Fact::new(
                Symbol::variable("x"),
                "on",
                Symbol::variable("y"),
            ))],
        );
        let root = engine.add_value_rule(&spec).unwrap();
        (engine, root)
    }

    #[test]
    fn snapshot_round_trips() {
        let (engine, _root) = engine_with_root();
        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].kind, QValueKind::Unsplit);
        assert_eq!(snapshot.nodes[0].depth, 1);

        let json = snapshot.to_json().unwrap();
        let parsed = TreeSnapshot::from_json(&json).unwrap();
        assert_eq!(parsed.nodes, snapshot.nodes);
        assert_eq!(parsed.fingerprint, snapshot.fingerprint);
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let (engine, _root) = engine_with_root();
        let snapshot = engine.snapshot().unwrap();
        let json = snapshot.to_json().unwrap().replace("\"depth\": 1", "\"depth\": 2");
        let result = TreeSnapshot::from_json(&json);
        assert!(matches!(
            result,
            Err(GraftError::Execution(ExecutionError::SnapshotCorrupt { .. }))
        ));
    }
}
