//! Injected consistency validator.
//!
//! Structural invariants of the network and the value tree are programming
//! errors, not runtime conditions. This validator exists for tests: it walks
//! the whole engine and reports every violation it can find, instead of
//! asserting ambiently from inside the data structures. It also produces a
//! stable topology fingerprint useful for asserting that an edit left
//! unrelated structure untouched.

use std::collections::HashSet;
use std::fmt;

use crate::engine::Engine;
use crate::network::NodeId;
use crate::stats::QValueKind;
use crate::tree::ValueNodeKind;

/// One detected invariant violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A non-action node has no consumer but was never destroyed.
    OrphanNode {
        node: String,
        kind: &'static str,
    },
    /// An output edge points at a node that is gone.
    DanglingOutput {
        node: String,
        output: String,
    },
    /// An edge exists downstream but the input does not list the consumer.
    MissingBacklink {
        node: String,
        input: String,
    },
    /// A value node's statistics tag disagrees with its variant.
    StatsKindMismatch {
        rule: String,
        expected: QValueKind,
        actual: QValueKind,
    },
    /// A fringe node carries committed statistics.
    FringeWithWeight {
        rule: String,
    },
    /// A value node references a dead parent, child, or action node.
    DeadReference {
        rule: String,
        what: &'static str,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrphanNode { node, kind } => {
                write!(f, "orphan {kind} node {node} was never destroyed")
            }
            Self::DanglingOutput { node, output } => {
                write!(f, "node {node} lists dead output {output}")
            }
            Self::MissingBacklink { node, input } => {
                write!(f, "input {input} does not list {node} as an output")
            }
            Self::StatsKindMismatch {
                rule,
                expected,
                actual,
            } => write!(
                f,
                "value node '{rule}': statistics tagged {actual:?}, variant requires {expected:?}"
            ),
            Self::FringeWithWeight { rule } => {
                write!(f, "fringe node '{rule}' carries committed statistics")
            }
            Self::DeadReference { rule, what } => {
                write!(f, "value node '{rule}' references dead {what}")
            }
        }
    }
}

/// Walks an engine and reports every invariant violation found.
#[derive(Debug, Default, Clone, Copy)]
pub struct Validator;

impl Validator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Full consistency check over the network and the value tree.
    #[must_use]
    pub fn validate(&self, engine: &Engine) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        self.check_network(engine, &mut violations);
        self.check_tree(engine, &mut violations);
        violations
    }

    fn check_network(&self, engine: &Engine, violations: &mut Vec<InvariantViolation>) {
        let network = engine.network();
        let mut live: HashSet<NodeId> = HashSet::new();
        for (id, _) in network.iter_entries() {
            live.insert(id);
        }

        for (id, entry) in network.iter_entries() {
            let is_action = matches!(entry.kind, crate::network::NodeKind::Action(_));
            if entry.outputs.is_empty() && !is_action {
                violations.push(InvariantViolation::OrphanNode {
                    node: id.to_string(),
                    kind: entry.kind.tag(),
                });
            }
            for output in &entry.outputs {
                if !live.contains(output) {
                    violations.push(InvariantViolation::DanglingOutput {
                        node: id.to_string(),
                        output: output.to_string(),
                    });
                }
            }
            for input in [network.parent_left(id), network.parent_right(id)]
                .into_iter()
                .flatten()
            {
                if !live.contains(&input) {
                    violations.push(InvariantViolation::DeadReference {
                        rule: id.to_string(),
                        what: "input",
                    });
                } else if !network.outputs(input).contains(&id) {
                    violations.push(InvariantViolation::MissingBacklink {
                        node: id.to_string(),
                        input: input.to_string(),
                    });
                }
            }
        }
    }

    fn check_tree(&self, engine: &Engine, violations: &mut Vec<InvariantViolation>) {
        let tree = engine.tree();
        for (_, node) in tree.iter() {
            let rule = engine
                .rule_name(node.action)
                .unwrap_or_default()
                .to_string();

            if !engine.network().live(node.node) {
                violations.push(InvariantViolation::DeadReference {
                    rule: rule.clone(),
                    what: "action node",
                });
            }
            if let Some(parent) = node.parent {
                if tree.get(parent).is_none() {
                    violations.push(InvariantViolation::DeadReference {
                        rule: rule.clone(),
                        what: "parent",
                    });
                }
            }

            let expected = match &node.kind {
                ValueNodeKind::Split { .. } => Some(QValueKind::Split),
                ValueNodeKind::Unsplit { .. } => Some(QValueKind::Unsplit),
                ValueNodeKind::Fringe => None,
            };
            match (&node.weight, expected) {
                (Some(weight), Some(expected)) => {
                    let actual = weight.borrow().kind;
                    if actual != expected {
                        violations.push(InvariantViolation::StatsKindMismatch {
                            rule: rule.clone(),
                            expected,
                            actual,
                        });
                    }
                }
                (Some(_), None) => {
                    violations.push(InvariantViolation::FringeWithWeight { rule: rule.clone() });
                }
                (None, Some(expected)) => {
                    violations.push(InvariantViolation::StatsKindMismatch {
                        rule: rule.clone(),
                        expected,
                        actual: QValueKind::Fringe,
                    });
                }
                (None, None) => {}
            }

            for child in node.kind.children() {
                if tree.get(*child).is_none() {
                    violations.push(InvariantViolation::DeadReference {
                        rule: rule.clone(),
                        what: "child",
                    });
                }
            }
            for bucket in node.kind.fringe_buckets() {
                for fringe in &bucket.nodes {
                    if tree.get(*fringe).is_none() {
                        violations.push(InvariantViolation::DeadReference {
                            rule: rule.clone(),
                            what: "fringe candidate",
                        });
                    }
                }
            }
        }
    }

    /// Stable fingerprint of the network topology: node kinds, widths, and
    /// edges, hashed in slot order.
    #[must_use]
    pub fn fingerprint(&self, engine: &Engine) -> String {
        let network = engine.network();
        let mut hasher = blake3::Hasher::new();
        for (id, entry) in network.iter_entries() {
            hasher.update(id.to_string().as_bytes());
            hasher.update(entry.kind.tag().as_bytes());
            hasher.update(&entry.width.to_le_bytes());
            hasher.update(&entry.conds.to_le_bytes());
            for output in &entry.outputs {
                hasher.update(output.to_string().as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}
