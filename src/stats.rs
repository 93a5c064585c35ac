//! Q-value statistics attached to value nodes.
//!
//! Each value node owns a mutable statistics record. On a fringe promotion
//! the record is *shared* into the replacement node (never copied), so the
//! update history survives the transition exactly once.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::feature::Feature;

/// Type tag of a statistics record; always agrees with the owning value
/// node's variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QValueKind {
    Split,
    Unsplit,
    Fringe,
}

/// Eligibility-trace bookkeeping for one statistics record.
///
/// The engine owns the trace list itself; these fields mark membership and
/// carry the per-record trace state the learning rules read and write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Eligibility {
    pub initialized: bool,
    pub trace: f64,
    pub credit: f64,
    /// True while the owning node sits on the engine's trace list.
    pub on_trace: bool,
}

/// Running value estimates for one value node.
#[derive(Debug, Clone, PartialEq)]
pub struct QValue {
    pub kind: QValueKind,
    /// Refinement steps from the root.
    pub depth: usize,
    /// The discriminator that produced this node; `None` at the root.
    pub feature: Option<Feature>,

    /// Current value estimate.
    pub estimate: f64,
    /// Running mean of squared updates.
    pub mean2: f64,
    pub variance: f64,
    /// Secondary estimate (e.g. for double estimators).
    pub secondary: f64,
    pub update_count: u64,

    /// Accumulated squared Bellman error, consumed by split decisions.
    pub sq_error: f64,
    /// Error accumulated since the last commit at this depth.
    pub sq_error_post_commit: f64,

    /// Engine step at which this record was created.
    pub created_at_step: u64,
    pub eligibility: Eligibility,
}

impl QValue {
    /// Fresh, zeroed record.
    #[must_use]
    pub fn new(kind: QValueKind, depth: usize, feature: Option<Feature>, step: u64) -> Self {
        Self {
            kind,
            depth,
            feature,
            estimate: 0.0,
            mean2: 0.0,
            variance: 0.0,
            secondary: 0.0,
            update_count: 0,
            sq_error: 0.0,
            sq_error_post_commit: 0.0,
            created_at_step: step,
            eligibility: Eligibility::default(),
        }
    }

    /// Record seeded from an ancestor-stacked summary; update count starts
    /// at zero because no update has happened *at this node* yet.
    #[must_use]
    pub fn seeded(
        kind: QValueKind,
        depth: usize,
        feature: Option<Feature>,
        step: u64,
        seed: &QSummary,
    ) -> Self {
        let mut q = Self::new(kind, depth, feature, step);
        q.estimate = seed.estimate;
        q.mean2 = seed.mean2;
        q.variance = seed.variance;
        q.secondary = seed.secondary;
        q
    }

    /// Clears the accumulators a fresh split decision must restart from.
    pub fn reset_refinement_accumulators(&mut self) {
        self.sq_error = 0.0;
        self.sq_error_post_commit = 0.0;
        self.update_count = 0;
    }
}

/// Shared, mutable handle to a statistics record.
pub type QValueHandle = Rc<RefCell<QValue>>;

/// Sum of committed estimates along an ancestor chain, used to seed fringe
/// statistics at their stacked starting value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QSummary {
    pub estimate: f64,
    pub mean2: f64,
    pub variance: f64,
    pub secondary: f64,
    /// Minimum update count along the chain.
    pub update_count: u64,
}

impl QSummary {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            update_count: u64::MAX,
            ..Self::default()
        }
    }

    /// Folds one record into the summary.
    pub fn accumulate(&mut self, q: &QValue) {
        self.estimate += q.estimate;
        self.mean2 += q.mean2;
        self.variance += q.variance;
        self.secondary += q.secondary;
        self.update_count = self.update_count.min(q.update_count);
    }

    /// Finished summary; an empty chain reports zero updates.
    #[must_use]
    pub fn finish(mut self) -> Self {
        if self.update_count == u64::MAX {
            self.update_count = 0;
        }
        self
    }
}
