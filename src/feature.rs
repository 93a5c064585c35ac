//! Feature descriptors: the condition candidates the value tree refines on.
//!
//! A feature names one discriminator, an enumerated value test or one half
//! of a bounded range, anchored at a token slot (its axis). Features are
//! opaque to the tree itself: it only ever clones them, compares them
//! structurally, and turns them into predicate or join nodes when a fringe
//! is grafted.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::fact::Fact;
use crate::network::PredicateOp;
use crate::symbol::Symbol;
use crate::token::{TokenIndex, VariableIndices};

/// The discriminating test itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureTest {
    /// Axis equals one enumerated value.
    Enumerated {
        value: Symbol,
    },
    /// Axis falls in one half of a bounded interval `[lower, upper)`.
    Ranged {
        lower: f64,
        upper: f64,
        /// How many times the original interval has been halved.
        divisions: usize,
        /// Bounds are integer-locked.
        integer: bool,
        /// True for the upper half (test `axis >= lower`), false for the
        /// lower half (test `axis < upper`).
        upper_half: bool,
    },
}

impl FeatureTest {
    /// The scalar test committed when this feature becomes a predicate.
    #[must_use]
    pub fn predicate_parts(&self) -> (PredicateOp, Symbol) {
        match self {
            Self::Enumerated { value } => (PredicateOp::Eq, value.clone()),
            Self::Ranged {
                lower,
                upper,
                integer,
                upper_half,
                ..
            } => {
                #[allow(clippy::cast_possible_truncation)]
                let bound = |b: f64| {
                    if *integer {
                        Symbol::Int(b as i64)
                    } else {
                        Symbol::Float(b)
                    }
                };
                if *upper_half {
                    (PredicateOp::Gte, bound(*lower))
                } else {
                    (PredicateOp::Lt, bound(*upper))
                }
            }
        }
    }

    /// Halves a ranged test into its two children; `None` for enumerated
    /// tests and for intervals that cannot be subdivided further.
    #[must_use]
    pub fn halves(&self) -> Option<(Self, Self)> {
        match self {
            Self::Enumerated { .. } => None,
            Self::Ranged {
                lower,
                upper,
                divisions,
                integer,
                ..
            } => {
                let midpoint = if *integer {
                    ((lower + upper) / 2.0).floor()
                } else {
                    (lower + upper) / 2.0
                };
                if midpoint <= *lower || midpoint >= *upper {
                    return None;
                }
                let child = |lo: f64, hi: f64, upper_half: bool| Self::Ranged {
                    lower: lo,
                    upper: hi,
                    divisions: divisions + 1,
                    integer: *integer,
                    upper_half,
                };
                Some((
                    child(*lower, midpoint, false),
                    child(midpoint, *upper, true),
                ))
            }
        }
    }

    /// Number of times a ranged interval has been halved; zero for
    /// enumerated tests.
    #[must_use]
    pub const fn divisions(&self) -> usize {
        match self {
            Self::Enumerated { .. } => 0,
            Self::Ranged { divisions, .. } => *divisions,
        }
    }
}

impl PartialEq for FeatureTest {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Enumerated { value: a }, Self::Enumerated { value: b }) => a == b,
            (
                Self::Ranged {
                    lower: al,
                    upper: au,
                    divisions: ad,
                    integer: ai,
                    upper_half: ah,
                },
                Self::Ranged {
                    lower: bl,
                    upper: bu,
                    divisions: bd,
                    integer: bi,
                    upper_half: bh,
                },
            ) => {
                al.to_bits() == bl.to_bits()
                    && au.to_bits() == bu.to_bits()
                    && ad == bd
                    && ai == bi
                    && ah == bh
            }
            _ => false,
        }
    }
}

impl Eq for FeatureTest {}

impl Hash for FeatureTest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Enumerated { value } => {
                0u8.hash(state);
                value.hash(state);
            }
            Self::Ranged {
                lower,
                upper,
                divisions,
                integer,
                upper_half,
            } => {
                1u8.hash(state);
                lower.to_bits().hash(state);
                upper.to_bits().hash(state);
                divisions.hash(state);
                integer.hash(state);
                upper_half.hash(state);
            }
        }
    }
}

impl fmt::Display for FeatureTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enumerated { value } => write!(f, "={value}"),
            Self::Ranged {
                lower,
                upper,
                upper_half,
                ..
            } => {
                if *upper_half {
                    write!(f, ">={lower}")
                } else {
                    write!(f, "<{upper}")
                }
            }
        }
    }
}

/// How a new-condition feature joins its pattern onto the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionJoin {
    /// Widening join: the fact becomes part of the token.
    Join,
    /// Existential gate: match while such a fact exists.
    Existential,
    /// Negated gate: match while no such fact exists.
    Negation,
}

/// A fact pattern a feature must join into the match before its axis can be
/// tested. Absent for features that refine an already-bound slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureCondition {
    /// Template fact; variable slots bind against the leaf's variables.
    pub pattern: Fact,
    pub join: ConditionJoin,
}

/// A candidate discriminator for one value node.
///
/// Identity (equality, hashing, fringe bucketing) is structural over the
/// axis and the test; the variable map records the addressing context the
/// feature was authored under and is corrected when the feature is grafted
/// elsewhere.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Slot the discriminator tests.
    pub axis: TokenIndex,
    pub test: FeatureTest,
    /// Variable map this feature's indices were authored against.
    pub indices: Rc<VariableIndices>,
    /// New condition to graft, when the axis is not yet part of the match.
    pub condition: Option<FeatureCondition>,
}

impl Feature {
    /// A feature refining a slot that is already bound in `indices`.
    #[must_use]
    pub fn bound(axis: TokenIndex, test: FeatureTest, indices: Rc<VariableIndices>) -> Self {
        Self {
            axis,
            test,
            indices,
            condition: None,
        }
    }

    /// A feature that first joins `pattern` onto the match and then tests
    /// `axis` within it.
    #[must_use]
    pub fn conditional(
        axis: TokenIndex,
        test: FeatureTest,
        indices: Rc<VariableIndices>,
        pattern: Fact,
        join: ConditionJoin,
    ) -> Self {
        Self {
            axis,
            test,
            indices,
            condition: Some(FeatureCondition { pattern, join }),
        }
    }
}

impl PartialEq for Feature {
    fn eq(&self, other: &Self) -> bool {
        self.axis == other.axis && self.test == other.test
    }
}

impl Eq for Feature {}

impl Hash for Feature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.axis.hash(state);
        self.test.hash(state);
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.axis, self.test)
    }
}
