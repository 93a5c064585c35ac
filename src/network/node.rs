//! Node variants of the matching network.
//!
//! The variant set is closed: propagation dispatch is a `match` in
//! [`super::Network`], which keeps the insert/remove/replay protocol
//! statically exhaustive. Nodes own their per-variant match state; the
//! surrounding [`NodeEntry`] owns the shared plumbing (outputs, cached
//! widths).

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::fact::FactTest;
use crate::symbol::Symbol;
use crate::token::{Bindings, Token, TokenIndex, VariableIndices};

use super::NodeId;
use crate::engine::ActionId;

/// Scalar comparison performed by a predicate node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl PredicateOp {
    /// Applies the comparison using the total symbol order.
    #[must_use]
    pub fn test(&self, lhs: &Symbol, rhs: &Symbol) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Neq => lhs != rhs,
            Self::Gt => lhs > rhs,
            Self::Gte => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Lte => lhs <= rhs,
        }
    }
}

impl fmt::Display for PredicateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq => write!(f, "="),
            Self::Neq => write!(f, "!="),
            Self::Gt => write!(f, ">"),
            Self::Gte => write!(f, ">="),
            Self::Lt => write!(f, "<"),
            Self::Lte => write!(f, "<="),
        }
    }
}

/// Right-hand side of a predicate: another bound slot or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PredicateRhs {
    Index(TokenIndex),
    Literal(Symbol),
}

/// Source of width-1 tokens; matches facts against a fixed pattern.
#[derive(Debug)]
pub struct FilterNode {
    pub test: FactTest,
    pub tokens: Vec<Token>,
}

/// Concatenating join over a binding set.
#[derive(Debug)]
pub struct JoinNode {
    pub bindings: Bindings,
    pub left: NodeId,
    pub right: NodeId,
    pub left_tokens: Vec<Token>,
    pub right_tokens: Vec<Token>,
}

/// Join that emits the left token at most once, gated by a live counter of
/// satisfying right partners. Shared by the existential and negation
/// variants; only the gate polarity differs.
#[derive(Debug)]
pub struct CountedJoinNode {
    pub bindings: Bindings,
    pub left: NodeId,
    pub right: NodeId,
    /// Left tokens with their current count of satisfying right partners.
    pub left_tokens: Vec<(Token, usize)>,
    pub right_tokens: Vec<Token>,
}

/// Zero-width quantifier keyed on whether any token exists upstream.
#[derive(Debug)]
pub struct QuantifierNode {
    pub input: NodeId,
    pub input_tokens: Vec<Token>,
}

/// Width-preserving scalar test.
#[derive(Debug)]
pub struct PredicateNode {
    pub op: PredicateOp,
    pub lhs: TokenIndex,
    pub rhs: PredicateRhs,
    pub input: NodeId,
    pub tokens: Vec<Token>,
}

/// Terminal node; matched tokens are handed to the agenda, never executed
/// inline.
#[derive(Debug)]
pub struct ActionNode {
    pub action: ActionId,
    pub input: NodeId,
    pub tokens: Vec<Token>,
    pub variables: Rc<VariableIndices>,
}

/// Closed union of the network's node variants.
#[derive(Debug)]
pub enum NodeKind {
    Filter(FilterNode),
    Join(JoinNode),
    ExistentialJoin(CountedJoinNode),
    NegationJoin(CountedJoinNode),
    Existential(QuantifierNode),
    Negation(QuantifierNode),
    Predicate(PredicateNode),
    Action(ActionNode),
}

impl NodeKind {
    /// Short tag for diagnostics.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Filter(_) => "filter",
            Self::Join(_) => "join",
            Self::ExistentialJoin(_) => "existential-join",
            Self::NegationJoin(_) => "negation-join",
            Self::Existential(_) => "existential",
            Self::Negation(_) => "negation",
            Self::Predicate(_) => "predicate",
            Self::Action(_) => "action",
        }
    }
}

/// Arena entry: a node variant plus the shared plumbing every variant
/// carries.
#[derive(Debug)]
pub struct NodeEntry {
    pub kind: NodeKind,
    /// Downstream consumers. A non-action node whose output set drains is
    /// destroyed by the arena cascade.
    pub outputs: Vec<NodeId>,
    /// Token width of emitted tokens, fixed at construction.
    pub width: usize,
    /// Conditions accumulated along this path, counting quantified ones.
    pub conds: usize,
}

impl NodeEntry {
    #[must_use]
    pub fn new(kind: NodeKind, width: usize, conds: usize) -> Self {
        Self {
            kind,
            outputs: Vec::new(),
            width,
            conds,
        }
    }
}
