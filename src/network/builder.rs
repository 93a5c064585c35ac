//! Compilation of condition specifications into network fragments.
//!
//! This is the construction surface shared by the external rule compiler and
//! the value tree's online edits. Compilation is two-phase: [`plan_rule`]
//! validates the whole specification and derives every fact test, binding
//! set, and variable index up front; only a valid plan ever touches the
//! network, so a rejected rule leaves no partial graph behind.

use std::rc::Rc;

use crate::agenda::Agenda;
use crate::error::BuildError;
use crate::fact::{Column, Fact, FactTest, TestSlot};
use crate::symbol::Symbol;
use crate::token::{Bindings, TokenIndex, VariableIndices};

use super::node::{PredicateOp, PredicateRhs};
use super::{Network, NodeId};

/// Right-hand side of a scalar test condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRhs {
    Variable(String),
    Literal(Symbol),
}

/// One condition of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Positive fact pattern; variable slots bind, constant slots filter.
    Pattern(Fact),
    /// Existentially quantified pattern: the rule matches while at least one
    /// such fact exists, without extending the token.
    Exists(Fact),
    /// Negated pattern: the rule matches while no such fact exists.
    Absent(Fact),
    /// Scalar comparison between a bound variable and a variable or literal.
    Test {
        lhs: String,
        op: PredicateOp,
        rhs: TestRhs,
    },
}

/// A named rule: an ordered conjunction of conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub name: String,
    pub conditions: Vec<Condition>,
}

impl RuleSpec {
    /// Creates a rule spec.
    pub fn new(name: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            name: name.into(),
            conditions,
        }
    }
}

/// One network-construction step of a validated plan.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// First positive pattern: the chain's token source.
    Source {
        test: FactTest,
        intra: Vec<(TokenIndex, TokenIndex)>,
    },
    /// Subsequent positive pattern joined onto the chain.
    Join {
        test: FactTest,
        bindings: Bindings,
        intra: Vec<(TokenIndex, TokenIndex)>,
    },
    /// Quantified pattern joined onto the chain (gate only, no widening).
    QuantifiedJoin {
        test: FactTest,
        bindings: Bindings,
        negated: bool,
    },
    /// Leading quantified pattern (no chain yet): zero-width gate.
    Quantifier {
        test: FactTest,
        negated: bool,
    },
    /// Scalar predicate.
    Test {
        op: PredicateOp,
        lhs: TokenIndex,
        rhs: PredicateRhs,
    },
}

/// A fully validated construction plan for one rule.
#[derive(Debug, Clone)]
pub struct Plan {
    pub(crate) steps: Vec<Step>,
    variables: VariableIndices,
}

impl Plan {
    /// The variable map accumulated across the whole rule.
    #[must_use]
    pub fn variables(&self) -> &VariableIndices {
        &self.variables
    }
}

/// Variable occurrences of one pattern, in column order.
pub(crate) fn pattern_slots(pattern: &Fact) -> (FactTest, Vec<(String, Column)>) {
    let mut variables = Vec::new();
    let mut slot = |symbol: &Symbol, column: Column| match symbol {
        Symbol::Variable(name) => {
            variables.push((name.clone(), column));
            TestSlot::Any
        }
        other => TestSlot::Is(other.clone()),
    };
    let test = FactTest {
        identifier: slot(&pattern.identifier, Column::Identifier),
        attribute: slot(&pattern.attribute, Column::Attribute),
        value: slot(&pattern.value, Column::Value),
    };
    (test, variables)
}

/// Validates a rule specification and derives its construction plan.
///
/// # Errors
///
/// Returns a [`BuildError`] describing the first defect found; no network
/// state is touched.
pub fn plan_rule(spec: &RuleSpec) -> Result<Plan, BuildError> {
    if spec.name.trim().is_empty() {
        return Err(BuildError::EmptyRuleName);
    }
    if spec.conditions.is_empty() {
        return Err(BuildError::EmptyRule {
            name: spec.name.clone(),
        });
    }

    let mut steps = Vec::with_capacity(spec.conditions.len());
    let mut variables = VariableIndices::new();
    let mut cond_rows = 0usize;
    let mut token_rows = 0usize;
    let mut has_chain = false;

    for (position, condition) in spec.conditions.iter().enumerate() {
        match condition {
            Condition::Pattern(pattern) => {
                let (test, slots) = pattern_slots(pattern);
                let mut bindings = Vec::new();
                let mut intra = Vec::new();
                let mut first_local: Vec<(String, Column)> = Vec::new();

                for (name, column) in &slots {
                    let global = TokenIndex::new(cond_rows, token_rows, *column);
                    if let Some((_, first_col)) = first_local.iter().find(|(n, _)| n == name) {
                        // Same variable twice in one pattern: equality
                        // predicate between the two columns of this row.
                        intra.push((
                            TokenIndex::new(cond_rows, token_rows, *first_col),
                            global,
                        ));
                    } else if let Some(bound) = variables.first_bound(name) {
                        // Bound earlier in the chain: join constraint against
                        // the incoming width-1 token.
                        bindings.push((bound, TokenIndex::new(0, 0, *column)));
                        first_local.push((name.clone(), *column));
                    } else {
                        first_local.push((name.clone(), *column));
                    }
                    variables.insert(name.clone(), global);
                }

                if has_chain {
                    steps.push(Step::Join {
                        test,
                        bindings: Bindings(bindings),
                        intra,
                    });
                } else {
                    debug_assert!(bindings.is_empty());
                    steps.push(Step::Source { test, intra });
                    has_chain = true;
                }
                cond_rows += 1;
                token_rows += 1;
            }

            Condition::Exists(pattern) | Condition::Absent(pattern) => {
                let negated = matches!(condition, Condition::Absent(_));
                let (test, slots) = pattern_slots(pattern);

                if has_chain {
                    let mut bindings = Vec::new();
                    let mut seen: Vec<&str> = Vec::new();
                    for (name, column) in &slots {
                        if !seen.contains(&name.as_str()) {
                            if let Some(bound) = variables.first_bound(name) {
                                bindings.push((bound, TokenIndex::new(0, 0, *column)));
                            }
                            seen.push(name);
                        }
                        variables
                            .insert(name.clone(), TokenIndex::quantified(cond_rows, token_rows, *column));
                    }
                    steps.push(Step::QuantifiedJoin {
                        test,
                        bindings: Bindings(bindings),
                        negated,
                    });
                } else {
                    // No chain to bind against: duplicate variables in a
                    // leading quantifier would need post-gate tests that can
                    // never resolve.
                    let mut seen: Vec<&str> = Vec::new();
                    for (name, column) in &slots {
                        if seen.contains(&name.as_str()) {
                            return Err(BuildError::QuantifiedDuplicateVariable {
                                variable: name.clone(),
                            });
                        }
                        seen.push(name);
                        variables
                            .insert(name.clone(), TokenIndex::quantified(cond_rows, token_rows, *column));
                    }
                    steps.push(Step::Quantifier { test, negated });
                    // The zero-width gate is the chain from here on.
                    has_chain = true;
                }
                cond_rows += 1;
            }

            Condition::Test { lhs, op, rhs } => {
                if position == 0 {
                    return Err(BuildError::LeadingNonPattern {
                        name: spec.name.clone(),
                    });
                }
                let lhs_index =
                    variables
                        .first_bound(lhs)
                        .ok_or_else(|| BuildError::UnboundVariable {
                            variable: lhs.clone(),
                        })?;
                let rhs = match rhs {
                    TestRhs::Literal(symbol) => PredicateRhs::Literal(symbol.clone()),
                    TestRhs::Variable(name) => PredicateRhs::Index(
                        variables
                            .first_bound(name)
                            .ok_or_else(|| BuildError::UnboundVariable {
                                variable: name.clone(),
                            })?,
                    ),
                };
                steps.push(Step::Test {
                    op: *op,
                    lhs: lhs_index,
                    rhs,
                });
            }
        }
    }

    Ok(Plan { steps, variables })
}

impl Network {
    /// Materializes a validated plan, reusing every structurally identical
    /// node already present. Returns the tail of the chain, ready for an
    /// action node.
    pub(crate) fn build_plan(
        &mut self,
        agenda: &mut Agenda,
        plan: &Plan,
        working_memory: &[Rc<Fact>],
    ) -> NodeId {
        let mut chain: Option<NodeId> = None;

        for step in &plan.steps {
            let next = match step {
                Step::Source { test, intra } => {
                    let mut node = self.make_filter(test.clone(), working_memory);
                    for (lhs, rhs) in intra {
                        node = self.make_predicate_vv(agenda, PredicateOp::Eq, *lhs, *rhs, node);
                    }
                    node
                }
                Step::Join {
                    test,
                    bindings,
                    intra,
                } => {
                    let left = chain.expect("join step requires a chain");
                    let right = self.make_filter(test.clone(), working_memory);
                    let mut node = self.make_join(agenda, bindings.clone(), left, right);
                    for (lhs, rhs) in intra {
                        node = self.make_predicate_vv(agenda, PredicateOp::Eq, *lhs, *rhs, node);
                    }
                    node
                }
                Step::QuantifiedJoin {
                    test,
                    bindings,
                    negated,
                } => {
                    let left = chain.expect("quantified join requires a chain");
                    let right = self.make_filter(test.clone(), working_memory);
                    if *negated {
                        self.make_negation_join(agenda, bindings.clone(), left, right)
                    } else {
                        self.make_existential_join(agenda, bindings.clone(), left, right)
                    }
                }
                Step::Quantifier { test, negated } => {
                    let input = self.make_filter(test.clone(), working_memory);
                    if *negated {
                        self.make_negation(agenda, input)
                    } else {
                        self.make_existential(agenda, input)
                    }
                }
                Step::Test { op, lhs, rhs } => {
                    let input = chain.expect("test step requires a chain");
                    match rhs {
                        PredicateRhs::Literal(symbol) => {
                            self.make_predicate_vc(agenda, *op, *lhs, symbol.clone(), input)
                        }
                        PredicateRhs::Index(rhs) => {
                            self.make_predicate_vv(agenda, *op, *lhs, *rhs, input)
                        }
                    }
                }
            };
            chain = Some(next);
        }

        chain.expect("validated plans are never empty")
    }
}
