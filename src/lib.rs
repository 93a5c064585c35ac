//! # graft - online reinforcement learning over a self-refining match network
//!
//! graft is the runtime core of an online reinforcement-learning agent whose
//! decision logic is a growable network of pattern-matching rules. Working
//! memory holds `(identifier, attribute, value)` facts; a Rete-style
//! discrimination graph matches them incrementally; and a value-function
//! tree grafted onto the graph's action nodes refines itself as experience
//! accumulates, splitting and collapsing conditions while its value
//! estimates keep streaming updates.
//!
//! ## Core concepts
//!
//! - **Fact**: an `(identifier, attribute, value)` triple in working memory
//! - **Token**: the ordered facts matched so far along one network path
//! - **Agenda**: deferred firings, run only after a fact batch settles
//! - **Value node**: Q-value statistics anchored to one action node, in
//!   state unsplit, split, or fringe
//! - **Fringe**: a speculative, uncommitted refinement of a value node
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graft::{Condition, Engine, Fact, RuleSpec, Symbol};
//!
//! let mut engine = Engine::new();
//! let stacked = RuleSpec::new(
//!     "stacked",
//!     vec![
//!         Condition::Pattern(Fact::new(
//!             Symbol::variable("x"), "on", Symbol::variable("y"),
//!         )),
//!         Condition::Pattern(Fact::new(
//!             Symbol::variable("y"), "on", Symbol::variable("z"),
//!         )),
//!     ],
//! );
//! let leaf = engine.add_value_rule(&stacked)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

pub mod agenda;
pub mod arena;
pub mod engine;
pub mod error;
pub mod fact;
pub mod feature;
pub mod monitor;
pub mod network;
pub mod snapshot;
pub mod stats;
pub mod symbol;
pub mod token;
pub mod tree;
pub mod validate;

// Re-export primary types at crate root for convenience
pub use agenda::{Agenda, AgendaEntry};
pub use engine::{ActionHandlers, ActionId, ActiveMatch, Engine, Firing};
pub use error::{BuildError, ExecutionError, GraftError, GraftResult, RefineError};
pub use fact::{Column, Fact, FactTest, TestSlot};
pub use feature::{ConditionJoin, Feature, FeatureTest};
pub use monitor::{EngineEvent, EventKind, EventStream};
pub use network::builder::{Condition, RuleSpec, TestRhs};
pub use network::{Network, NodeId, PredicateOp};
pub use snapshot::TreeSnapshot;
pub use stats::{QSummary, QValue, QValueKind};
pub use symbol::{Identifier, Symbol};
pub use token::{Bindings, Token, TokenIndex, VariableIndices};
pub use tree::{FringeSource, ValueNode, ValueNodeId, ValueNodeKind, ValueTree};
pub use validate::{InvariantViolation, Validator};
