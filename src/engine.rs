//! The runtime: working memory, rule registry, and the agenda drain loop.
//!
//! One fact change at the working-memory boundary triggers a full
//! synchronous propagation pass; the firings it produces run only after the
//! pass settles. Handlers run with full access to the engine, so a firing
//! may insert facts, request refinements, or excise rules; anything it
//! schedules is drained within the same run.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agenda::{Agenda, AgendaEntry};
use crate::error::{BuildError, ExecutionError, GraftError, GraftResult};
use crate::fact::Fact;
use crate::monitor::{channel, EngineEvent, EventKind, EventSink, EventStream};
use crate::network::builder::{plan_rule, RuleSpec};
use crate::network::{Network, NodeId};
use crate::stats::{QValue, QValueHandle, QValueKind};
use crate::token::Token;
use crate::tree::{ValueNode, ValueNodeId, ValueNodeKind, ValueTree};

/// Identity of an action, stable across network edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(Uuid);

impl ActionId {
    /// Creates a fresh action identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "a-{}", &s[..8])
    }
}

/// One delivered firing or retraction.
#[derive(Debug, Clone)]
pub struct Firing {
    pub action: ActionId,
    pub rule: String,
    pub token: Token,
    pub retraction: bool,
}

/// Callback invoked for a firing, with full engine access.
pub type ActionHandler = Box<dyn FnMut(&mut Engine, &Firing) -> GraftResult<()>>;

/// Optional firing/retraction callbacks for one rule.
#[derive(Default)]
pub struct ActionHandlers {
    on_fire: Option<ActionHandler>,
    on_retract: Option<ActionHandler>,
}

impl ActionHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the firing callback.
    #[must_use]
    pub fn on_fire(
        mut self,
        handler: impl FnMut(&mut Engine, &Firing) -> GraftResult<()> + 'static,
    ) -> Self {
        self.on_fire = Some(Box::new(handler));
        self
    }

    /// Sets the retraction callback.
    #[must_use]
    pub fn on_retract(
        mut self,
        handler: impl FnMut(&mut Engine, &Firing) -> GraftResult<()> + 'static,
    ) -> Self {
        self.on_retract = Some(Box::new(handler));
        self
    }
}

impl fmt::Debug for ActionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandlers")
            .field("on_fire", &self.on_fire.is_some())
            .field("on_retract", &self.on_retract.is_some())
            .finish()
    }
}

/// A currently live match at a value-node action.
#[derive(Debug, Clone)]
pub struct ActiveMatch {
    pub value: ValueNodeId,
    pub action: ActionId,
    pub token: Token,
}

#[derive(Debug)]
pub(crate) struct RuleEntry {
    pub(crate) name: String,
    pub(crate) node: NodeId,
    handlers: ActionHandlers,
}

/// The graft engine.
pub struct Engine {
    pub(crate) network: Network,
    pub(crate) agenda: Agenda,
    pub(crate) tree: ValueTree,
    pub(crate) step: u64,
    wmes: Vec<Rc<Fact>>,
    pub(crate) registry: HashMap<ActionId, RuleEntry>,
    matched: Vec<ActiveMatch>,
    trace: Vec<ValueNodeId>,
    sinks: Vec<EventSink>,
    rule_counter: u64,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            network: Network::new(),
            agenda: Agenda::new(),
            tree: ValueTree::new(),
            step: 0,
            wmes: Vec::new(),
            registry: HashMap::new(),
            matched: Vec::new(),
            trace: Vec::new(),
            sinks: Vec::new(),
            rule_counter: 0,
        }
    }

    // ------------------------------------------------------------------
    // Working memory
    // ------------------------------------------------------------------

    /// Inserts a fact and runs the resulting firings, unless the agenda is
    /// locked. Returns false for a duplicate (working memory is a set).
    pub fn insert_fact(&mut self, fact: Fact) -> GraftResult<bool> {
        if let Some(variable) = fact.first_variable() {
            return Err(BuildError::VariableInFact {
                variable: variable.to_string(),
            }
            .into());
        }
        if self.wmes.iter().any(|f| **f == fact) {
            return Ok(false);
        }
        self.step += 1;
        let fact = Rc::new(fact);
        self.wmes.push(Rc::clone(&fact));
        self.network.insert_fact(&mut self.agenda, &fact);
        self.run_agenda()?;
        Ok(true)
    }

    /// Removes a fact and runs the resulting retractions, unless the agenda
    /// is locked. Returns false when the fact was absent.
    pub fn remove_fact(&mut self, fact: &Fact) -> GraftResult<bool> {
        let Some(at) = self.wmes.iter().position(|f| **f == *fact) else {
            return Ok(false);
        };
        self.step += 1;
        self.wmes.remove(at);
        self.network.remove_fact(&mut self.agenda, fact);
        self.run_agenda()?;
        Ok(true)
    }

    /// Current working memory contents.
    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.wmes.iter().map(|f| f.as_ref())
    }

    /// Number of facts in working memory.
    #[must_use]
    pub fn fact_count(&self) -> usize {
        self.wmes.len()
    }

    pub(crate) fn working_memory(&self) -> &[Rc<Fact>] {
        &self.wmes
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    /// Compiles and installs a rule, returning its action identity.
    ///
    /// The specification is validated in full before any node is created;
    /// a rejected rule leaves the network untouched.
    pub fn add_rule(&mut self, spec: &RuleSpec, handlers: ActionHandlers) -> GraftResult<ActionId> {
        let (action, _) = self.install_rule(spec, handlers)?;
        self.run_agenda()?;
        Ok(action)
    }

    /// Compiles a rule and anchors a fresh value-tree root (an unsplit node
    /// at depth 1) to its action.
    pub fn add_value_rule(&mut self, spec: &RuleSpec) -> GraftResult<ValueNodeId> {
        let (action, node) = self.install_rule(spec, ActionHandlers::new())?;
        let variables = self
            .network
            .action_variables(node)
            .unwrap_or_default();

        let weight = QValue::new(QValueKind::Unsplit, 1, None, self.step);
        let probe = QValue::new(QValueKind::Fringe, 1, None, self.step);
        let value = self.tree.insert(ValueNode {
            action,
            node,
            parent: None,
            kind: ValueNodeKind::Unsplit { fringe: Vec::new() },
            weight: Some(Rc::new(std::cell::RefCell::new(weight))),
            probe: Rc::new(std::cell::RefCell::new(probe)),
            variables,
        });
        self.run_agenda()?;
        Ok(value)
    }

    fn install_rule(
        &mut self,
        spec: &RuleSpec,
        handlers: ActionHandlers,
    ) -> GraftResult<(ActionId, NodeId)> {
        if self.registry.values().any(|r| r.name == spec.name) {
            return Err(BuildError::DuplicateRuleName {
                name: spec.name.clone(),
            }
            .into());
        }
        let plan = plan_rule(spec)?;

        let tail = self
            .network
            .build_plan(&mut self.agenda, &plan, &self.wmes);
        let action = ActionId::new();
        let node = self.network.make_action(
            &mut self.agenda,
            action,
            tail,
            Rc::new(plan.variables().clone()),
        );
        self.registry.insert(
            action,
            RuleEntry {
                name: spec.name.clone(),
                node,
                handlers,
            },
        );
        Ok((action, node))
    }

    /// Registers an internally created action (used by the value tree's
    /// refinement operations, which build on an existing chain).
    pub(crate) fn register_action(&mut self, action: ActionId, name: String, node: NodeId) {
        self.registry.insert(
            action,
            RuleEntry {
                name,
                node,
                handlers: ActionHandlers::new(),
            },
        );
    }

    /// Excises a rule: its action node is destroyed and the orphan cascade
    /// reclaims every node no surviving rule shares. A value-anchored rule
    /// takes its value node (and that node's subtree) with it.
    pub fn excise_rule(&mut self, action: ActionId) -> GraftResult<()> {
        if let Some(value) = self.tree.by_action(action) {
            return self.excise_value_node(value);
        }
        let entry = self
            .registry
            .remove(&action)
            .ok_or(ExecutionError::UnknownAction { id: action })?;
        if self.network.live(entry.node) {
            self.network.excise_action(entry.node);
        }
        self.emit_with(|| EventKind::RuleExcised {
            rule: entry.name.clone(),
        });
        Ok(())
    }

    /// Excises a value node together with its children and outstanding
    /// fringe candidates, releasing their statistics and detaching every
    /// child before its parent.
    pub fn excise_value_node(&mut self, id: ValueNodeId) -> GraftResult<()> {
        let Some(node) = self.tree.get(id) else {
            return Err(ExecutionError::UnknownValueNode.into());
        };

        let mut dependents: Vec<ValueNodeId> = node.kind.children().to_vec();
        for bucket in node.kind.fringe_buckets() {
            dependents.extend(bucket.nodes.iter().copied());
        }
        for dependent in dependents {
            if self.tree.get(dependent).is_some() {
                self.excise_value_node(dependent)?;
            }
        }

        let Some(removed) = self.tree.remove(id) else {
            return Err(ExecutionError::UnknownValueNode.into());
        };
        self.trace.retain(|&t| t != id);
        self.matched.retain(|m| m.action != removed.action);
        removed.probe.borrow_mut().eligibility.on_trace = false;
        if let Some(weight) = &removed.weight {
            weight.borrow_mut().eligibility.on_trace = false;
        }

        let name = self
            .registry
            .remove(&removed.action)
            .map(|entry| entry.name)
            .unwrap_or_default();
        if self.network.live(removed.node) {
            self.network.excise_action(removed.node);
        }
        self.emit_with(|| EventKind::RuleExcised { rule: name.clone() });
        Ok(())
    }

    /// Name of a registered rule.
    #[must_use]
    pub fn rule_name(&self, action: ActionId) -> Option<&str> {
        self.registry.get(&action).map(|r| r.name.as_str())
    }

    /// Network action node of a registered rule.
    #[must_use]
    pub fn rule_node(&self, action: ActionId) -> Option<NodeId> {
        self.registry.get(&action).map(|r| r.node)
    }

    /// Tokens currently matched by a rule.
    #[must_use]
    pub fn matches_of(&self, action: ActionId) -> &[Token] {
        self.rule_node(action)
            .map_or(&[], |node| self.network.action_tokens(node))
    }

    /// Derives a child-rule name from `base`: everything up to the last `*`
    /// is kept, then the tag and a fresh counter are appended.
    pub(crate) fn derived_name(&mut self, base: &str, tag: char) -> String {
        self.rule_counter += 1;
        let prefix = match base.rfind('*') {
            Some(at) => &base[..at],
            None => base,
        };
        format!("{prefix}*{tag}{}", self.rule_counter)
    }

    // ------------------------------------------------------------------
    // Agenda
    // ------------------------------------------------------------------

    /// Drains the agenda in enqueue order. Each entry runs exactly once;
    /// entries scheduled mid-drain are drained in the same call. A failing
    /// handler does not stop the drain; the first error is returned after
    /// the queue settles.
    pub fn run_agenda(&mut self) -> GraftResult<()> {
        if !self.agenda.begin_drain() {
            return Ok(());
        }
        let mut first_error: Option<GraftError> = None;
        while let Some(entry) = self.agenda.pop() {
            if let Err(error) = self.dispatch(entry) {
                first_error.get_or_insert(error);
            }
        }
        self.agenda.end_drain();
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Suppresses agenda drains until the matching
    /// [`unlock_agenda`](Self::unlock_agenda). Locks nest.
    pub fn lock_agenda(&mut self) {
        self.agenda.lock();
    }

    /// Releases one lock level; releasing the last level drains whatever
    /// accumulated while locked.
    pub fn unlock_agenda(&mut self) -> GraftResult<()> {
        self.agenda.unlock();
        if self.agenda.suppressed() {
            Ok(())
        } else {
            self.run_agenda()
        }
    }

    /// Pending agenda entries (visible while locked).
    #[must_use]
    pub fn pending_firings(&self) -> usize {
        self.agenda.len()
    }

    fn dispatch(&mut self, entry: AgendaEntry) -> GraftResult<()> {
        // The action may have been excised by an earlier entry in this very
        // drain; its captured firings are simply dropped.
        let Some(rule) = self.registry.get(&entry.action).map(|r| r.name.clone()) else {
            return Ok(());
        };

        if let Some(value) = self.tree.by_action(entry.action) {
            if entry.retraction {
                if let Some(at) = self
                    .matched
                    .iter()
                    .position(|m| m.action == entry.action && m.token == entry.token)
                {
                    self.matched.remove(at);
                }
            } else {
                self.matched.push(ActiveMatch {
                    value,
                    action: entry.action,
                    token: entry.token.clone(),
                });
            }
        }

        self.emit_with(|| {
            let facts = entry.token.facts().map(|f| (**f).clone()).collect();
            if entry.retraction {
                EventKind::Retracted {
                    rule: rule.clone(),
                    action: entry.action,
                    facts,
                }
            } else {
                EventKind::Fired {
                    rule: rule.clone(),
                    action: entry.action,
                    facts,
                }
            }
        });

        let handler = self.registry.get_mut(&entry.action).and_then(|r| {
            if entry.retraction {
                r.handlers.on_retract.take()
            } else {
                r.handlers.on_fire.take()
            }
        });
        let Some(mut handler) = handler else {
            return Ok(());
        };

        let firing = Firing {
            action: entry.action,
            rule,
            token: entry.token,
            retraction: entry.retraction,
        };
        let result = handler(self, &firing);

        // Put the handler back unless the rule excised itself.
        if let Some(r) = self.registry.get_mut(&entry.action) {
            if entry.retraction {
                r.handlers.on_retract = Some(handler);
            } else {
                r.handlers.on_fire = Some(handler);
            }
        }

        result.map_err(|error| {
            GraftError::Execution(ExecutionError::HandlerFailed {
                id: entry.action,
                message: error.to_string(),
            })
        })
    }

    // ------------------------------------------------------------------
    // Value surface for the learning component
    // ------------------------------------------------------------------

    /// Matches currently live at value-node actions, in firing order.
    #[must_use]
    pub fn matched(&self) -> &[ActiveMatch] {
        &self.matched
    }

    /// Committed statistics of a value node, if it has any.
    #[must_use]
    pub fn q_weight(&self, id: ValueNodeId) -> Option<QValueHandle> {
        self.tree.get(id).and_then(|n| n.weight.clone())
    }

    /// Refinement statistics of a value node.
    #[must_use]
    pub fn q_probe(&self, id: ValueNodeId) -> Option<QValueHandle> {
        self.tree.get(id).map(|n| n.probe.clone())
    }

    /// The value tree, read-only.
    #[must_use]
    pub fn tree(&self) -> &ValueTree {
        &self.tree
    }

    /// The matching network, read-only.
    #[must_use]
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Current engine step (one per working-memory mutation).
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Adds a value node to the eligibility trace.
    pub fn trace_add(&mut self, id: ValueNodeId) -> GraftResult<()> {
        let node = self
            .tree
            .get(id)
            .ok_or(ExecutionError::UnknownValueNode)?;
        let mut probe = node.probe.borrow_mut();
        if !probe.eligibility.on_trace {
            probe.eligibility.on_trace = true;
            drop(probe);
            self.trace.push(id);
        }
        Ok(())
    }

    /// Removes a value node from the eligibility trace.
    pub fn trace_remove(&mut self, id: ValueNodeId) {
        if let Some(node) = self.tree.get(id) {
            node.probe.borrow_mut().eligibility.on_trace = false;
        }
        self.trace.retain(|&t| t != id);
    }

    /// The eligibility trace, oldest first.
    #[must_use]
    pub fn trace(&self) -> &[ValueNodeId] {
        &self.trace
    }

    /// Clears the eligibility trace and every membership marker.
    pub fn trace_clear(&mut self) {
        for id in std::mem::take(&mut self.trace) {
            if let Some(node) = self.tree.get(id) {
                node.probe.borrow_mut().eligibility.on_trace = false;
            }
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribes to engine events over a bounded stream of the given
    /// capacity. Publishing never blocks; a full stream drops events.
    pub fn subscribe(&mut self, capacity: usize) -> EventStream {
        let (sink, stream) = channel(capacity);
        self.sinks.push(sink);
        stream
    }

    pub(crate) fn emit_with(&mut self, build: impl FnOnce() -> EventKind) {
        if self.sinks.is_empty() {
            return;
        }
        let event = EngineEvent {
            at: chrono::Utc::now(),
            step: self.step,
            kind: build(),
        };
        self.sinks.retain(|sink| sink.publish(event.clone()));
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("facts", &self.wmes.len())
            .field("rules", &self.registry.len())
            .field("nodes", &self.network.node_count())
            .field("value_nodes", &self.tree.len())
            .field("step", &self.step)
            .finish()
    }
}
