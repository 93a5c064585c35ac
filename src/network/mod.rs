//! The incremental matching network.
//!
//! Nodes live in a generation-checked arena and reference each other by
//! handle; outputs form the only ownership edges. Token propagation is
//! synchronous and run-to-completion: one fact change at the working-memory
//! boundary pushes through every affected path before the call returns.
//! Firings are *not* executed inline; action nodes hand them to the agenda.
//!
//! Construction goes through the `make_*` surface, which deduplicates
//! structurally identical nodes against the prospective input's outputs and
//! replays the input's current matches into every newly attached consumer.
//! The same surface serves the rule compiler and the value tree's online
//! edits.

pub mod builder;
pub mod node;

use std::rc::Rc;

use crate::agenda::Agenda;
use crate::arena::{Arena, Id};
use crate::engine::ActionId;
use crate::fact::{Fact, FactTest};
use crate::token::{Bindings, Token, TokenIndex, VariableIndices};

pub use node::{NodeKind, PredicateOp, PredicateRhs};
use node::{
    ActionNode, CountedJoinNode, FilterNode, JoinNode, NodeEntry, PredicateNode, QuantifierNode,
};

/// Handle to a matching-network node.
pub type NodeId = Id<NodeEntry>;

/// The matching network: an arena of nodes plus the alpha index of filter
/// sources.
#[derive(Debug, Default)]
pub struct Network {
    nodes: Arena<NodeEntry>,
    filters: Vec<NodeId>,
}

impl Network {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// True when `id` refers to a live node.
    #[must_use]
    pub fn live(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    /// The alpha layer: all live filter nodes.
    #[must_use]
    pub fn filters(&self) -> &[NodeId] {
        &self.filters
    }

    /// Downstream consumers of `id`.
    #[must_use]
    pub fn outputs(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].outputs
    }

    /// Token width of the tokens `id` emits.
    #[must_use]
    pub fn width(&self, id: NodeId) -> usize {
        self.nodes[id].width
    }

    /// Conditions accumulated along `id`'s path, counting quantified ones.
    #[must_use]
    pub fn conds(&self, id: NodeId) -> usize {
        self.nodes[id].conds
    }

    /// Diagnostic tag of the node's variant.
    #[must_use]
    pub fn kind_tag(&self, id: NodeId) -> &'static str {
        self.nodes[id].kind.tag()
    }

    #[must_use]
    pub fn is_filter(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Filter(_))
    }

    #[must_use]
    pub fn is_predicate(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Predicate(_))
    }

    /// Left (primary) input of the node, `None` for filters.
    #[must_use]
    pub fn parent_left(&self, id: NodeId) -> Option<NodeId> {
        match &self.nodes[id].kind {
            NodeKind::Filter(_) => None,
            NodeKind::Join(j) => Some(j.left),
            NodeKind::ExistentialJoin(j) | NodeKind::NegationJoin(j) => Some(j.left),
            NodeKind::Existential(q) | NodeKind::Negation(q) => Some(q.input),
            NodeKind::Predicate(p) => Some(p.input),
            NodeKind::Action(a) => Some(a.input),
        }
    }

    /// Right (secondary) input; single-input nodes report their only input.
    #[must_use]
    pub fn parent_right(&self, id: NodeId) -> Option<NodeId> {
        match &self.nodes[id].kind {
            NodeKind::Filter(_) => None,
            NodeKind::Join(j) => Some(j.right),
            NodeKind::ExistentialJoin(j) | NodeKind::NegationJoin(j) => Some(j.right),
            NodeKind::Existential(q) | NodeKind::Negation(q) => Some(q.input),
            NodeKind::Predicate(p) => Some(p.input),
            NodeKind::Action(a) => Some(a.input),
        }
    }

    /// The node whose emissions define the identity of tokens flowing out of
    /// `id`. Counted joins and width-preserving nodes forward their left
    /// input's owner; every token-shaping node owns its own.
    #[must_use]
    pub fn token_owner(&self, id: NodeId) -> NodeId {
        match &self.nodes[id].kind {
            NodeKind::Filter(_)
            | NodeKind::Join(_)
            | NodeKind::Existential(_)
            | NodeKind::Negation(_) => id,
            NodeKind::ExistentialJoin(j) | NodeKind::NegationJoin(j) => self.token_owner(j.left),
            NodeKind::Predicate(p) => self.token_owner(p.input),
            NodeKind::Action(a) => self.token_owner(a.input),
        }
    }

    /// Join family of a node, `None` for non-join variants.
    #[must_use]
    pub fn join_family(&self, id: NodeId) -> Option<JoinFamily> {
        match &self.nodes[id].kind {
            NodeKind::Join(_) => Some(JoinFamily::Join),
            NodeKind::ExistentialJoin(_) => Some(JoinFamily::Existential),
            NodeKind::NegationJoin(_) => Some(JoinFamily::Negation),
            _ => None,
        }
    }

    /// Binding set of a join-family node.
    #[must_use]
    pub fn bindings_of(&self, id: NodeId) -> Option<&Bindings> {
        match &self.nodes[id].kind {
            NodeKind::Join(j) => Some(&j.bindings),
            NodeKind::ExistentialJoin(j) | NodeKind::NegationJoin(j) => Some(&j.bindings),
            _ => None,
        }
    }

    /// Action identity of an action node.
    #[must_use]
    pub fn action_of(&self, id: NodeId) -> Option<ActionId> {
        match &self.nodes[id].kind {
            NodeKind::Action(a) => Some(a.action),
            _ => None,
        }
    }

    /// Tokens currently matched at an action node.
    #[must_use]
    pub fn action_tokens(&self, id: NodeId) -> &[Token] {
        match &self.nodes[id].kind {
            NodeKind::Action(a) => &a.tokens,
            _ => &[],
        }
    }

    /// Variable map carried by an action node.
    #[must_use]
    pub fn action_variables(&self, id: NodeId) -> Option<Rc<VariableIndices>> {
        match &self.nodes[id].kind {
            NodeKind::Action(a) => Some(Rc::clone(&a.variables)),
            _ => None,
        }
    }

    pub(crate) fn iter_entries(&self) -> impl Iterator<Item = (NodeId, &NodeEntry)> {
        self.nodes.iter()
    }

    // ------------------------------------------------------------------
    // Working-memory boundary
    // ------------------------------------------------------------------

    /// Pushes a fact insertion through the alpha layer.
    pub fn insert_fact(&mut self, agenda: &mut Agenda, fact: &Rc<Fact>) {
        for filter in self.filters.clone() {
            let matched = match &mut self.nodes[filter].kind {
                NodeKind::Filter(f) if f.test.matches(fact) => {
                    let token = Token::unit(Rc::clone(fact));
                    f.tokens.push(token.clone());
                    Some(token)
                }
                _ => None,
            };
            if let Some(token) = matched {
                self.emit_insert(agenda, filter, &token);
            }
        }
    }

    /// Pushes a fact removal through the alpha layer.
    pub fn remove_fact(&mut self, agenda: &mut Agenda, fact: &Fact) {
        for filter in self.filters.clone() {
            let removed = match &mut self.nodes[filter].kind {
                NodeKind::Filter(f) if f.test.matches(fact) => {
                    let token = Token::unit(Rc::new(fact.clone()));
                    match f.tokens.iter().position(|t| *t == token) {
                        Some(at) => {
                            f.tokens.remove(at);
                            Some(token)
                        }
                        None => None,
                    }
                }
                _ => None,
            };
            if let Some(token) = removed {
                self.emit_remove(agenda, filter, &token);
            }
        }
    }

    // ------------------------------------------------------------------
    // Propagation protocol
    // ------------------------------------------------------------------

    fn emit_insert(&mut self, agenda: &mut Agenda, from: NodeId, token: &Token) {
        for output in self.nodes[from].outputs.clone() {
            self.insert_token(agenda, output, token.clone(), from);
        }
    }

    fn emit_remove(&mut self, agenda: &mut Agenda, from: NodeId, token: &Token) {
        for output in self.nodes[from].outputs.clone() {
            self.remove_token(agenda, output, token, from);
        }
    }

    /// Delivers a token insertion to `node` from input `from`.
    ///
    /// A join whose two inputs are the same node receives the token once and
    /// processes it as both a left and a right arrival, left phase first.
    pub(crate) fn insert_token(
        &mut self,
        agenda: &mut Agenda,
        node: NodeId,
        token: Token,
        from: NodeId,
    ) {
        let mut effects: Vec<(Polarity, Token)> = Vec::new();

        match &mut self.nodes[node].kind {
            NodeKind::Filter(_) => {
                debug_assert!(false, "filters take facts, not tokens");
            }
            NodeKind::Join(j) => {
                debug_assert!(from == j.left || from == j.right);
                if from == j.left {
                    j.left_tokens.push(token.clone());
                    effects.extend(
                        j.right_tokens
                            .iter()
                            .filter(|r| j.bindings.satisfied(&token, r))
                            .map(|r| (Polarity::Insert, Token::merge(&token, r))),
                    );
                }
                if from == j.right {
                    j.right_tokens.push(token.clone());
                    effects.extend(
                        j.left_tokens
                            .iter()
                            .filter(|l| j.bindings.satisfied(l, &token))
                            .map(|l| (Polarity::Insert, Token::merge(l, &token))),
                    );
                }
            }
            NodeKind::ExistentialJoin(j) => {
                debug_assert!(from == j.left || from == j.right);
                if from == j.left {
                    let partners = j
                        .right_tokens
                        .iter()
                        .filter(|r| j.bindings.satisfied(&token, r))
                        .count();
                    j.left_tokens.push((token.clone(), partners));
                    if partners > 0 {
                        effects.push((Polarity::Insert, token.clone()));
                    }
                }
                if from == j.right {
                    j.right_tokens.push(token.clone());
                    for (left, count) in &mut j.left_tokens {
                        if j.bindings.satisfied(left, &token) {
                            *count += 1;
                            if *count == 1 {
                                effects.push((Polarity::Insert, left.clone()));
                            }
                        }
                    }
                }
            }
            NodeKind::NegationJoin(j) => {
                debug_assert!(from == j.left || from == j.right);
                if from == j.left {
                    let partners = j
                        .right_tokens
                        .iter()
                        .filter(|r| j.bindings.satisfied(&token, r))
                        .count();
                    j.left_tokens.push((token.clone(), partners));
                    if partners == 0 {
                        effects.push((Polarity::Insert, token.clone()));
                    }
                }
                if from == j.right {
                    j.right_tokens.push(token.clone());
                    for (left, count) in &mut j.left_tokens {
                        if j.bindings.satisfied(left, &token) {
                            *count += 1;
                            if *count == 1 {
                                effects.push((Polarity::Remove, left.clone()));
                            }
                        }
                    }
                }
            }
            NodeKind::Existential(q) => {
                q.input_tokens.push(token);
                if q.input_tokens.len() == 1 {
                    effects.push((Polarity::Insert, Token::empty()));
                }
            }
            NodeKind::Negation(q) => {
                q.input_tokens.push(token);
                if q.input_tokens.len() == 1 {
                    effects.push((Polarity::Remove, Token::empty()));
                }
            }
            NodeKind::Predicate(p) => {
                let pass = match &p.rhs {
                    PredicateRhs::Literal(symbol) => p.op.test(token.resolve(&p.lhs), symbol),
                    PredicateRhs::Index(rhs) => {
                        p.op.test(token.resolve(&p.lhs), token.resolve(rhs))
                    }
                };
                if pass {
                    p.tokens.push(token.clone());
                    effects.push((Polarity::Insert, token));
                }
            }
            NodeKind::Action(a) => {
                a.tokens.push(token.clone());
                agenda.schedule_firing(a.action, token);
            }
        }

        self.apply_effects(agenda, node, effects);
    }

    fn apply_effects(&mut self, agenda: &mut Agenda, node: NodeId, effects: Vec<(Polarity, Token)>) {
        for (polarity, token) in effects {
            match polarity {
                Polarity::Insert => self.emit_insert(agenda, node, &token),
                Polarity::Remove => self.emit_remove(agenda, node, &token),
            }
        }
    }

    /// Delivers a token removal to `node` from input `from`; returns whether
    /// the node still holds any match afterwards. Shared-input joins process
    /// the removal as both a left and a right departure, left phase first.
    pub(crate) fn remove_token(
        &mut self,
        agenda: &mut Agenda,
        node: NodeId,
        token: &Token,
        from: NodeId,
    ) -> bool {
        let mut effects: Vec<(Polarity, Token)> = Vec::new();

        match &mut self.nodes[node].kind {
            NodeKind::Filter(_) => {
                debug_assert!(false, "filters take facts, not tokens");
            }
            NodeKind::Join(j) => {
                debug_assert!(from == j.left || from == j.right);
                if from == j.left {
                    if let Some(at) = j.left_tokens.iter().position(|l| l == token) {
                        j.left_tokens.remove(at);
                        effects.extend(
                            j.right_tokens
                                .iter()
                                .filter(|r| j.bindings.satisfied(token, r))
                                .map(|r| (Polarity::Remove, Token::merge(token, r))),
                        );
                    }
                }
                if from == j.right {
                    if let Some(at) = j.right_tokens.iter().position(|r| r == token) {
                        j.right_tokens.remove(at);
                        effects.extend(
                            j.left_tokens
                                .iter()
                                .filter(|l| j.bindings.satisfied(l, token))
                                .map(|l| (Polarity::Remove, Token::merge(l, token))),
                        );
                    }
                }
            }
            NodeKind::ExistentialJoin(j) => {
                debug_assert!(from == j.left || from == j.right);
                if from == j.left {
                    if let Some(at) = j.left_tokens.iter().position(|(l, _)| l == token) {
                        let (left, partners) = j.left_tokens.remove(at);
                        if partners > 0 {
                            effects.push((Polarity::Remove, left));
                        }
                    }
                }
                if from == j.right {
                    if let Some(at) = j.right_tokens.iter().position(|r| r == token) {
                        j.right_tokens.remove(at);
                        for (left, count) in &mut j.left_tokens {
                            if j.bindings.satisfied(left, token) {
                                *count -= 1;
                                if *count == 0 {
                                    effects.push((Polarity::Remove, left.clone()));
                                }
                            }
                        }
                    }
                }
            }
            NodeKind::NegationJoin(j) => {
                debug_assert!(from == j.left || from == j.right);
                if from == j.left {
                    if let Some(at) = j.left_tokens.iter().position(|(l, _)| l == token) {
                        let (left, partners) = j.left_tokens.remove(at);
                        if partners == 0 {
                            effects.push((Polarity::Remove, left));
                        }
                    }
                }
                if from == j.right {
                    if let Some(at) = j.right_tokens.iter().position(|r| r == token) {
                        j.right_tokens.remove(at);
                        for (left, count) in &mut j.left_tokens {
                            if j.bindings.satisfied(left, token) {
                                *count -= 1;
                                if *count == 0 {
                                    effects.push((Polarity::Insert, left.clone()));
                                }
                            }
                        }
                    }
                }
            }
            NodeKind::Existential(q) => {
                if let Some(at) = q.input_tokens.iter().position(|t| t == token) {
                    q.input_tokens.remove(at);
                    if q.input_tokens.is_empty() {
                        effects.push((Polarity::Remove, Token::empty()));
                    }
                }
            }
            NodeKind::Negation(q) => {
                if let Some(at) = q.input_tokens.iter().position(|t| t == token) {
                    q.input_tokens.remove(at);
                    if q.input_tokens.is_empty() {
                        effects.push((Polarity::Insert, Token::empty()));
                    }
                }
            }
            NodeKind::Predicate(p) => {
                if let Some(at) = p.tokens.iter().position(|t| t == token) {
                    p.tokens.remove(at);
                    effects.push((Polarity::Remove, token.clone()));
                }
            }
            NodeKind::Action(a) => {
                if let Some(at) = a.tokens.iter().position(|t| t == token) {
                    a.tokens.remove(at);
                    agenda.schedule_retraction(a.action, token.clone());
                }
            }
        }

        self.apply_effects(agenda, node, effects);
        self.has_matches(node)
    }

    /// Whether the node currently produces at least one output match.
    #[must_use]
    pub fn has_matches(&self, node: NodeId) -> bool {
        match &self.nodes[node].kind {
            NodeKind::Filter(f) => !f.tokens.is_empty(),
            NodeKind::Join(j) => j.left_tokens.iter().any(|l| {
                j.right_tokens
                    .iter()
                    .any(|r| j.bindings.satisfied(l, r))
            }),
            NodeKind::ExistentialJoin(j) => j.left_tokens.iter().any(|(_, count)| *count > 0),
            NodeKind::NegationJoin(j) => j.left_tokens.iter().any(|(_, count)| *count == 0),
            NodeKind::Existential(q) => !q.input_tokens.is_empty(),
            NodeKind::Negation(q) => q.input_tokens.is_empty(),
            NodeKind::Predicate(p) => !p.tokens.is_empty(),
            NodeKind::Action(a) => !a.tokens.is_empty(),
        }
    }

    /// Replays the matches `node` currently holds into one newly attached
    /// output. Invoked whenever a consumer binds to a live node.
    pub(crate) fn replay_into(&mut self, agenda: &mut Agenda, node: NodeId, output: NodeId) {
        let replays: Vec<Token> = match &self.nodes[node].kind {
            NodeKind::Filter(f) => f.tokens.clone(),
            NodeKind::Join(j) => {
                let mut merged = Vec::new();
                for l in &j.left_tokens {
                    for r in &j.right_tokens {
                        if j.bindings.satisfied(l, r) {
                            merged.push(Token::merge(l, r));
                        }
                    }
                }
                merged
            }
            NodeKind::ExistentialJoin(j) => j
                .left_tokens
                .iter()
                .filter(|(_, count)| *count > 0)
                .map(|(l, _)| l.clone())
                .collect(),
            NodeKind::NegationJoin(j) => j
                .left_tokens
                .iter()
                .filter(|(_, count)| *count == 0)
                .map(|(l, _)| l.clone())
                .collect(),
            NodeKind::Existential(q) => {
                if q.input_tokens.is_empty() {
                    Vec::new()
                } else {
                    vec![Token::empty()]
                }
            }
            NodeKind::Negation(q) => {
                if q.input_tokens.is_empty() {
                    vec![Token::empty()]
                } else {
                    Vec::new()
                }
            }
            NodeKind::Predicate(p) => p.tokens.clone(),
            NodeKind::Action(_) => Vec::new(),
        };

        for token in replays {
            self.insert_token(agenda, output, token, node);
        }
    }

    // ------------------------------------------------------------------
    // Construction: sharing-aware make_* surface
    // ------------------------------------------------------------------

    /// Finds or creates the filter node for `test`. A newly created filter
    /// is seeded from the current working memory.
    pub fn make_filter(&mut self, test: FactTest, working_memory: &[Rc<Fact>]) -> NodeId {
        for &id in &self.filters {
            if let NodeKind::Filter(f) = &self.nodes[id].kind {
                if f.test == test {
                    return id;
                }
            }
        }

        let mut tokens = Vec::new();
        for fact in working_memory {
            if test.matches(fact) {
                tokens.push(Token::unit(Rc::clone(fact)));
            }
        }
        let id = self.nodes.insert(NodeEntry::new(
            NodeKind::Filter(FilterNode { test, tokens }),
            1,
            1,
        ));
        self.filters.push(id);
        id
    }

    /// Finds or creates a concatenating join of `left` and `right` under
    /// `bindings`.
    pub fn make_join(
        &mut self,
        agenda: &mut Agenda,
        bindings: Bindings,
        left: NodeId,
        right: NodeId,
    ) -> NodeId {
        if let Some(existing) = self.find_counted_or_join(left, right, &bindings, JoinFamily::Join)
        {
            return existing;
        }

        let width = self.width(left) + self.width(right);
        let conds = self.conds(left) + self.conds(right);
        let id = self.nodes.insert(NodeEntry::new(
            NodeKind::Join(JoinNode {
                bindings,
                left,
                right,
                left_tokens: Vec::new(),
                right_tokens: Vec::new(),
            }),
            width,
            conds,
        ));
        self.attach_join(agenda, id, left, right);
        id
    }

    /// Finds or creates an existential join: emits the left token while at
    /// least one right partner satisfies the bindings.
    pub fn make_existential_join(
        &mut self,
        agenda: &mut Agenda,
        bindings: Bindings,
        left: NodeId,
        right: NodeId,
    ) -> NodeId {
        if let Some(existing) =
            self.find_counted_or_join(left, right, &bindings, JoinFamily::Existential)
        {
            return existing;
        }

        let width = self.width(left);
        let conds = self.conds(left) + self.conds(right);
        let id = self.nodes.insert(NodeEntry::new(
            NodeKind::ExistentialJoin(CountedJoinNode {
                bindings,
                left,
                right,
                left_tokens: Vec::new(),
                right_tokens: Vec::new(),
            }),
            width,
            conds,
        ));
        self.attach_join(agenda, id, left, right);
        id
    }

    /// Finds or creates a negation join: emits the left token while *no*
    /// right partner satisfies the bindings.
    pub fn make_negation_join(
        &mut self,
        agenda: &mut Agenda,
        bindings: Bindings,
        left: NodeId,
        right: NodeId,
    ) -> NodeId {
        if let Some(existing) =
            self.find_counted_or_join(left, right, &bindings, JoinFamily::Negation)
        {
            return existing;
        }

        let width = self.width(left);
        let conds = self.conds(left) + self.conds(right);
        let id = self.nodes.insert(NodeEntry::new(
            NodeKind::NegationJoin(CountedJoinNode {
                bindings,
                left,
                right,
                left_tokens: Vec::new(),
                right_tokens: Vec::new(),
            }),
            width,
            conds,
        ));
        self.attach_join(agenda, id, left, right);
        id
    }

    /// Finds or creates the zero-width existential over `input`.
    pub fn make_existential(&mut self, agenda: &mut Agenda, input: NodeId) -> NodeId {
        for &out in self.nodes[input].outputs.iter() {
            if matches!(self.nodes[out].kind, NodeKind::Existential(_)) {
                return out;
            }
        }
        let conds = self.conds(input);
        let id = self.nodes.insert(NodeEntry::new(
            NodeKind::Existential(QuantifierNode {
                input,
                input_tokens: Vec::new(),
            }),
            0,
            conds,
        ));
        self.attach_single(agenda, id, input);
        id
    }

    /// Finds or creates the zero-width negation over `input`.
    pub fn make_negation(&mut self, agenda: &mut Agenda, input: NodeId) -> NodeId {
        for &out in self.nodes[input].outputs.iter() {
            if matches!(self.nodes[out].kind, NodeKind::Negation(_)) {
                return out;
            }
        }
        let conds = self.conds(input);
        let id = self.nodes.insert(NodeEntry::new(
            NodeKind::Negation(QuantifierNode {
                input,
                input_tokens: Vec::new(),
            }),
            0,
            conds,
        ));
        self.attach_single(agenda, id, input);
        id
    }

    /// Finds or creates a variable-to-literal predicate.
    pub fn make_predicate_vc(
        &mut self,
        agenda: &mut Agenda,
        op: PredicateOp,
        lhs: TokenIndex,
        rhs: crate::symbol::Symbol,
        input: NodeId,
    ) -> NodeId {
        self.make_predicate(agenda, op, lhs, PredicateRhs::Literal(rhs), input)
    }

    /// Finds or creates a variable-to-variable predicate.
    pub fn make_predicate_vv(
        &mut self,
        agenda: &mut Agenda,
        op: PredicateOp,
        lhs: TokenIndex,
        rhs: TokenIndex,
        input: NodeId,
    ) -> NodeId {
        self.make_predicate(agenda, op, lhs, PredicateRhs::Index(rhs), input)
    }

    fn make_predicate(
        &mut self,
        agenda: &mut Agenda,
        op: PredicateOp,
        lhs: TokenIndex,
        rhs: PredicateRhs,
        input: NodeId,
    ) -> NodeId {
        for &out in self.nodes[input].outputs.iter() {
            if let NodeKind::Predicate(p) = &self.nodes[out].kind {
                if p.op == op && p.lhs == lhs && p.rhs == rhs && p.input == input {
                    return out;
                }
            }
        }
        let width = self.width(input);
        let conds = self.conds(input);
        let id = self.nodes.insert(NodeEntry::new(
            NodeKind::Predicate(PredicateNode {
                op,
                lhs,
                rhs,
                input,
                tokens: Vec::new(),
            }),
            width,
            conds,
        ));
        self.attach_single(agenda, id, input);
        id
    }

    /// Creates an action node. Actions are never shared: each carries its
    /// own identity and its own agenda entries.
    pub fn make_action(
        &mut self,
        agenda: &mut Agenda,
        action: ActionId,
        input: NodeId,
        variables: Rc<VariableIndices>,
    ) -> NodeId {
        let width = self.width(input);
        let conds = self.conds(input);
        let id = self.nodes.insert(NodeEntry::new(
            NodeKind::Action(ActionNode {
                action,
                input,
                tokens: Vec::new(),
                variables,
            }),
            width,
            conds,
        ));
        self.attach_single(agenda, id, input);
        id
    }

    fn attach_single(&mut self, agenda: &mut Agenda, id: NodeId, input: NodeId) {
        self.nodes[input].outputs.push(id);
        self.replay_into(agenda, input, id);
    }

    fn attach_join(&mut self, agenda: &mut Agenda, id: NodeId, left: NodeId, right: NodeId) {
        self.nodes[left].outputs.push(id);
        if left != right {
            self.nodes[right].outputs.push(id);
        }
        // Left side first: the right store is empty, so nothing is emitted
        // until the right replay joins against the settled left store. A
        // shared input replays once; each token runs both join phases.
        self.replay_into(agenda, left, id);
        if left != right {
            self.replay_into(agenda, right, id);
        }
    }

    fn find_counted_or_join(
        &self,
        left: NodeId,
        right: NodeId,
        bindings: &Bindings,
        family: JoinFamily,
    ) -> Option<NodeId> {
        for &out in self.nodes[left].outputs.iter() {
            let found = match (&self.nodes[out].kind, family) {
                (NodeKind::Join(j), JoinFamily::Join) => {
                    j.left == left && j.right == right && j.bindings == *bindings
                }
                (NodeKind::ExistentialJoin(j), JoinFamily::Existential)
                | (NodeKind::NegationJoin(j), JoinFamily::Negation) => {
                    j.left == left && j.right == right && j.bindings == *bindings
                }
                _ => false,
            };
            if found {
                return Some(out);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Destruction
    // ------------------------------------------------------------------

    /// Excises an action node: detaches it from its input and lets the
    /// orphan cascade reclaim every node left without a consumer.
    pub fn excise_action(&mut self, action_node: NodeId) {
        debug_assert!(matches!(self.nodes[action_node].kind, NodeKind::Action(_)));
        let input = self.parent_left(action_node);
        self.nodes.remove(action_node);
        if let Some(input) = input {
            self.remove_output_edge(input, action_node);
        }
    }

    /// Removes one output edge; a non-action node left with zero outputs is
    /// destroyed and recursively released from its own inputs.
    fn remove_output_edge(&mut self, node: NodeId, output: NodeId) {
        let Some(entry) = self.nodes.get_mut(node) else {
            return;
        };
        if let Some(at) = entry.outputs.iter().position(|&o| o == output) {
            entry.outputs.remove(at);
        }
        if entry.outputs.is_empty() {
            self.destroy_node(node);
        }
    }

    fn destroy_node(&mut self, node: NodeId) {
        let left = self.parent_left(node);
        let right = self.parent_right(node);
        let was_filter = self.is_filter(node);
        self.nodes.remove(node);
        if was_filter {
            self.filters.retain(|&f| f != node);
        }
        if let Some(left) = left {
            self.remove_output_edge(left, node);
        }
        if let Some(right) = right {
            if Some(right) != left {
                self.remove_output_edge(right, node);
            }
        }
    }
}

/// The three join-family variants, as seen by callers that dispatch on an
/// ancestor's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFamily {
    Join,
    Existential,
    Negation,
}

#[derive(Clone, Copy)]
enum Polarity {
    Insert,
    Remove,
}
