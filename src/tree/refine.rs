//! Refinement operations: split, unsplit, and fringe creation.
//!
//! These edit a live, shared network while preserving every other rule's
//! addressing. Each operation runs with the agenda locked and is
//! transactional: everything fallible (case dispatch, the full variable
//! remap, the feature-axis correction) is computed before the first node is
//! created, so a failed request leaves both the network and the tree exactly
//! as they were.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::{ActionId, Engine};
use crate::error::{GraftResult, RefineError};
use crate::feature::{ConditionJoin, Feature};
use crate::monitor::EventKind;
use crate::network::builder::pattern_slots;
use crate::network::{JoinFamily, NodeId};
use crate::stats::{QValue, QValueHandle, QValueKind};
use crate::token::{Bindings, TokenIndex, VariableIndices};

use super::{ValueNode, ValueNodeId, ValueNodeKind};

/// What seeds a new fringe candidate.
#[derive(Debug)]
pub enum FringeSource {
    /// A fresh candidate authored directly against the leaf's own variable
    /// map.
    Feature(Feature),
    /// Re-derive an existing value node's discriminator under the leaf,
    /// remapping its indices into the leaf's chain.
    Node(ValueNodeId),
    /// Re-derive with a replacement feature (range halving and the like).
    NodeWith(ValueNodeId, Feature),
}

/// The precomputed, infallible construction recipe for one fringe graft.
struct FringePlan {
    feature: Feature,
    graft: Graft,
    variables: Rc<VariableIndices>,
}

enum Graft {
    /// Case 1: attach a predicate to the leaf's chain.
    Predicate,
    /// Cases 2 and 3: attach a join-family node.
    Join {
        family: JoinFamily,
        bindings: Bindings,
        right: NodeId,
    },
    /// Fresh condition authored against the leaf: filter then join.
    Condition {
        family: JoinFamily,
        bindings: Bindings,
        test: crate::fact::FactTest,
    },
}

impl Engine {
    /// Commits `node`'s feature as a permanent discriminator.
    ///
    /// Statistics are promoted in place: a node that already carried
    /// committed statistics keeps them (the type tag flips to split); a pure
    /// fringe gets a fresh record at its depth and its refinement
    /// accumulators restart. A new action is created as a structural sibling
    /// of the node's action and registered under `parent`'s children. The
    /// source node itself is *not* excised; that stays the caller's call.
    pub fn create_split(
        &mut self,
        node: ValueNodeId,
        parent: Option<ValueNodeId>,
    ) -> GraftResult<ValueNodeId> {
        self.agenda.lock();
        let result = self.promote(node, parent, QValueKind::Split);
        self.agenda.unlock();
        if result.is_ok() {
            self.run_agenda()?;
        }
        result
    }

    /// Stops refining a branch: builds a terminal unsplit node at the same
    /// depth, carrying forward (never duplicating) the statistics and any
    /// outstanding fringe candidates, with the split-decision accumulators
    /// cleared so future decisions restart cleanly at this depth.
    pub fn create_unsplit(
        &mut self,
        node: ValueNodeId,
        parent: Option<ValueNodeId>,
    ) -> GraftResult<ValueNodeId> {
        self.agenda.lock();
        let result = self.promote(node, parent, QValueKind::Unsplit);
        self.agenda.unlock();
        if result.is_ok() {
            self.run_agenda()?;
        }
        result
    }

    fn promote(
        &mut self,
        node: ValueNodeId,
        parent: Option<ValueNodeId>,
        target: QValueKind,
    ) -> GraftResult<ValueNodeId> {
        debug_assert!(matches!(target, QValueKind::Split | QValueKind::Unsplit));
        if let Some(parent) = parent {
            let parent_node = self.tree.get(parent).ok_or(RefineError::NodeGone)?;
            if !parent_node.kind.is_split() {
                return Err(RefineError::ParentNotSplit.into());
            }
        }
        let source = self.tree.get(node).ok_or(RefineError::NodeGone)?;
        let old_action_node = source.node;
        let old_action = source.action;
        let variables = Rc::clone(&source.variables);
        let probe = Rc::clone(&source.probe);
        let old_weight = source.weight.clone();
        let depth = probe.borrow().depth;

        let ancestor_left = self
            .network
            .parent_left(old_action_node)
            .expect("action nodes always have an input");

        // Promote statistics in place, or allocate fresh ones at this depth.
        let weight: QValueHandle = match old_weight {
            Some(weight) => {
                weight.borrow_mut().kind = target;
                weight
            }
            None => {
                let feature = probe.borrow().feature.clone();
                {
                    let mut probe = probe.borrow_mut();
                    probe.update_count = 0;
                    probe.sq_error = 0.0;
                }
                Rc::new(RefCell::new(QValue::new(target, depth, feature, self.step)))
            }
        };
        {
            let mut probe = probe.borrow_mut();
            probe.sq_error_post_commit = 0.0;
            if matches!(target, QValueKind::Unsplit) {
                probe.sq_error = 0.0;
            }
        }

        // Outstanding fringe candidates follow an unsplit replacement.
        let carried_fringe = if matches!(target, QValueKind::Unsplit) {
            match self
                .tree
                .get_mut(node)
                .and_then(|n| n.kind.fringe_buckets_mut())
            {
                Some(buckets) => std::mem::take(buckets),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let base_name = self
            .rule_name(old_action)
            .unwrap_or_default()
            .to_string();
        let tag = if matches!(target, QValueKind::Split) { 's' } else { 'u' };
        let new_name = self.derived_name(&base_name, tag);
        let action = ActionId::new();
        let action_node =
            self.network
                .make_action(&mut self.agenda, action, ancestor_left, Rc::clone(&variables));
        self.register_action(action, new_name.clone(), action_node);

        let kind = match target {
            QValueKind::Split => ValueNodeKind::Split {
                children: Vec::new(),
                fringe: Vec::new(),
            },
            _ => ValueNodeKind::Unsplit {
                fringe: carried_fringe,
            },
        };
        let new_id = self.tree.insert(ValueNode {
            action,
            node: action_node,
            parent,
            kind,
            weight: Some(weight),
            probe,
            variables,
        });

        // Re-anchor carried fringe candidates to their new owner.
        let carried: Vec<ValueNodeId> = self
            .tree
            .get(new_id)
            .map(|n| {
                n.kind
                    .fringe_buckets()
                    .iter()
                    .flat_map(|b| b.nodes.iter().copied())
                    .collect()
            })
            .unwrap_or_default();
        for child in carried {
            if let Some(child) = self.tree.get_mut(child) {
                child.parent = Some(new_id);
            }
        }

        if let Some(parent) = parent {
            if let Some(ValueNodeKind::Split { children, .. }) =
                self.tree.get_mut(parent).map(|p| &mut p.kind)
            {
                children.push(new_id);
            }
        }

        self.emit_with(|| {
            if matches!(target, QValueKind::Split) {
                EventKind::SplitCommitted {
                    rule: new_name.clone(),
                    depth,
                }
            } else {
                EventKind::UnsplitCommitted {
                    rule: new_name.clone(),
                    depth,
                }
            }
        });
        Ok(new_id)
    }

    /// Speculatively extends an unsplit leaf with one candidate
    /// discriminator.
    ///
    /// Dispatch follows the fixed precedence: Case 1 attaches a predicate
    /// when the feature refines an already-bound slot; Case 2 re-gates a
    /// fact the token already reaches through another path (same token
    /// owner), reusing the existing binding set; Case 3 grafts a brand-new
    /// join, shifting every row index at or beyond the insertion point and
    /// re-deriving the variable map and the feature's own axis.
    pub fn create_fringe(
        &mut self,
        leaf: ValueNodeId,
        source: FringeSource,
    ) -> GraftResult<ValueNodeId> {
        self.agenda.lock();
        let result = self.graft_fringe(leaf, source);
        self.agenda.unlock();
        if result.is_ok() {
            self.run_agenda()?;
        }
        result
    }

    fn graft_fringe(
        &mut self,
        leaf_id: ValueNodeId,
        source: FringeSource,
    ) -> GraftResult<ValueNodeId> {
        let leaf = self.tree.get(leaf_id).ok_or(RefineError::NodeGone)?;
        if !leaf.kind.is_unsplit() {
            return Err(RefineError::LeafNotUnsplit.into());
        }
        let leaf_action = leaf.action;
        let leaf_action_node = leaf.node;
        let leaf_vars = Rc::clone(&leaf.variables);
        let leaf_depth = leaf.depth();

        let ancestor_left = self
            .network
            .parent_left(leaf_action_node)
            .expect("action nodes always have an input");
        let leaf_conds = self.network.conds(ancestor_left);
        let leaf_width = self.network.width(ancestor_left);

        // Everything fallible happens in here, before any node exists.
        let plan = match source {
            FringeSource::Feature(feature) => {
                self.plan_fresh_fringe(feature, &leaf_vars, leaf_conds, leaf_width)?
            }
            FringeSource::Node(source) => {
                self.plan_derived_fringe(source, None, &leaf_vars, ancestor_left)?
            }
            FringeSource::NodeWith(source, feature) => {
                self.plan_derived_fringe(source, Some(feature), &leaf_vars, ancestor_left)?
            }
        };
        let FringePlan {
            mut feature,
            graft,
            variables,
        } = plan;
        feature.indices = Rc::clone(&variables);

        let new_test = match graft {
            Graft::Predicate => {
                let (op, literal) = feature.test.predicate_parts();
                self.network
                    .make_predicate_vc(&mut self.agenda, op, feature.axis, literal, ancestor_left)
            }
            Graft::Join {
                family,
                bindings,
                right,
            } => self.make_join_family(family, bindings, ancestor_left, right),
            Graft::Condition {
                family,
                bindings,
                test,
            } => {
                let wm: Vec<_> = self.working_memory().to_vec();
                let right = self.network.make_filter(test, &wm);
                self.make_join_family(family, bindings, ancestor_left, right)
            }
        };

        let leaf_rule = self
            .rule_name(leaf_action)
            .unwrap_or_default()
            .to_string();
        let new_name = self.derived_name(&leaf_rule, 'f');
        let action = ActionId::new();
        let action_node =
            self.network
                .make_action(&mut self.agenda, action, new_test, Rc::clone(&variables));
        self.register_action(action, new_name.clone(), action_node);

        let seed = self.tree.stacked_summary(leaf_id);
        let probe = QValue::seeded(
            QValueKind::Fringe,
            leaf_depth + 1,
            Some(feature.clone()),
            self.step,
            &seed,
        );
        let id = self.tree.insert(ValueNode {
            action,
            node: action_node,
            parent: Some(leaf_id),
            kind: ValueNodeKind::Fringe,
            weight: None,
            probe: Rc::new(RefCell::new(probe)),
            variables,
        });
        self.tree.add_fringe(leaf_id, &feature, id);

        self.emit_with(|| EventKind::FringeCreated {
            rule: new_name.clone(),
            depth: leaf_depth + 1,
            feature: feature.to_string(),
        });
        Ok(id)
    }

    fn make_join_family(
        &mut self,
        family: JoinFamily,
        bindings: Bindings,
        left: NodeId,
        right: NodeId,
    ) -> NodeId {
        match family {
            JoinFamily::Join => self.network.make_join(&mut self.agenda, bindings, left, right),
            JoinFamily::Existential => {
                self.network
                    .make_existential_join(&mut self.agenda, bindings, left, right)
            }
            JoinFamily::Negation => {
                self.network
                    .make_negation_join(&mut self.agenda, bindings, left, right)
            }
        }
    }

    /// A candidate authored against the leaf itself: its indices are already
    /// in the leaf's row space, so no offsets apply. With a condition the
    /// feature's axis lands on the freshly appended row.
    fn plan_fresh_fringe(
        &self,
        mut feature: Feature,
        leaf_vars: &Rc<VariableIndices>,
        leaf_conds: usize,
        leaf_width: usize,
    ) -> GraftResult<FringePlan> {
        let Some(condition) = feature.condition.clone() else {
            // Case 1: the axis is already a bound slot of the leaf's token.
            if feature.axis.existential || feature.axis.token_row >= leaf_width {
                return Err(RefineError::AmbiguousRefinement {
                    variable: feature.axis.to_string(),
                }
                .into());
            }
            return Ok(FringePlan {
                feature,
                graft: Graft::Predicate,
                variables: Rc::clone(leaf_vars),
            });
        };

        let (test, slots) = pattern_slots(&condition.pattern);
        let family = match condition.join {
            ConditionJoin::Join => JoinFamily::Join,
            ConditionJoin::Existential => JoinFamily::Existential,
            ConditionJoin::Negation => JoinFamily::Negation,
        };
        let widening = matches!(family, JoinFamily::Join);

        let mut bindings = Vec::new();
        let mut variables = (**leaf_vars).clone();
        let mut seen: Vec<&str> = Vec::new();
        for (name, column) in &slots {
            if !seen.contains(&name.as_str()) {
                if let Some(bound) = leaf_vars.first_bound(name) {
                    bindings.push((bound, TokenIndex::new(0, 0, *column)));
                }
                seen.push(name);
            }
            variables.insert(
                name.clone(),
                TokenIndex {
                    cond_row: leaf_conds,
                    token_row: leaf_width,
                    column: *column,
                    existential: !widening,
                },
            );
        }

        // The discriminator's axis is the new condition's row.
        feature.axis = TokenIndex {
            cond_row: leaf_conds,
            token_row: leaf_width,
            column: feature.axis.column,
            existential: !widening,
        };

        Ok(FringePlan {
            feature,
            graft: Graft::Condition {
                family,
                bindings: Bindings(bindings),
                test,
            },
            variables: Rc::new(variables),
        })
    }

    /// Re-derives an existing node's test chain under the leaf, walking its
    /// ancestry to pick the case and remapping every index the width shift
    /// touches. `ancestor_left` is the leaf's test chain.
    fn plan_derived_fringe(
        &self,
        source: ValueNodeId,
        feature_override: Option<Feature>,
        leaf_vars: &Rc<VariableIndices>,
        ancestor_left: NodeId,
    ) -> GraftResult<FringePlan> {
        let leaf_conds = self.network.conds(ancestor_left);
        let leaf_width = self.network.width(ancestor_left);

        let source = self.tree.get(source).ok_or(RefineError::NodeGone)?;
        let mut feature = match feature_override {
            Some(feature) => feature,
            None => source
                .probe
                .borrow()
                .feature
                .clone()
                .ok_or(RefineError::MissingFeature)?,
        };
        let src_action_node = source.node;
        let src_vars = Rc::clone(&source.variables);

        let ancestor_right = self
            .network
            .parent_left(src_action_node)
            .expect("action nodes always have an input");
        let old_conds = self.network.conds(src_action_node);
        let old_width = self.network.width(src_action_node);

        // Deep ranged refinements sit behind their earlier halvings; walk
        // through join ancestors to the test that actually owns the axis.
        let mut ancestor_rightmost = ancestor_right;
        if feature.test.divisions() > 1 {
            while !self.network.is_filter(ancestor_rightmost)
                && !self.network.is_predicate(ancestor_rightmost)
            {
                ancestor_rightmost = self
                    .network
                    .parent_right(ancestor_rightmost)
                    .expect("non-filter nodes always have inputs");
            }
        }

        if self.network.is_predicate(ancestor_rightmost) {
            // Case 1: refining a variable the shared prefix already binds;
            // the axis needs no correction.
            return Ok(FringePlan {
                feature,
                graft: Graft::Predicate,
                variables: Rc::clone(leaf_vars),
            });
        }

        let bindings = self
            .network
            .bindings_of(ancestor_right)
            .cloned()
            .ok_or(RefineError::UnrefinableAncestor)?;
        let right = self
            .network
            .parent_right(ancestor_right)
            .ok_or(RefineError::UnrefinableAncestor)?;
        let src_family = self
            .network
            .join_family(ancestor_right)
            .ok_or(RefineError::UnrefinableAncestor)?;

        // Case 2 test: is the needed fact already joined into the leaf's
        // token at an equivalent row via a different path?
        let target_owner = self.network.token_owner(ancestor_right);
        let mut ancestor_found = false;
        let mut cursor = ancestor_left;
        loop {
            if self.network.is_filter(cursor) {
                break;
            }
            let Some(up) = self.network.parent_left(cursor) else {
                break;
            };
            if self.network.token_owner(up) == target_owner {
                ancestor_found = true;
                break;
            }
            cursor = up;
        }

        let family = if ancestor_found {
            // Case 2: no new conditions to carry over; re-gate on the
            // existing binding set.
            match src_family {
                JoinFamily::Negation => JoinFamily::Negation,
                _ => JoinFamily::Existential,
            }
        } else {
            // Case 3: the condition genuinely joins in for the first time.
            src_family
        };

        let new_conds = leaf_conds + self.network.conds(right);
        let new_width = match family {
            JoinFamily::Join => leaf_width + self.network.width(right),
            _ => leaf_width,
        };

        let variables = self.remap_variables(
            &src_vars,
            leaf_vars,
            self.network
                .parent_left(ancestor_right)
                .map_or(0, |base| self.network.conds(base)),
            RowSpans {
                leaf_conds,
                leaf_width,
                old_conds,
                old_width,
                new_conds,
                new_width,
            },
        )?;

        // The feature's own axis shifts by the same rule as every other
        // index at or beyond the insertion point.
        let d_conds = new_conds as i64 - old_conds as i64;
        let d_width = new_width as i64 - old_width as i64;
        let cond_row = feature.axis.cond_row as i64 + d_conds;
        let token_row = feature.axis.token_row as i64 + d_width;
        if cond_row < 0 || token_row < 0 {
            return Err(RefineError::AmbiguousRefinement {
                variable: feature.axis.to_string(),
            }
            .into());
        }
        feature.axis.cond_row = usize::try_from(cond_row).expect("checked non-negative");
        feature.axis.token_row = usize::try_from(token_row).expect("checked non-negative");
        debug_assert!(feature.axis.cond_row < new_conds);
        debug_assert!(feature.axis.existential || feature.axis.token_row < new_width);

        Ok(FringePlan {
            feature,
            graft: Graft::Join {
                family,
                bindings,
                right,
            },
            variables,
        })
    }

    /// Re-derives the source chain's variable map into the leaf's row space.
    /// Indices before the insertion point are unchanged; indices at or after
    /// it are offset by the width delta (forward or backward); an index that
    /// lands inside the discarded span is dropped rather than mapped to
    /// garbage.
    fn remap_variables(
        &self,
        src_vars: &VariableIndices,
        leaf_vars: &Rc<VariableIndices>,
        shared_prefix_conds: usize,
        spans: RowSpans,
    ) -> GraftResult<Rc<VariableIndices>> {
        let d_conds = spans.new_conds as i64 - spans.old_conds as i64;
        let d_width = spans.new_width as i64 - spans.old_width as i64;

        let mut rebuilt: Option<VariableIndices> = None;
        for (name, index) in src_vars.iter() {
            // Variables of the shared prefix are already addressed
            // correctly by the leaf's own map.
            if index.cond_row < shared_prefix_conds {
                continue;
            }
            if leaf_vars.first_bound(name).is_some() {
                continue;
            }

            let mut remapped = *index;
            let mut dropped = false;

            if d_conds >= 0 {
                remapped.cond_row += d_conds as usize;
            } else if remapped.cond_row >= spans.leaf_conds {
                let back = (-d_conds) as usize;
                if remapped.cond_row >= spans.leaf_conds + back {
                    remapped.cond_row -= back;
                } else {
                    dropped = true;
                }
            }

            if !dropped {
                if d_width >= 0 {
                    remapped.token_row += d_width as usize;
                } else if remapped.token_row >= spans.leaf_width {
                    let back = (-d_width) as usize;
                    if remapped.token_row >= spans.leaf_width + back {
                        remapped.token_row -= back;
                    } else {
                        dropped = true;
                    }
                }
            }

            if dropped {
                continue;
            }

            debug_assert!(remapped.cond_row < spans.new_conds);
            debug_assert!(remapped.existential || remapped.token_row < spans.new_width);

            let map = rebuilt.get_or_insert_with(|| (**leaf_vars).clone());
            if !remapped.existential && map.first_bound(name).is_some() {
                return Err(RefineError::AmbiguousRefinement {
                    variable: name.to_string(),
                }
                .into());
            }
            debug_assert!(!map.contains_index(&remapped));
            map.insert(name.to_string(), remapped);
        }

        Ok(match rebuilt {
            Some(map) => Rc::new(map),
            None => Rc::clone(leaf_vars),
        })
    }
}

/// Row-space extents involved in one fringe graft.
#[derive(Clone, Copy)]
struct RowSpans {
    leaf_conds: usize,
    leaf_width: usize,
    old_conds: usize,
    old_width: usize,
    new_conds: usize,
    new_width: usize,
}
