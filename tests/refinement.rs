//! Value-tree refinement scenarios: fringe expansion, commits, collapses,
//! and the index remapping that keeps addressing correct across width
//! shifts.

use std::rc::Rc;

use graft::{
    Column, Condition, ConditionJoin, Engine, Fact, Feature, FeatureTest, FringeSource, GraftError,
    Identifier, QValueKind, RefineError, RuleSpec, Symbol, TokenIndex, Validator,
};

fn var(name: &str) -> Symbol {
    Symbol::variable(name)
}

fn on_rule(name: &str) -> RuleSpec {
    RuleSpec::new(
        name,
        vec![Condition::Pattern(Fact::new(var("x"), "on", var("y")))],
    )
}

fn on_mass_rule(name: &str) -> RuleSpec {
    RuleSpec::new(
        name,
        vec![
            Condition::Pattern(Fact::new(var("x"), "on", var("y"))),
            Condition::Pattern(Fact::new(var("x"), "mass", var("m"))),
        ],
    )
}

fn leaf_variables(engine: &Engine, leaf: graft::ValueNodeId) -> Rc<graft::VariableIndices> {
    Rc::clone(&engine.tree().get(leaf).unwrap().variables)
}

#[test]
fn two_fringe_features_stay_independent_until_committed() {
    let mut engine = Engine::new();
    let root = engine.add_value_rule(&on_mass_rule("value")).unwrap();
    let root_vars = leaf_variables(&engine, root);

    // Depth 1 -> 2: one committed refinement to get a depth-2 leaf.
    let axis_y = root_vars.first_bound("y").unwrap();
    let table = Identifier::new();
    let f0 = engine
        .create_fringe(
            root,
            FringeSource::Feature(Feature::bound(
                axis_y,
                FeatureTest::Enumerated {
                    value: Symbol::Identifier(table),
                },
                Rc::clone(&root_vars),
            )),
        )
        .unwrap();
    let split_root = engine.create_split(root, None).unwrap();
    let leaf = engine.create_unsplit(f0, Some(split_root)).unwrap();
    engine.excise_value_node(root).unwrap();

    assert_eq!(engine.tree().get(leaf).unwrap().depth(), 2);

    // Two untried features: F1 enumerated, F2 ranged.
    let leaf_vars = leaf_variables(&engine, leaf);
    let f1 = engine
        .create_fringe(
            leaf,
            FringeSource::Feature(Feature::bound(
                leaf_vars.first_bound("y").unwrap(),
                FeatureTest::Enumerated {
                    value: Symbol::Identifier(Identifier::new()),
                },
                Rc::clone(&leaf_vars),
            )),
        )
        .unwrap();
    let f2 = engine
        .create_fringe(
            leaf,
            FringeSource::Feature(Feature::bound(
                leaf_vars.first_bound("m").unwrap(),
                FeatureTest::Ranged {
                    lower: 0.0,
                    upper: 16.0,
                    divisions: 1,
                    integer: true,
                    upper_half: false,
                },
                Rc::clone(&leaf_vars),
            )),
        )
        .unwrap();

    // Two sibling fringe nodes at depth 3, one bucket each, disjoint
    // statistics storage.
    let node1 = engine.tree().get(f1).unwrap();
    let node2 = engine.tree().get(f2).unwrap();
    assert!(node1.kind.is_fringe());
    assert!(node2.kind.is_fringe());
    assert_eq!(node1.depth(), 3);
    assert_eq!(node2.depth(), 3);
    assert!(!Rc::ptr_eq(&node1.probe, &node2.probe));
    assert_eq!(
        engine.tree().get(leaf).unwrap().kind.fringe_buckets().len(),
        2
    );

    // Committing F1 leaves F2's fringe node and statistics untouched.
    let before = engine.q_probe(f2).unwrap().borrow().clone();
    let committed = engine.create_split(f1, Some(split_root)).unwrap();
    assert!(engine.tree().get(committed).unwrap().kind.is_split());
    let after = engine.q_probe(f2).unwrap().borrow().clone();
    assert_eq!(before, after);
    assert!(engine.tree().get(f2).unwrap().kind.is_fringe());
}

#[test]
fn split_conserves_existing_statistics_and_zeroes_fresh_ones() {
    let mut engine = Engine::new();
    let root = engine.add_value_rule(&on_rule("value")).unwrap();

    {
        let weight = engine.q_weight(root).unwrap();
        let mut weight = weight.borrow_mut();
        weight.estimate = 3.25;
        weight.update_count = 7;
    }

    // Promoting a node that already carries statistics relocates them.
    let split = engine.create_split(root, None).unwrap();
    let promoted = engine.q_weight(split).unwrap();
    assert!(Rc::ptr_eq(&promoted, &engine.q_weight(root).unwrap()));
    assert_eq!(promoted.borrow().kind, QValueKind::Split);
    assert!((promoted.borrow().estimate - 3.25).abs() < f64::EPSILON);
    assert_eq!(promoted.borrow().update_count, 7);
    engine.excise_value_node(root).unwrap();

    // A pure fringe starts from zero instead.
    let leaf_vars = leaf_variables(&engine, split);
    let _ = leaf_vars; // split nodes cannot grow fringes; build a leaf first
    let root2 = engine.add_value_rule(&on_rule("value-2")).unwrap();
    let vars2 = leaf_variables(&engine, root2);
    let fringe = engine
        .create_fringe(
            root2,
            FringeSource::Feature(Feature::bound(
                vars2.first_bound("y").unwrap(),
                FeatureTest::Enumerated {
                    value: Symbol::Identifier(Identifier::new()),
                },
                vars2,
            )),
        )
        .unwrap();
    {
        let probe = engine.q_probe(fringe).unwrap();
        let mut probe = probe.borrow_mut();
        probe.update_count = 11;
        probe.sq_error = 2.5;
    }
    let committed = engine.create_split(fringe, None).unwrap();
    let weight = engine.q_weight(committed).unwrap();
    assert_eq!(weight.borrow().kind, QValueKind::Split);
    assert_eq!(weight.borrow().update_count, 0);
    assert!(weight.borrow().estimate.abs() < f64::EPSILON);
    // The shared probe's refinement accumulators restart.
    let probe = engine.q_probe(committed).unwrap();
    assert_eq!(probe.borrow().update_count, 0);
    assert!(probe.borrow().sq_error.abs() < f64::EPSILON);
}

#[test]
fn unsplit_carries_outstanding_fringe_candidates_forward() {
    let mut engine = Engine::new();
    let root = engine.add_value_rule(&on_mass_rule("value")).unwrap();
    let vars = leaf_variables(&engine, root);

    let fringe = engine
        .create_fringe(
            root,
            FringeSource::Feature(Feature::bound(
                vars.first_bound("m").unwrap(),
                FeatureTest::Ranged {
                    lower: 0.0,
                    upper: 8.0,
                    divisions: 1,
                    integer: true,
                    upper_half: true,
                },
                vars,
            )),
        )
        .unwrap();

    let replacement = engine.create_unsplit(root, None).unwrap();
    let carried = engine.tree().get(replacement).unwrap();
    assert_eq!(carried.kind.fringe_buckets().len(), 1);
    assert_eq!(carried.kind.fringe_buckets()[0].nodes, vec![fringe]);
    // The candidate's parent moved with the bucket.
    assert_eq!(engine.tree().get(fringe).unwrap().parent, Some(replacement));
    assert!(engine
        .tree()
        .get(root)
        .unwrap()
        .kind
        .fringe_buckets()
        .is_empty());

    engine.excise_value_node(root).unwrap();
    assert!(engine.tree().get(fringe).is_some());
    assert!(Validator::new().validate(&engine).is_empty());
}

#[test]
fn case_three_graft_shifts_rows_forward_and_corrects_the_axis() {
    let mut engine = Engine::new();

    // Narrow chain: one condition, width 1.
    let leaf1 = engine.add_value_rule(&on_rule("narrow")).unwrap();
    let vars1 = leaf_variables(&engine, leaf1);

    // A conditional feature joins (?y mass ?m) into the match.
    let massy = Feature::conditional(
        TokenIndex::new(0, 0, Column::Value),
        FeatureTest::Enumerated {
            value: Symbol::Int(5),
        },
        Rc::clone(&vars1),
        Fact::new(var("y"), "mass", var("m")),
        ConditionJoin::Join,
    );
    let fringe_src = engine
        .create_fringe(leaf1, FringeSource::Feature(massy))
        .unwrap();

    let src = engine.tree().get(fringe_src).unwrap();
    assert_eq!(
        src.variables.first_bound("m"),
        Some(TokenIndex::new(1, 1, Column::Value))
    );
    assert_eq!(engine.network().width(src.node), 2);

    // Wider leaf: two conditions, width 2.
    let leaf2 = engine
        .add_value_rule(&RuleSpec::new(
            "wide",
            vec![
                Condition::Pattern(Fact::new(var("x"), "on", var("y"))),
                Condition::Pattern(Fact::new(var("x"), "color", var("c"))),
            ],
        ))
        .unwrap();

    // Re-deriving the mass discriminator under the wider leaf inserts a new
    // join; the new row lands after both existing rows.
    let grafted = engine
        .create_fringe(leaf2, FringeSource::Node(fringe_src))
        .unwrap();
    let node = engine.tree().get(grafted).unwrap();
    assert_eq!(
        node.variables.first_bound("m"),
        Some(TokenIndex::new(2, 2, Column::Value))
    );
    // Rows before the insertion point are untouched.
    assert_eq!(
        node.variables.first_bound("c"),
        Some(TokenIndex::new(1, 1, Column::Value))
    );
    let axis = node.probe.borrow().feature.as_ref().unwrap().axis;
    assert_eq!(axis, TokenIndex::new(2, 2, Column::Value));
    assert_eq!(engine.network().width(node.node), 3);

    // Round trip: the remapped index resolves to the same fact value the
    // original binding resolved to.
    let (block, table) = (Identifier::new(), Identifier::new());
    engine.insert_fact(Fact::new(block, "on", table)).unwrap();
    engine.insert_fact(Fact::new(block, "color", "red")).unwrap();
    engine.insert_fact(Fact::new(table, "mass", 5i64)).unwrap();

    let wide_matches = engine.matches_of(engine.tree().get(grafted).unwrap().action);
    assert_eq!(wide_matches.len(), 1);
    let narrow_matches = engine.matches_of(engine.tree().get(fringe_src).unwrap().action);
    assert_eq!(narrow_matches.len(), 1);
    let via_new = wide_matches[0].resolve(&TokenIndex::new(2, 2, Column::Value));
    let via_old = narrow_matches[0].resolve(&TokenIndex::new(1, 1, Column::Value));
    assert_eq!(via_new, via_old);
    assert_eq!(*via_new, Symbol::Int(5));

    assert!(Validator::new().validate(&engine).is_empty());
}

#[test]
fn collapsing_graft_shifts_rows_backward() {
    let mut engine = Engine::new();

    let leaf1 = engine.add_value_rule(&on_rule("narrow")).unwrap();
    let vars1 = leaf_variables(&engine, leaf1);
    let leaf2 = engine
        .add_value_rule(&RuleSpec::new(
            "wide",
            vec![
                Condition::Pattern(Fact::new(var("x"), "on", var("y"))),
                Condition::Pattern(Fact::new(var("x"), "color", var("c"))),
            ],
        ))
        .unwrap();
    let vars2 = leaf_variables(&engine, leaf2);
    let _ = vars1;

    // Build the discriminator on the wide chain first (width 2 -> 3).
    let massy = Feature::conditional(
        TokenIndex::new(0, 0, Column::Value),
        FeatureTest::Enumerated {
            value: Symbol::Int(5),
        },
        vars2,
        Fact::new(var("y"), "mass", var("m")),
        ConditionJoin::Join,
    );
    let wide_fringe = engine
        .create_fringe(leaf2, FringeSource::Feature(massy))
        .unwrap();
    assert_eq!(
        engine
            .tree()
            .get(wide_fringe)
            .unwrap()
            .variables
            .first_bound("m"),
        Some(TokenIndex::new(2, 2, Column::Value))
    );

    // Re-deriving it under the narrow leaf collapses the width: the mass
    // row slides back by the removed span.
    let filters_before = engine.network().filters().len();
    let narrow_fringe = engine
        .create_fringe(leaf1, FringeSource::Node(wide_fringe))
        .unwrap();
    let node = engine.tree().get(narrow_fringe).unwrap();
    assert_eq!(
        node.variables.first_bound("m"),
        Some(TokenIndex::new(1, 1, Column::Value))
    );
    let axis = node.probe.borrow().feature.as_ref().unwrap().axis;
    assert_eq!(axis, TokenIndex::new(1, 1, Column::Value));
    assert_eq!(engine.network().width(node.node), 2);
    // The color binding never existed on the narrow chain and must not leak
    // into the rebuilt map.
    assert_eq!(node.variables.first_bound("c"), None);
    // The mass filter is shared, not recreated.
    assert_eq!(engine.network().filters().len(), filters_before);

    assert!(Validator::new().validate(&engine).is_empty());
}

#[test]
fn refinement_requests_fail_cleanly() {
    let mut engine = Engine::new();
    let root = engine.add_value_rule(&on_rule("value")).unwrap();
    let vars = leaf_variables(&engine, root);

    // A root probe has no feature to re-derive.
    let err = engine
        .create_fringe(root, FringeSource::Node(root))
        .unwrap_err();
    assert!(matches!(
        err,
        GraftError::Refine(RefineError::MissingFeature)
    ));

    // Fringe targets must be unsplit leaves.
    let fringe = engine
        .create_fringe(
            root,
            FringeSource::Feature(Feature::bound(
                vars.first_bound("y").unwrap(),
                FeatureTest::Enumerated {
                    value: Symbol::Identifier(Identifier::new()),
                },
                vars,
            )),
        )
        .unwrap();
    let err = engine
        .create_fringe(
            fringe,
            FringeSource::Node(fringe),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        GraftError::Refine(RefineError::LeafNotUnsplit)
    ));

    // A failed request leaves the tree and network untouched.
    let fingerprint = Validator::new().fingerprint(&engine);
    let err = engine
        .create_fringe(root, FringeSource::Node(root))
        .unwrap_err();
    assert!(matches!(err, GraftError::Refine(_)));
    assert_eq!(Validator::new().fingerprint(&engine), fingerprint);
}

#[test]
fn range_halving_rederives_with_a_replacement_feature() {
    let mut engine = Engine::new();
    let leaf = engine.add_value_rule(&on_mass_rule("value")).unwrap();
    let vars = leaf_variables(&engine, leaf);
    let axis_m = vars.first_bound("m").unwrap();

    let coarse = FeatureTest::Ranged {
        lower: 0.0,
        upper: 16.0,
        divisions: 1,
        integer: true,
        upper_half: false,
    };
    let fringe = engine
        .create_fringe(
            leaf,
            FringeSource::Feature(Feature::bound(axis_m, coarse.clone(), Rc::clone(&vars))),
        )
        .unwrap();

    // Halve the interval and re-derive the finer discriminator under the
    // same leaf.
    let (lower_half, upper_half) = coarse.halves().unwrap();
    assert_eq!(lower_half.divisions(), 2);
    let finer = engine
        .create_fringe(
            leaf,
            FringeSource::NodeWith(fringe, Feature::bound(axis_m, upper_half, vars)),
        )
        .unwrap();

    let node = engine.tree().get(finer).unwrap();
    assert_eq!(node.depth(), 2);
    let feature = node.probe.borrow().feature.clone().unwrap();
    assert!(matches!(
        feature.test,
        FeatureTest::Ranged {
            divisions: 2,
            upper_half: true,
            ..
        }
    ));
    // Distinct bounds mean a distinct bucket.
    assert_eq!(
        engine.tree().get(leaf).unwrap().kind.fringe_buckets().len(),
        2
    );

    // The finer test gates on its half of the interval.
    let (b1, b2, table) = (Identifier::new(), Identifier::new(), Identifier::new());
    engine.insert_fact(Fact::new(b1, "on", table)).unwrap();
    engine.insert_fact(Fact::new(b1, "mass", 3i64)).unwrap();
    engine.insert_fact(Fact::new(b2, "on", table)).unwrap();
    engine.insert_fact(Fact::new(b2, "mass", 12i64)).unwrap();
    let action = engine.tree().get(finer).unwrap().action;
    let matches = engine.matches_of(action);
    assert_eq!(matches.len(), 1);
    assert_eq!(
        *matches[0].resolve(&TokenIndex::new(1, 1, Column::Value)),
        Symbol::Int(12)
    );
}

#[test]
fn conditional_negation_feature_gates_on_absence() {
    let mut engine = Engine::new();
    let leaf = engine.add_value_rule(&on_rule("value")).unwrap();
    let vars = leaf_variables(&engine, leaf);

    // "Nothing sits on ?x": a negated condition joined onto the match.
    let clear = Feature::conditional(
        TokenIndex::new(0, 0, Column::Value),
        FeatureTest::Enumerated {
            value: Symbol::string("clear"),
        },
        vars,
        Fact::new(var("z"), "on", var("x")),
        ConditionJoin::Negation,
    );
    let fringe = engine
        .create_fringe(leaf, FringeSource::Feature(clear))
        .unwrap();
    let action = engine.tree().get(fringe).unwrap().action;

    let (b1, b2, table) = (Identifier::new(), Identifier::new(), Identifier::new());
    engine.insert_fact(Fact::new(b1, "on", table)).unwrap();
    assert_eq!(engine.matches_of(action).len(), 1);
    // The gate does not widen the token.
    assert_eq!(engine.matches_of(action)[0].width(), 1);

    engine.insert_fact(Fact::new(b2, "on", b1)).unwrap();
    // b1 is covered now; b2 is the clear one.
    let matched: Vec<_> = engine
        .matched()
        .iter()
        .filter(|m| m.action == action)
        .collect();
    assert_eq!(matched.len(), 1);
    assert_eq!(**matched[0].token.fact(0), Fact::new(b2, "on", b1));
}

#[test]
fn eligibility_trace_membership_is_purged_on_excision() {
    let mut engine = Engine::new();
    let root = engine.add_value_rule(&on_rule("value")).unwrap();
    let vars = leaf_variables(&engine, root);
    let fringe = engine
        .create_fringe(
            root,
            FringeSource::Feature(Feature::bound(
                vars.first_bound("y").unwrap(),
                FeatureTest::Enumerated {
                    value: Symbol::Identifier(Identifier::new()),
                },
                vars,
            )),
        )
        .unwrap();

    engine.trace_add(root).unwrap();
    engine.trace_add(fringe).unwrap();
    // Adding twice is a no-op.
    engine.trace_add(fringe).unwrap();
    assert_eq!(engine.trace(), &[root, fringe]);
    assert!(engine.q_probe(fringe).unwrap().borrow().eligibility.on_trace);

    engine.excise_value_node(fringe).unwrap();
    assert_eq!(engine.trace(), &[root]);

    engine.trace_clear();
    assert!(engine.trace().is_empty());
    assert!(!engine.q_probe(root).unwrap().borrow().eligibility.on_trace);
}

#[test]
fn fringe_statistics_seed_from_the_ancestor_stack() {
    let mut engine = Engine::new();
    let root = engine.add_value_rule(&on_rule("value")).unwrap();
    {
        let weight = engine.q_weight(root).unwrap();
        weight.borrow_mut().estimate = 1.25;
    }
    let vars = leaf_variables(&engine, root);
    let fringe = engine
        .create_fringe(
            root,
            FringeSource::Feature(Feature::bound(
                vars.first_bound("y").unwrap(),
                FeatureTest::Enumerated {
                    value: Symbol::Identifier(Identifier::new()),
                },
                vars,
            )),
        )
        .unwrap();
    let probe = engine.q_probe(fringe).unwrap();
    assert!((probe.borrow().estimate - 1.25).abs() < f64::EPSILON);
    assert_eq!(probe.borrow().update_count, 0);
    assert_eq!(probe.borrow().kind, QValueKind::Fringe);
}
