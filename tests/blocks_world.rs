//! End-to-end matching scenarios over a small blocks world.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use graft::{
    ActionHandlers, Condition, Engine, EventKind, Fact, Identifier, PredicateOp, RuleSpec, Symbol,
    TestRhs, Validator,
};

fn var(name: &str) -> Symbol {
    Symbol::variable(name)
}

fn stacked_rule() -> RuleSpec {
    RuleSpec::new(
        "stacked",
        vec![
            Condition::Pattern(Fact::new(var("x"), "on", var("y"))),
            Condition::Pattern(Fact::new(var("y"), "on", var("z"))),
        ],
    )
}

#[test]
fn three_block_tower_fires_and_retracts() {
    let fired: Rc<RefCell<Vec<Vec<Fact>>>> = Rc::new(RefCell::new(Vec::new()));
    let retracted: Rc<RefCell<Vec<Vec<Fact>>>> = Rc::new(RefCell::new(Vec::new()));
    let fired_log = Rc::clone(&fired);
    let retracted_log = Rc::clone(&retracted);

    let mut engine = Engine::new();
    let action = engine
        .add_rule(
            &stacked_rule(),
            ActionHandlers::new()
                .on_fire(move |_, firing| {
                    fired_log
                        .borrow_mut()
                        .push(firing.token.facts().map(|f| (**f).clone()).collect());
                    Ok(())
                })
                .on_retract(move |_, firing| {
                    retracted_log
                        .borrow_mut()
                        .push(firing.token.facts().map(|f| (**f).clone()).collect());
                    Ok(())
                }),
        )
        .unwrap();

    let (b1, b2, b3, table) = (
        Identifier::new(),
        Identifier::new(),
        Identifier::new(),
        Identifier::new(),
    );
    engine.insert_fact(Fact::new(b1, "on", table)).unwrap();
    engine.insert_fact(Fact::new(b2, "on", b1)).unwrap();
    engine.insert_fact(Fact::new(b3, "on", b2)).unwrap();

    // (x=B2,y=B1,z=Table) and (x=B3,y=B2,z=B1).
    assert_eq!(engine.matches_of(action).len(), 2);

    // Exactly one firing binds x=B3.
    let tower_top = Fact::new(b3, "on", b2);
    let top_firings: Vec<_> = fired
        .borrow()
        .iter()
        .filter(|facts| facts[0] == tower_top)
        .cloned()
        .collect();
    assert_eq!(top_firings.len(), 1);
    assert_eq!(top_firings[0][1], Fact::new(b2, "on", b1));

    // Removing the middle support retracts every match it took part in and
    // produces no new ones.
    engine.remove_fact(&Fact::new(b2, "on", b1)).unwrap();
    assert!(engine.matches_of(action).is_empty());
    assert_eq!(fired.borrow().len(), 2);
    assert_eq!(retracted.borrow().len(), 2);
    assert!(retracted
        .borrow()
        .iter()
        .any(|facts| facts[0] == tower_top));
}

#[test]
fn identical_rule_fragments_share_one_subgraph() {
    let mut engine = Engine::new();
    engine
        .add_rule(&stacked_rule(), ActionHandlers::new())
        .unwrap();
    let two_rules_baseline = engine.network().node_count();

    // Same two conditions plus one more: everything up to the divergence
    // point is reused (including the single "on" filter), so only one join
    // and one action are added.
    let extended = RuleSpec::new(
        "stacked-3",
        vec![
            Condition::Pattern(Fact::new(var("x"), "on", var("y"))),
            Condition::Pattern(Fact::new(var("y"), "on", var("z"))),
            Condition::Pattern(Fact::new(var("z"), "on", var("w"))),
        ],
    );
    engine.add_rule(&extended, ActionHandlers::new()).unwrap();
    assert_eq!(engine.network().node_count(), two_rules_baseline + 2);

    // A verbatim duplicate shares everything but its action node.
    let duplicate = RuleSpec::new("stacked-again", stacked_rule().conditions);
    engine.add_rule(&duplicate, ActionHandlers::new()).unwrap();
    assert_eq!(engine.network().node_count(), two_rules_baseline + 3);

    assert!(Validator::new().validate(&engine).is_empty());
}

#[test]
fn excision_returns_the_network_to_shared_nodes_only() {
    let mut engine = Engine::new();
    let keep = engine
        .add_rule(&stacked_rule(), ActionHandlers::new())
        .unwrap();
    let baseline = engine.network().node_count();

    let extended = RuleSpec::new(
        "stacked-3",
        vec![
            Condition::Pattern(Fact::new(var("x"), "on", var("y"))),
            Condition::Pattern(Fact::new(var("y"), "on", var("z"))),
            Condition::Pattern(Fact::new(var("z"), "on", var("w"))),
        ],
    );
    let excised = engine.add_rule(&extended, ActionHandlers::new()).unwrap();

    let (b1, b2, b3) = (Identifier::new(), Identifier::new(), Identifier::new());
    engine.insert_fact(Fact::new(b2, "on", b1)).unwrap();
    engine.insert_fact(Fact::new(b3, "on", b2)).unwrap();

    engine.remove_fact(&Fact::new(b3, "on", b2)).unwrap();
    engine.remove_fact(&Fact::new(b2, "on", b1)).unwrap();
    engine.excise_rule(excised).unwrap();

    // Nothing beyond the surviving rule's nodes is left.
    assert_eq!(engine.network().node_count(), baseline);
    assert!(engine.rule_name(keep).is_some());
    assert!(Validator::new().validate(&engine).is_empty());
}

#[test]
fn negated_condition_gates_on_absence() {
    let mut engine = Engine::new();
    // A block is clear while nothing sits on it.
    let clear = RuleSpec::new(
        "clear",
        vec![
            Condition::Pattern(Fact::new(var("x"), "on", var("y"))),
            Condition::Absent(Fact::new(var("z"), "on", var("x"))),
        ],
    );
    let action = engine.add_rule(&clear, ActionHandlers::new()).unwrap();

    let (b1, b2, table) = (Identifier::new(), Identifier::new(), Identifier::new());
    engine.insert_fact(Fact::new(b1, "on", table)).unwrap();
    assert_eq!(engine.matches_of(action).len(), 1);

    // Stacking B2 on B1 blocks B1 but B2 itself is clear.
    engine.insert_fact(Fact::new(b2, "on", b1)).unwrap();
    let matches = engine.matches_of(action);
    assert_eq!(matches.len(), 1);
    assert_eq!(**matches[0].fact(0), Fact::new(b2, "on", b1));

    engine.remove_fact(&Fact::new(b2, "on", b1)).unwrap();
    let matches = engine.matches_of(action);
    assert_eq!(matches.len(), 1);
    assert_eq!(**matches[0].fact(0), Fact::new(b1, "on", table));
}

#[test]
fn leading_quantifiers_gate_the_whole_rule() {
    let mut engine = Engine::new();
    let alarm = Identifier::new();
    // Fire for every goal while no alarm fact exists at all.
    let quiet = RuleSpec::new(
        "quiet-goals",
        vec![
            Condition::Absent(Fact::new(alarm, "ringing", var("v"))),
            Condition::Pattern(Fact::new(var("g"), "goal", var("w"))),
        ],
    );
    let action = engine.add_rule(&quiet, ActionHandlers::new()).unwrap();

    let g1 = Identifier::new();
    engine.insert_fact(Fact::new(g1, "goal", 1i64)).unwrap();
    assert_eq!(engine.matches_of(action).len(), 1);

    let ringing = Fact::new(alarm, "ringing", 1i64);
    engine.insert_fact(ringing.clone()).unwrap();
    assert!(engine.matches_of(action).is_empty());

    engine.remove_fact(&ringing).unwrap();
    assert_eq!(engine.matches_of(action).len(), 1);
}

#[test]
fn existential_join_fires_once_per_left_match() {
    let mut engine = Engine::new();
    // One firing per block that has at least one supporter, no matter how
    // many supporters there are.
    let supported = RuleSpec::new(
        "supported",
        vec![
            Condition::Pattern(Fact::new(var("x"), "kind", "block")),
            Condition::Exists(Fact::new(var("y"), "under", var("x"))),
        ],
    );
    let action = engine.add_rule(&supported, ActionHandlers::new()).unwrap();

    let (b1, s1, s2) = (Identifier::new(), Identifier::new(), Identifier::new());
    engine.insert_fact(Fact::new(b1, "kind", "block")).unwrap();
    assert!(engine.matches_of(action).is_empty());

    engine.insert_fact(Fact::new(s1, "under", b1)).unwrap();
    engine.insert_fact(Fact::new(s2, "under", b1)).unwrap();
    assert_eq!(engine.matches_of(action).len(), 1);

    engine.remove_fact(&Fact::new(s1, "under", b1)).unwrap();
    assert_eq!(engine.matches_of(action).len(), 1);
    engine.remove_fact(&Fact::new(s2, "under", b1)).unwrap();
    assert!(engine.matches_of(action).is_empty());
}

#[test]
fn scalar_predicates_filter_matches() {
    let mut engine = Engine::new();
    let heavy = RuleSpec::new(
        "heavy",
        vec![
            Condition::Pattern(Fact::new(var("x"), "mass", var("m"))),
            Condition::Test {
                lhs: "m".to_string(),
                op: PredicateOp::Gt,
                rhs: TestRhs::Literal(Symbol::Int(10)),
            },
        ],
    );
    let action = engine.add_rule(&heavy, ActionHandlers::new()).unwrap();

    let (b1, b2) = (Identifier::new(), Identifier::new());
    engine.insert_fact(Fact::new(b1, "mass", 5i64)).unwrap();
    engine.insert_fact(Fact::new(b2, "mass", 25i64)).unwrap();

    let matches = engine.matches_of(action);
    assert_eq!(matches.len(), 1);
    assert_eq!(**matches[0].fact(0), Fact::new(b2, "mass", 25i64));
}

#[test]
fn event_stream_reports_firings_without_blocking() {
    let mut engine = Engine::new();
    let stream = engine.subscribe(16);
    engine
        .add_rule(&stacked_rule(), ActionHandlers::new())
        .unwrap();

    let (b1, b2, table) = (Identifier::new(), Identifier::new(), Identifier::new());
    engine.insert_fact(Fact::new(b1, "on", table)).unwrap();
    engine.insert_fact(Fact::new(b2, "on", b1)).unwrap();

    let event = stream
        .next_timeout(Duration::from_millis(100))
        .expect("a firing event");
    match event.kind {
        EventKind::Fired { rule, facts, .. } => {
            assert_eq!(rule, "stacked");
            assert_eq!(facts.len(), 2);
        }
        other => panic!("expected a firing event, got {other:?}"),
    }
}
