//! Tokens and the token addressing scheme.
//!
//! A token is the ordered sequence of facts matched so far along one path of
//! the network. Tokens are built incrementally: filters emit width-1 tokens,
//! joins concatenate, quantifier nodes leave width untouched (their matched
//! facts live on a reserved row that is not part of the token).
//!
//! A [`TokenIndex`] addresses one symbol of one fact. It carries two row
//! coordinates: `cond_row` counts every condition of the rule, including
//! quantified ones, while `token_row` counts only the facts actually present
//! in the token. Both are needed when a structural edit shifts widths and
//! every downstream index has to be re-derived.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::fact::{Column, Fact};
use crate::symbol::Symbol;

/// Address of a single symbol within a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenIndex {
    /// Row in condition space (every condition counts).
    pub cond_row: usize,
    /// Row in token space (only materialized facts count).
    pub token_row: usize,
    /// Column within the fact.
    pub column: Column,
    /// True when the addressed fact sits on the reserved quantifier row and
    /// is therefore absent from the token itself.
    pub existential: bool,
}

impl TokenIndex {
    /// Index of a materialized fact slot.
    #[must_use]
    pub const fn new(cond_row: usize, token_row: usize, column: Column) -> Self {
        Self {
            cond_row,
            token_row,
            column,
            existential: false,
        }
    }

    /// Index on the reserved existential/negation row.
    #[must_use]
    pub const fn quantified(cond_row: usize, token_row: usize, column: Column) -> Self {
        Self {
            cond_row,
            token_row,
            column,
            existential: true,
        }
    }
}

impl fmt::Display for TokenIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.existential {
            write!(f, "[~{}.{}]", self.cond_row, self.column)
        } else {
            write!(f, "[{}.{}]", self.token_row, self.column)
        }
    }
}

/// An ordered, shared sequence of facts.
///
/// Cloning is cheap; equality and hashing go through the fact values, so two
/// tokens assembled along different paths still compare equal when they hold
/// the same facts in the same order.
#[derive(Debug, Clone)]
pub struct Token {
    facts: Rc<Vec<Rc<Fact>>>,
}

impl Token {
    /// The empty token (the sentinel emitted by quantifier nodes).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            facts: Rc::new(Vec::new()),
        }
    }

    /// A width-1 token holding a single fact.
    #[must_use]
    pub fn unit(fact: Rc<Fact>) -> Self {
        Self {
            facts: Rc::new(vec![fact]),
        }
    }

    /// Concatenation of two tokens, left facts first.
    #[must_use]
    pub fn merge(left: &Self, right: &Self) -> Self {
        let mut facts = Vec::with_capacity(left.width() + right.width());
        facts.extend(left.facts.iter().cloned());
        facts.extend(right.facts.iter().cloned());
        Self {
            facts: Rc::new(facts),
        }
    }

    /// Number of facts in the token.
    #[must_use]
    pub fn width(&self) -> usize {
        self.facts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// The fact at `row`.
    ///
    /// # Panics
    ///
    /// Out-of-range rows are a programming error: indices are only created
    /// for valid positions at network build/edit time.
    #[must_use]
    pub fn fact(&self, row: usize) -> &Rc<Fact> {
        &self.facts[row]
    }

    /// Iterate over the facts of this token.
    pub fn facts(&self) -> impl Iterator<Item = &Rc<Fact>> {
        self.facts.iter()
    }

    /// Resolves an index to the symbol it addresses.
    ///
    /// # Panics
    ///
    /// Panics on out-of-range rows and on indices marked existential; both
    /// are programming errors, not recoverable conditions.
    #[must_use]
    pub fn resolve(&self, index: &TokenIndex) -> &Symbol {
        debug_assert!(
            !index.existential,
            "existential indices address the reserved row and cannot be resolved"
        );
        self.facts[index.token_row].get(index.column)
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.facts.len() == other.facts.len()
            && self
                .facts
                .iter()
                .zip(other.facts.iter())
                .all(|(a, b)| a == b)
    }
}

impl Eq for Token {}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.facts.len().hash(state);
        for fact in self.facts.iter() {
            fact.hash(state);
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, fact) in self.facts.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{fact}")?;
        }
        write!(f, "}}")
    }
}

/// Equality constraints between slots of a left and a right partial match,
/// used to configure join-family nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Bindings(pub Vec<(TokenIndex, TokenIndex)>);

impl Bindings {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every constraint holds between the two tokens.
    #[must_use]
    pub fn satisfied(&self, left: &Token, right: &Token) -> bool {
        self.0
            .iter()
            .all(|(l, r)| left.resolve(l) == right.resolve(r))
    }
}

impl fmt::Display for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (l, r)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{l}={r}")?;
        }
        Ok(())
    }
}

/// Name → index mapping for the variables of one rule.
///
/// A name may be bound more than once (quantified occurrences keep their own
/// indices); lookups that need a resolvable slot use the first
/// non-existential occurrence in row-major order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableIndices {
    map: BTreeMap<String, Vec<TokenIndex>>,
}

impl VariableIndices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an occurrence of `name` at `index`.
    pub fn insert(&mut self, name: impl Into<String>, index: TokenIndex) {
        self.map.entry(name.into()).or_default().push(index);
    }

    /// All occurrences of `name`, unsorted.
    #[must_use]
    pub fn occurrences(&self, name: &str) -> &[TokenIndex] {
        self.map.get(name).map_or(&[], Vec::as_slice)
    }

    /// The first non-existential occurrence of `name` in row-major order.
    #[must_use]
    pub fn first_bound(&self, name: &str) -> Option<TokenIndex> {
        let mut found: Option<TokenIndex> = None;
        for index in self.occurrences(name) {
            if index.existential {
                continue;
            }
            found = Some(match found {
                None => *index,
                Some(best) if (index.cond_row, index.column) < (best.cond_row, best.column) => {
                    *index
                }
                Some(best) => best,
            });
        }
        found
    }

    /// True when `name` has at least one occurrence.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Iterate over `(name, index)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TokenIndex)> {
        self.map
            .iter()
            .flat_map(|(name, indices)| indices.iter().map(move |i| (name.as_str(), i)))
    }

    /// Number of registered occurrences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// True when some occurrence resolves to exactly `index`.
    #[must_use]
    pub fn contains_index(&self, index: &TokenIndex) -> bool {
        self.iter().any(|(_, i)| i == index)
    }

    /// Derives the join constraints between two partial matches: one
    /// equality per variable name occurring bound on both sides, pairing the
    /// first non-existential occurrence of each (left-to-right, row-major).
    #[must_use]
    pub fn bindings(lhs: &Self, rhs: &Self) -> Bindings {
        let mut pairs = Vec::new();
        for name in lhs.map.keys() {
            if !rhs.contains(name) {
                continue;
            }
            let (Some(l), Some(r)) = (lhs.first_bound(name), rhs.first_bound(name)) else {
                continue;
            };
            pairs.push((l, r));
        }
        Bindings(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Identifier;

    fn fact(id: Identifier, attr: &str, value: i64) -> Rc<Fact> {
        Rc::new(Fact::new(id, attr, value))
    }

    #[test]
    fn merge_preserves_order_and_width() {
        let a = Identifier::new();
        let b = Identifier::new();
        let left = Token::unit(fact(a, "x", 1));
        let right = Token::unit(fact(b, "y", 2));
        let merged = Token::merge(&left, &right);
        assert_eq!(merged.width(), 2);
        assert_eq!(merged.fact(0).identifier, Symbol::Identifier(a));
        assert_eq!(merged.fact(1).identifier, Symbol::Identifier(b));
    }

    #[test]
    fn token_equality_is_by_fact_values() {
        let a = Identifier::new();
        let t1 = Token::unit(fact(a, "x", 1));
        let t2 = Token::unit(fact(a, "x", 1));
        assert_eq!(t1, t2);
        let t3 = Token::unit(fact(a, "x", 2));
        assert_ne!(t1, t3);
    }

    #[test]
    fn resolve_addresses_row_and_column() {
        let a = Identifier::new();
        let token = Token::unit(fact(a, "x", 7));
        let index = TokenIndex::new(0, 0, Column::Value);
        assert_eq!(token.resolve(&index), &Symbol::Int(7));
    }

    #[test]
    fn bindings_pair_first_bound_occurrences() {
        let mut lhs = VariableIndices::new();
        lhs.insert("x", TokenIndex::quantified(0, 0, Column::Value));
        lhs.insert("x", TokenIndex::new(1, 1, Column::Identifier));
        lhs.insert("y", TokenIndex::new(0, 0, Column::Identifier));

        let mut rhs = VariableIndices::new();
        rhs.insert("x", TokenIndex::new(0, 0, Column::Value));
        rhs.insert("z", TokenIndex::new(0, 0, Column::Identifier));

        let bindings = VariableIndices::bindings(&lhs, &rhs);
        assert_eq!(
            bindings.0,
            vec![(
                TokenIndex::new(1, 1, Column::Identifier),
                TokenIndex::new(0, 0, Column::Value),
            )]
        );
    }

    #[test]
    fn first_bound_skips_existential_occurrences() {
        let mut vars = VariableIndices::new();
        vars.insert("x", TokenIndex::quantified(0, 0, Column::Value));
        assert_eq!(vars.first_bound("x"), None);
        vars.insert("x", TokenIndex::new(2, 1, Column::Value));
        vars.insert("x", TokenIndex::new(1, 1, Column::Value));
        let bound = vars.first_bound("x").unwrap();
        assert_eq!(bound.cond_row, 1);
    }
}
