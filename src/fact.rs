//! Facts and fact tests.
//!
//! A fact (working-memory element) is an `(identifier, attribute, value)`
//! triple of ground symbols. Once inserted into working memory a fact is
//! shared read-only by every token that references it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::symbol::Symbol;

/// Column selector within a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Identifier,
    Attribute,
    Value,
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identifier => write!(f, "id"),
            Self::Attribute => write!(f, "attr"),
            Self::Value => write!(f, "value"),
        }
    }
}

/// A working-memory element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fact {
    pub identifier: Symbol,
    pub attribute: Symbol,
    pub value: Symbol,
}

impl Fact {
    /// Creates a fact from three symbols.
    ///
    /// Ground-ness is enforced at the working-memory boundary, not here, so
    /// rule templates can still be described with the same type.
    pub fn new(
        identifier: impl Into<Symbol>,
        attribute: impl Into<Symbol>,
        value: impl Into<Symbol>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Returns the symbol in the given column.
    #[must_use]
    pub const fn get(&self, column: Column) -> &Symbol {
        match column {
            Column::Identifier => &self.identifier,
            Column::Attribute => &self.attribute,
            Column::Value => &self.value,
        }
    }

    /// True when no slot holds a variable.
    #[must_use]
    pub const fn is_ground(&self) -> bool {
        !self.identifier.is_variable() && !self.attribute.is_variable() && !self.value.is_variable()
    }

    /// First variable found in any slot, if the fact is a template.
    #[must_use]
    pub fn first_variable(&self) -> Option<&str> {
        self.identifier
            .as_variable()
            .or_else(|| self.attribute.as_variable())
            .or_else(|| self.value.as_variable())
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.identifier, self.attribute, self.value)
    }
}

/// One slot of a fact test: either a wildcard or an exact symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSlot {
    Any,
    Is(Symbol),
}

impl TestSlot {
    fn accepts(&self, symbol: &Symbol) -> bool {
        match self {
            Self::Any => true,
            Self::Is(expected) => expected == symbol,
        }
    }
}

/// The fixed identifier/attribute/value pattern a filter node matches
/// against; `Any` slots accept every symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactTest {
    pub identifier: TestSlot,
    pub attribute: TestSlot,
    pub value: TestSlot,
}

impl FactTest {
    /// A test that accepts every fact.
    #[must_use]
    pub const fn wildcard() -> Self {
        Self {
            identifier: TestSlot::Any,
            attribute: TestSlot::Any,
            value: TestSlot::Any,
        }
    }

    /// True when the fact passes this test.
    #[must_use]
    pub fn matches(&self, fact: &Fact) -> bool {
        self.identifier.accepts(&fact.identifier)
            && self.attribute.accepts(&fact.attribute)
            && self.value.accepts(&fact.value)
    }
}
