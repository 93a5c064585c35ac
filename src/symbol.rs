//! Symbols: the atomic values facts are made of.
//!
//! A symbol is immutable after construction. Identifiers are opaque handles
//! compared by identity; the remaining variants are self-describing
//! constants. Variables only ever appear inside rule templates, never in
//! working memory.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier handle.
///
/// Two identifiers are equal iff they were created by the same call to
/// [`Identifier::new`]; there is no payload to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Uuid);

impl Identifier {
    /// Creates a fresh, globally unique identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex chars are plenty for log output.
        let s = self.0.simple().to_string();
        write!(f, "#{}", &s[..8])
    }
}

/// An atomic value: identifier, constant, or rule-template variable.
///
/// Symbols form a total order (kind first, then payload) so they can key
/// ordered containers. Floats are ordered with `f64::total_cmp`, which also
/// makes equality and hashing well-defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Symbol {
    Identifier(Identifier),
    Int(i64),
    Float(f64),
    String(String),
    /// Placeholder used only inside unmaterialized rule templates.
    Variable(String),
}

impl Symbol {
    /// Convenience constructor for string symbols.
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Convenience constructor for variables.
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    #[must_use]
    pub const fn is_identifier(&self) -> bool {
        matches!(self, Self::Identifier(_))
    }

    #[must_use]
    pub const fn is_variable(&self) -> bool {
        matches!(self, Self::Variable(_))
    }

    #[must_use]
    pub const fn as_identifier(&self) -> Option<Identifier> {
        match self {
            Self::Identifier(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Variable name, if this symbol is a variable.
    #[must_use]
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Self::Variable(name) => Some(name),
            _ => None,
        }
    }

    /// Rank used for cross-kind ordering.
    const fn kind_rank(&self) -> u8 {
        match self {
            Self::Identifier(_) => 0,
            Self::Int(_) => 1,
            Self::Float(_) => 2,
            Self::String(_) => 3,
            Self::Variable(_) => 4,
        }
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Symbol {}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Identifier(a), Self::Identifier(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Variable(a), Self::Variable(b)) => a.cmp(b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind_rank().hash(state);
        match self {
            Self::Identifier(id) => id.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::String(s) | Self::Variable(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identifier(id) => write!(f, "{id}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Variable(name) => write!(f, "?{name}"),
        }
    }
}

impl From<i64> for Symbol {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Symbol {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Identifier> for Symbol {
    fn from(id: Identifier) -> Self {
        Self::Identifier(id)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}
