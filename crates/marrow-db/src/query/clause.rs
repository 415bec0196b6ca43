//! Filter criteria and the composable `Q` expression object.
//!
//! A [`Criterion`] is a boolean expression tree whose leaves pair a lookup
//! path (`field__relation__operator`) with a right-hand argument. [`Q`]
//! wraps a criterion for composition: `&` (AND), `|` (OR), and `!` (NOT)
//! with flattening of nested groups, so `(a & b) & c` is one three-way AND.
//!
//! An empty `Q` is the identity element for AND: combining with it is a
//! no-op, and filtering by it adds nothing.
//!
//! # Examples
//!
//! ```
//! use marrow_db::query::clause::Q;
//!
//! // name = "Alice" AND age >= 18
//! let q = Q::expr("name", "Alice") & Q::expr("age__gte", 18);
//!
//! // NOT (active = false)
//! let negated = !Q::expr("active", false);
//! ```

use std::ops;

use crate::value::Arg;
use marrow_core::OrmResult;

/// A boolean expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// A single lookup: a path string and its right-hand argument.
    Leaf {
        /// The lookup path (may traverse relations and carry an operator
        /// suffix).
        path: String,
        /// The right-hand side, possibly deferred.
        value: Arg,
    },
    /// Logical AND of child criteria.
    And(Vec<Criterion>),
    /// Logical OR of child criteria.
    Or(Vec<Criterion>),
    /// Logical negation.
    Not(Box<Criterion>),
}

impl Criterion {
    /// Returns a clone with every deferred argument resolved to a concrete
    /// value, awaiting lazy callables sequentially.
    pub async fn resolved(&self) -> OrmResult<Self> {
        match self {
            Self::Leaf { path, value } => Ok(Self::Leaf {
                path: path.clone(),
                value: Arg::Value(value.resolve().await?),
            }),
            Self::And(children) => {
                let mut resolved = Vec::with_capacity(children.len());
                for child in children {
                    resolved.push(Box::pin(child.resolved()).await?);
                }
                Ok(Self::And(resolved))
            }
            Self::Or(children) => {
                let mut resolved = Vec::with_capacity(children.len());
                for child in children {
                    resolved.push(Box::pin(child.resolved()).await?);
                }
                Ok(Self::Or(resolved))
            }
            Self::Not(inner) => Ok(Self::Not(Box::new(Box::pin(inner.resolved()).await?))),
        }
    }

    /// Returns `true` if any leaf still carries a lazy argument.
    pub fn has_lazy_args(&self) -> bool {
        match self {
            Self::Leaf { value, .. } => matches!(value, Arg::Lazy(_)),
            Self::And(children) | Self::Or(children) => {
                children.iter().any(Self::has_lazy_args)
            }
            Self::Not(inner) => inner.has_lazy_args(),
        }
    }
}

/// A composable query filter.
///
/// `Q` wraps an optional [`Criterion`]; the empty `Q` combines as the AND
/// identity and is ignored by `filter()`. Wrapping a `Q` in another `Q`
/// collapses to the same group rather than adding a nesting level.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Q(Option<Criterion>);

impl Q {
    /// The empty expression (AND identity).
    pub const fn empty() -> Self {
        Self(None)
    }

    /// Creates a single-lookup expression from a path and a value.
    pub fn expr(path: impl Into<String>, value: impl Into<Arg>) -> Self {
        Self(Some(Criterion::Leaf {
            path: path.into(),
            value: value.into(),
        }))
    }

    /// Wraps an already-built criterion (passthrough — no resolution here).
    pub const fn from_criterion(criterion: Criterion) -> Self {
        Self(Some(criterion))
    }

    /// Returns the inner criterion, if any.
    pub fn into_criterion(self) -> Option<Criterion> {
        self.0
    }

    /// Returns a reference to the inner criterion, if any.
    pub const fn criterion(&self) -> Option<&Criterion> {
        self.0.as_ref()
    }

    /// Returns `true` if this expression wraps no criteria.
    pub const fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

/// ANDs the given expressions together, skipping empty ones.
pub fn and_(exprs: impl IntoIterator<Item = Q>) -> Q {
    exprs.into_iter().fold(Q::empty(), |acc, q| acc & q)
}

/// ORs the given expressions together, skipping empty ones.
pub fn or_(exprs: impl IntoIterator<Item = Q>) -> Q {
    exprs.into_iter().fold(Q::empty(), |acc, q| acc | q)
}

/// Negates the given expression.
pub fn not_(expr: Q) -> Q {
    !expr
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self.0, rhs.0) {
            (None, other) | (other, None) => Self(other),
            (Some(Criterion::And(mut left)), Some(Criterion::And(right))) => {
                left.extend(right);
                Self(Some(Criterion::And(left)))
            }
            (Some(Criterion::And(mut left)), Some(other)) => {
                left.push(other);
                Self(Some(Criterion::And(left)))
            }
            (Some(other), Some(Criterion::And(mut right))) => {
                right.insert(0, other);
                Self(Some(Criterion::And(right)))
            }
            (Some(left), Some(right)) => Self(Some(Criterion::And(vec![left, right]))),
        }
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self.0, rhs.0) {
            (None, other) | (other, None) => Self(other),
            (Some(Criterion::Or(mut left)), Some(Criterion::Or(right))) => {
                left.extend(right);
                Self(Some(Criterion::Or(left)))
            }
            (Some(Criterion::Or(mut left)), Some(other)) => {
                left.push(other);
                Self(Some(Criterion::Or(left)))
            }
            (Some(other), Some(Criterion::Or(mut right))) => {
                right.insert(0, other);
                Self(Some(Criterion::Or(right)))
            }
            (Some(left), Some(right)) => Self(Some(Criterion::Or(vec![left, right]))),
        }
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self.0 {
            None => Self(None),
            // Double negation cancellation
            Some(Criterion::Not(inner)) => Self(Some(*inner)),
            Some(other) => Self(Some(Criterion::Not(Box::new(other)))),
        }
    }
}
