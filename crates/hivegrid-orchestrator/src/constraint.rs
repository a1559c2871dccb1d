//! Placement-constraint expressions.
//!
//! Supports `node.id`, `node.hostname`, `node.role`, and
//! `node.labels.<key>` with `==` and `!=` operators. A bare `=` is
//! accepted as `==`.

use hivegrid_state::Node;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("invalid constraint expression: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    NotEq,
}

/// A single parsed constraint expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub key: String,
    pub op: Op,
    pub value: String,
}

impl Constraint {
    fn matches(&self, actual: Option<&str>) -> bool {
        match (self.op, actual) {
            (Op::Eq, Some(value)) => value == self.value,
            (Op::Eq, None) => false,
            (Op::NotEq, Some(value)) => value != self.value,
            (Op::NotEq, None) => true,
        }
    }
}

/// Parse a list of constraint expressions.
pub fn parse(expressions: &[String]) -> Result<Vec<Constraint>, ConstraintError> {
    let mut constraints = Vec::with_capacity(expressions.len());
    for expression in expressions {
        constraints.push(parse_one(expression)?);
    }
    Ok(constraints)
}

fn parse_one(expression: &str) -> Result<Constraint, ConstraintError> {
    let (key, op, value) = if let Some((key, value)) = expression.split_once("!=") {
        (key, Op::NotEq, value)
    } else if let Some((key, value)) = expression.split_once("==") {
        (key, Op::Eq, value)
    } else if let Some((key, value)) = expression.split_once('=') {
        (key, Op::Eq, value)
    } else {
        return Err(ConstraintError::Invalid(expression.to_string()));
    };

    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || value.is_empty() {
        return Err(ConstraintError::Invalid(expression.to_string()));
    }

    Ok(Constraint {
        key: key.to_string(),
        op,
        value: value.to_string(),
    })
}

/// Whether the node satisfies every constraint.
pub fn node_matches(constraints: &[Constraint], node: &Node) -> bool {
    constraints.iter().all(|constraint| {
        let actual = match constraint.key.as_str() {
            "node.id" => Some(node.id.as_str()),
            "node.hostname" => node.description.as_ref().map(|d| d.hostname.as_str()),
            "node.role" => Some(node.spec.role.as_str()),
            key => key
                .strip_prefix("node.labels.")
                .and_then(|label| node.spec.annotations.labels.get(label))
                .map(String::as_str),
        };
        constraint.matches(actual)
    })
}
