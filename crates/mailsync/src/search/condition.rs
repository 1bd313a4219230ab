//! Search condition trees

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::models::AccountId;

/// Message attribute a condition tests
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchField {
    Subject,
    Sender,
    Recipient,
    /// Folder server id
    Folder,
    Read,
    Flagged,
    Answered,
    Forwarded,
    /// Message date, as epoch milliseconds or a `YYYY-MM-DD` / RFC 3339 value
    Date,
    Size,
    /// Local message id
    Id,
    ThreadRoot,
    /// Searches the stored preview text
    MessageContents,
    Custom(CustomField),
}

impl fmt::Display for SearchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchField::Custom(custom) => write!(f, "custom({})", custom.name),
            other => write!(f, "{other:?}"),
        }
    }
}

/// A caller-supplied SQL expression with exactly one `?` placeholder
///
/// Only the contains attribute can be applied to a custom field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomField {
    pub name: String,
    pub template: String,
}

impl CustomField {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }
}

/// How a field is compared against the condition value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Contains,
    StartsWith,
    EndsWith,
    Equals,
    NotEquals,
    /// Numeric fields only
    LessThan,
    /// Numeric fields only
    GreaterThan,
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A single predicate: field, attribute and value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchCondition {
    pub field: SearchField,
    pub attribute: Attribute,
    pub value: String,
}

impl SearchCondition {
    pub fn new(field: SearchField, attribute: Attribute, value: impl Into<String>) -> Self {
        Self {
            field,
            attribute,
            value: value.into(),
        }
    }
}

/// Immutable boolean tree of conditions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchConditionNode {
    And(Box<SearchConditionNode>, Box<SearchConditionNode>),
    Or(Box<SearchConditionNode>, Box<SearchConditionNode>),
    Not(Box<SearchConditionNode>),
    Condition(SearchCondition),
}

impl SearchConditionNode {
    pub fn condition(field: SearchField, attribute: Attribute, value: impl Into<String>) -> Self {
        SearchConditionNode::Condition(SearchCondition::new(field, attribute, value))
    }

    pub fn and(self, other: SearchConditionNode) -> Self {
        SearchConditionNode::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: SearchConditionNode) -> Self {
        SearchConditionNode::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        SearchConditionNode::Not(Box::new(self))
    }

    /// Fold a list of nodes into a left-leaning conjunction
    pub fn all(nodes: impl IntoIterator<Item = SearchConditionNode>) -> Option<Self> {
        nodes.into_iter().reduce(SearchConditionNode::and)
    }

    /// Fold a list of nodes into a left-leaning disjunction
    pub fn any(nodes: impl IntoIterator<Item = SearchConditionNode>) -> Option<Self> {
        nodes.into_iter().reduce(SearchConditionNode::or)
    }

    /// All leaf conditions, left to right
    pub fn leaves(&self) -> Vec<&SearchCondition> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a SearchCondition>) {
        match self {
            SearchConditionNode::And(l, r) | SearchConditionNode::Or(l, r) => {
                l.collect_leaves(out);
                r.collect_leaves(out);
            }
            SearchConditionNode::Not(inner) => inner.collect_leaves(out),
            SearchConditionNode::Condition(c) => out.push(c),
        }
    }
}

/// A search over one or more accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSpecification {
    pub accounts: BTreeSet<AccountId>,
    /// None matches every message
    pub conditions: Option<SearchConditionNode>,
}

impl SearchSpecification {
    pub fn new(accounts: impl IntoIterator<Item = AccountId>) -> Self {
        Self {
            accounts: accounts.into_iter().collect(),
            conditions: None,
        }
    }

    pub fn with_conditions(mut self, conditions: SearchConditionNode) -> Self {
        self.conditions = Some(conditions);
        self
    }
}
