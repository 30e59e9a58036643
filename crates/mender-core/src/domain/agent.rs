//! Agent identity and capability sets.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::issue::Category;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Capabilities registered for an agent at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub capabilities: BTreeSet<Category>,
    /// Maximum number of fixes this agent runs at once.
    pub concurrency_limit: usize,
}

impl AgentSpec {
    pub fn new<I, S>(id: impl Into<String>, capabilities: I, concurrency_limit: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: AgentId::new(id),
            capabilities: capabilities
                .into_iter()
                .map(Category::new)
                .collect(),
            concurrency_limit,
        }
    }

    pub fn can_fix(&self, category: &Category) -> bool {
        self.capabilities.contains(category)
    }
}
