//! Namespace resolution for multi-tenant scoping.
//!
//! A namespace is `{prefix}:{scope}:{id}`; an empty prefix drops its
//! leading colon. The resolved string lands on every event, node, chunk,
//! and document created during a run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Thread,
    Agent,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Thread => "thread",
            Scope::Agent => "agent",
            Scope::Global => "global",
        }
    }
}

/// Resolve the effective namespace string.
pub fn resolve(prefix: &str, scope: Scope, id: &str) -> String {
    if prefix.is_empty() {
        format!("{}:{}", scope.as_str(), id)
    } else {
        format!("{}:{}:{}", prefix, scope.as_str(), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_with_prefix() {
        assert_eq!(resolve("acme", Scope::Thread, "t1"), "acme:thread:t1");
        assert_eq!(resolve("acme", Scope::Global, "kb"), "acme:global:kb");
    }

    #[test]
    fn empty_prefix_drops_leading_colon() {
        assert_eq!(resolve("", Scope::Agent, "writer"), "agent:writer");
    }
}
