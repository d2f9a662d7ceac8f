//! Retrieval scope: which principals' data a query may see.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared scope of a retrieval or aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Union of the configured family principal set. No thread filter.
    Family,
    /// A single member resolved from the household view.
    Personal,
    /// The current principal restricted to the current thread.
    Thread,
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "family" => Ok(Scope::Family),
            "personal" => Ok(Scope::Personal),
            "thread" => Ok(Scope::Thread),
            other => Err(format!("unknown scope: '{other}'")),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Family => write!(f, "family"),
            Scope::Personal => write!(f, "personal"),
            Scope::Thread => write!(f, "thread"),
        }
    }
}

/// Outcome of scope resolution: the concrete principal set plus any extra
/// filters the executor must inject into the outbound tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeTarget {
    pub user_ids: Vec<Uuid>,
    /// `filters.thread_id` to add (thread scope only).
    pub thread_filter: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trips_through_strings() {
        for s in ["family", "personal", "thread"] {
            let scope: Scope = s.parse().unwrap();
            assert_eq!(scope.to_string(), s);
        }
    }

    #[test]
    fn test_unknown_scope_is_an_error() {
        assert!("household".parse::<Scope>().is_err());
    }

    #[test]
    fn test_scope_serde_uses_lowercase() {
        let json = serde_json::to_string(&Scope::Family).unwrap();
        assert_eq!(json, "\"family\"");
        let back: Scope = serde_json::from_str("\"thread\"").unwrap();
        assert_eq!(back, Scope::Thread);
    }
}
