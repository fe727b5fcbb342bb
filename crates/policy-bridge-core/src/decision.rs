//! Policy decisions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The protocol tier that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Context-based evaluation API.
    Context,
    /// Single-call `eval(input)` export.
    Simple,
    /// Host-side fallback rule.
    Fallback,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Context => write!(f, "context"),
            Tier::Simple => write!(f, "simple"),
            Tier::Fallback => write!(f, "fallback"),
        }
    }
}

/// An allow/deny decision plus the document it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    allowed: bool,
    tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

impl Decision {
    /// Create a decision.
    pub fn new(allowed: bool, tier: Tier, result: Option<Value>) -> Self {
        Self {
            allowed,
            tier,
            result,
        }
    }

    /// Whether the request is allowed.
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Tier that produced the decision.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Result document returned by the module, if any.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Returns `true` if the module could not decide and the fallback rule did.
    pub fn is_degraded(&self) -> bool {
        self.tier == Tier::Fallback
    }
}
