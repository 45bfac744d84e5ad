//! Graph Configuration
//!
//! Options controlling how a [`Checkout`](crate::Checkout) publishes and
//! retains revisions. The configuration is plain data and can be loaded from
//! JSON, with every field optional.
//!
//! ```rust,ignore
//! let config = GraphConfig::from_json(r#"{ "history_limit": 10 }"#)?;
//! let graph = Checkout::with_config(config)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Configuration of a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Commit immediately after `add_node` / `remove_node` instead of waiting
    /// for the next `propagate` or write.
    pub auto_commit: bool,

    /// Number of previous revisions kept for `undo`. Zero disables undo.
    pub history_limit: usize,

    /// Maximum length of the revision chain. When a commit would exceed it,
    /// the new revision is published flattened, without a `previous` link.
    pub compaction_depth: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            history_limit: 0,
            compaction_depth: 64,
        }
    }
}

impl GraphConfig {
    /// Parse and validate a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let config: GraphConfig =
            serde_json::from_str(json).map_err(|e| GraphError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine can not work with.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.compaction_depth == 0 {
            return Err(GraphError::Config(
                "compaction_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
