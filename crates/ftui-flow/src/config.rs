#![forbid(unsafe_code)]

//! Partition configuration.
//!
//! # Environment
//!
//! [`FlowConfig::from_env`] starts from the defaults and applies:
//!
//! | Variable                | Field           | Format            |
//! |-------------------------|-----------------|-------------------|
//! | `FTUI_FLOW_RANK_LIMIT`  | `rank_limit`    | unsigned integer  |
//! | `FTUI_FLOW_TRACE`       | `trace_entries` | `1` / `true`      |
//!
//! Unparseable values are ignored.

use std::env;

use crate::node::{RANK_MAX, Rank};

/// Configuration shared by every transaction on a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Sentinel rank. No node on this partition may be raised to this rank
    /// or beyond; attempting to do so fails with
    /// [`FlowError::RankOverflow`](crate::FlowError::RankOverflow).
    /// Default: [`RANK_MAX`].
    pub rank_limit: Rank,

    /// Emit a `TRACE` event for every drained entry.
    /// Default: false.
    pub trace_entries: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            rank_limit: RANK_MAX,
            trace_entries: false,
        }
    }
}

impl FlowConfig {
    /// Defaults overridden by `FTUI_FLOW_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = env::var("FTUI_FLOW_RANK_LIMIT")
            && let Ok(n) = val.trim().parse()
        {
            config.rank_limit = n;
        }
        if let Ok(val) = env::var("FTUI_FLOW_TRACE") {
            config.trace_entries = val == "1" || val.eq_ignore_ascii_case("true");
        }
        config
    }

    #[must_use]
    pub fn with_rank_limit(mut self, rank_limit: Rank) -> Self {
        self.rank_limit = rank_limit;
        self
    }

    #[must_use]
    pub fn with_trace_entries(mut self, trace_entries: bool) -> Self {
        self.trace_entries = trace_entries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.rank_limit, RANK_MAX);
        assert!(!config.trace_entries);
    }

    #[test]
    fn builder_overrides() {
        let config = FlowConfig::default()
            .with_rank_limit(16)
            .with_trace_entries(true);
        assert_eq!(config.rank_limit, 16);
        assert!(config.trace_entries);
    }
}
