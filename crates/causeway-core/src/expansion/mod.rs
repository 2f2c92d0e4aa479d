//! Multi-hop frontier expansion

pub mod expander;

use serde::{Deserialize, Serialize};

pub use expander::{ExpansionReport, HopExpander};

/// Why expansion stopped; every variant is a normal termination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxHops,
    EmptyFrontier,
    RowBudget,
    TimeBudget,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxHops => "max_hops",
            Self::EmptyFrontier => "empty_frontier",
            Self::RowBudget => "row_budget",
            Self::TimeBudget => "time_budget",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expander lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionState {
    Seeding,
    Expanding { hop: u32 },
    Terminated(TerminationReason),
}
