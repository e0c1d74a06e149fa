use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Step granularity for non-repeating scheduled flows.
///
/// The reference behavior fires a flow's full amount on every step of its
/// target year, which multiplies the per-year total by steps_per_year.
/// `Spread` divides the amount across the year's steps instead so the yearly
/// total equals the stated amount. Repeating flows are unaffected: their
/// window is already expressed in steps.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduledFlowMode {
    #[default]
    PerStep,
    Spread,
}

/// Run parameters for one simulation.
#[derive(Clone, Debug, PartialEq)]
pub struct McConfig {
    pub n_paths: usize,
    /// Base seed; `None` draws a fresh one before the parallel fan-out.
    pub seed: Option<u64>,
    pub store_percentiles: bool,
    /// How many paths retain a full per-step trajectory for the percentile
    /// bands. Paths beyond the cap contribute only to the terminal
    /// distribution.
    pub trajectory_sample_cap: usize,
    pub scheduled_flow_mode: ScheduledFlowMode,
}

impl Default for McConfig {
    fn default() -> Self {
        Self {
            n_paths: 10_000,
            seed: Some(42),
            store_percentiles: true,
            trajectory_sample_cap: 1_500,
            scheduled_flow_mode: ScheduledFlowMode::PerStep,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryStats {
    pub median_terminal: f64,
    pub p5_terminal: f64,
    pub p95_terminal: f64,
}

/// Percentiles of total wealth at every step index, step 0 included.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PercentileBands {
    pub p10: Vec<f64>,
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
}

/// Terminal artifact of a run. The raw terminal array stays in-process for
/// callers like the solver; only the aggregates serialize.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct McResult {
    #[serde(skip)]
    pub terminal: Vec<f64>,
    pub prob_by_goal: BTreeMap<String, f64>,
    pub summary: SummaryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptiles_over_time: Option<PercentileBands>,
}
