use serde::{Deserialize, Serialize};

use super::cma::Cma;
use super::engine::run_simulation;
use super::error::EngineError;
use super::portfolio::{AccountKind, ClientPortfolio, RecurringFlow};
use super::types::{McConfig, ScheduledFlowMode};

/// Bisection search for the recurring monthly contribution that lifts a
/// goal's probability to a target level.
#[derive(Clone, Debug, Deserialize)]
pub struct SolveConfig {
    pub goal_label: String,
    pub target_probability: f64,
    #[serde(default)]
    pub search_min: f64,
    #[serde(default = "default_search_max")]
    pub search_max: f64,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_paths_per_iteration")]
    pub paths_per_iteration: usize,
    #[serde(default = "default_final_paths")]
    pub final_paths: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_search_max() -> f64 {
    50_000.0
}

fn default_tolerance() -> f64 {
    50.0
}

fn default_max_iterations() -> u32 {
    32
}

fn default_paths_per_iteration() -> usize {
    1_000
}

fn default_final_paths() -> usize {
    5_000
}

fn default_seed() -> u64 {
    42
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_value: f64,
    pub probability: f64,
    pub ci_half_width: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SolveResult {
    pub goal_label: String,
    pub target_probability: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub solved_value: Option<f64>,
    pub achieved_probability: Option<f64>,
    pub achieved_ci_half_width: Option<f64>,
    pub iterations: Vec<SolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Solves for the total recurring monthly contribution reaching
/// `target_probability` for the named goal. Existing recurring flows are
/// scaled proportionally to the candidate level; a portfolio with no
/// recurring flows gets a taxable monthly flow instead.
pub fn solve_required_contribution(
    portfolio: &ClientPortfolio,
    cma: &Cma,
    config: &SolveConfig,
) -> Result<SolveResult, EngineError> {
    validate_config(portfolio, config)?;

    let low_eval = evaluate_candidate(portfolio, cma, config, config.search_min, config.paths_per_iteration)?;
    let high_eval = evaluate_candidate(portfolio, cma, config, config.search_max, config.paths_per_iteration)?;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let mut solved_value = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.probability + 1e-12 >= config.target_probability {
        solved_value = Some(config.search_min);
        converged = true;
        feasible = true;
        message = "Already meets the target at the lower contribution bound.".to_string();
    } else if high_eval.probability + 1e-12 < config.target_probability {
        feasible = false;
        message = "No feasible contribution found within the search bounds.".to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval =
                evaluate_candidate(portfolio, cma, config, mid, config.paths_per_iteration)?;
            iterations.push(SolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_value: mid,
                probability: eval.probability,
                ci_half_width: eval.ci_half_width,
            });

            if eval.probability + 1e-12 >= config.target_probability {
                hi = mid;
            } else {
                lo = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                solved_value = Some(hi);
                break;
            }
        }
        if solved_value.is_none() {
            solved_value = Some(hi);
        }
        feasible = true;
        message = if converged {
            "Solved required contribution.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate."
                .to_string()
        };
    }

    let mut achieved_probability = None;
    let mut achieved_ci_half_width = None;
    if let Some(value) = solved_value {
        let final_eval = evaluate_candidate(portfolio, cma, config, value, config.final_paths)?;
        achieved_probability = Some(final_eval.probability);
        achieved_ci_half_width = Some(final_eval.ci_half_width);
    }

    Ok(SolveResult {
        goal_label: config.goal_label.clone(),
        target_probability: config.target_probability,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        solved_value,
        achieved_probability,
        achieved_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Clone, Copy, Debug)]
struct CandidateEval {
    probability: f64,
    ci_half_width: f64,
}

fn evaluate_candidate(
    portfolio: &ClientPortfolio,
    cma: &Cma,
    config: &SolveConfig,
    monthly_total: f64,
    n_paths: usize,
) -> Result<CandidateEval, EngineError> {
    let candidate = portfolio_with_contribution(portfolio, monthly_total);
    let mc = McConfig {
        n_paths: n_paths.max(1),
        seed: Some(config.seed),
        store_percentiles: false,
        trajectory_sample_cap: 0,
        scheduled_flow_mode: ScheduledFlowMode::PerStep,
    };
    let result = run_simulation(&candidate, cma, &mc)?;
    let probability = result
        .prob_by_goal
        .get(&config.goal_label)
        .copied()
        .ok_or_else(|| {
            EngineError::InvalidRunConfig(format!(
                "no goal labeled `{}` in the portfolio",
                config.goal_label
            ))
        })?;
    Ok(CandidateEval {
        probability,
        ci_half_width: binomial_ci_half_width(probability, n_paths.max(1)),
    })
}

/// Rewrites the portfolio's recurring flows so their combined per-month
/// contribution equals `monthly_total`, preserving the existing mix.
fn portfolio_with_contribution(portfolio: &ClientPortfolio, monthly_total: f64) -> ClientPortfolio {
    let spy = portfolio.steps_per_year as f64;
    let current: f64 = portfolio
        .cash_flows
        .recurring
        .iter()
        .map(|r| match r.account_type {
            AccountKind::Taxable => r.amount_monthly,
            AccountKind::TaxAdvantaged => r.amount_annual / spy,
            AccountKind::CashLike => 0.0,
        })
        .sum();

    let mut candidate = portfolio.clone();
    if current.abs() > 1e-12 {
        let scale = monthly_total / current;
        for flow in &mut candidate.cash_flows.recurring {
            flow.amount_monthly *= scale;
            flow.amount_annual *= scale;
        }
    } else {
        candidate.cash_flows.recurring.push(RecurringFlow {
            account_type: AccountKind::Taxable,
            amount_monthly: monthly_total,
            amount_annual: 0.0,
        });
    }
    candidate
}

fn binomial_ci_half_width(p: f64, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_config(portfolio: &ClientPortfolio, config: &SolveConfig) -> Result<(), EngineError> {
    let invalid = |msg: &str| Err(EngineError::InvalidRunConfig(msg.to_string()));
    if !(0.0..=1.0).contains(&config.target_probability) {
        return invalid("target_probability must be between 0 and 1");
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return invalid("search bounds must be finite");
    }
    if config.search_max <= config.search_min {
        return invalid("search_max must be greater than search_min");
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return invalid("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return invalid("max_iterations must be > 0");
    }
    if config.paths_per_iteration == 0 || config.final_paths == 0 {
        return invalid("path counts must be > 0");
    }
    let has_goal = portfolio.goals.iter().any(|g| {
        let label = if g.label.is_empty() {
            format!("Goal@Y{}", g.year)
        } else {
            g.label.clone()
        };
        label == config.goal_label
    });
    if !has_goal {
        return Err(EngineError::InvalidRunConfig(format!(
            "no goal labeled `{}` in the portfolio",
            config.goal_label
        )));
    }
    Ok(())
}
