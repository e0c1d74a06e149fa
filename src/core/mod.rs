mod cma;
mod engine;
mod error;
mod portfolio;
mod solver;
mod types;

pub use cma::{AssetClass, Cma, CmaOverride, StepParams, derive_step_params};
pub use engine::run_simulation;
pub use error::EngineError;
pub use portfolio::{
    Account, AccountKind, AssetWeight, CashFlows, ClientPortfolio, Constraints, Goal,
    PortfolioDescription, RebalanceFrequency, RecurringFlow, ScheduledFlow,
};
pub use solver::{SolveConfig, SolveIteration, SolveResult, solve_required_contribution};
pub use types::{McConfig, McResult, PercentileBands, ScheduledFlowMode, SummaryStats};
