use serde::Deserialize;

/// Account taxation bucket, spelled as the external contract writes it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
pub enum AccountKind {
    #[serde(rename = "taxable")]
    Taxable,
    #[serde(rename = "tax-advantaged")]
    TaxAdvantaged,
    #[serde(rename = "cash_like")]
    CashLike,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Account {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AccountKind,
    pub balance: f64,
}

/// One asset class's share of the target allocation. Weights are normalized
/// by the simulator, not here.
#[derive(Clone, Debug, Deserialize)]
pub struct AssetWeight {
    pub class: String,
    pub weight: f64,
}

/// Ongoing contribution or withdrawal. At most one of the two amounts is
/// nonzero in practice; both are supported.
#[derive(Clone, Debug, Deserialize)]
pub struct RecurringFlow {
    pub account_type: AccountKind,
    #[serde(default)]
    pub amount_monthly: f64,
    #[serde(default)]
    pub amount_annual: f64,
}

/// One-time or repeating event. Without `repeat_months` the flow belongs to
/// its target year; with it, the flow covers a window of `repeat_months`
/// consecutive steps starting at the first step of the start year.
#[derive(Clone, Debug, Deserialize)]
pub struct ScheduledFlow {
    pub year: u32,
    pub amount: f64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub repeat_months: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CashFlows {
    #[serde(default)]
    pub recurring: Vec<RecurringFlow>,
    #[serde(default)]
    pub scheduled: Vec<ScheduledFlow>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RebalanceFrequency {
    Monthly,
    Never,
}

/// Normalized policy parameters.
#[derive(Clone, Debug)]
pub struct Constraints {
    pub liquidity_floor_pct: f64,
    pub rebalance: RebalanceFrequency,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Goal {
    pub year: u32,
    pub target: f64,
    #[serde(default = "default_goal_label")]
    pub label: String,
}

fn default_goal_label() -> String {
    "Goal".to_string()
}

/// Declarative constraints section as it arrives on the wire. Any value
/// other than `monthly` (case-insensitive) disables rebalancing.
#[derive(Clone, Debug, Deserialize)]
pub struct ConstraintsSection {
    #[serde(default)]
    pub liquidity_floor_pct: f64,
    #[serde(default = "default_rebalance_frequency")]
    pub rebalance_frequency: String,
}

fn default_rebalance_frequency() -> String {
    "monthly".to_string()
}

impl Default for ConstraintsSection {
    fn default() -> Self {
        Self {
            liquidity_floor_pct: 0.0,
            rebalance_frequency: default_rebalance_frequency(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClientSection {
    #[serde(default)]
    pub time_horizon_years: Option<u32>,
}

/// The external declarative portfolio record. `accounts` and
/// `target_allocation` are required; every other section defaults to a no-op.
#[derive(Clone, Debug, Deserialize)]
pub struct PortfolioDescription {
    pub accounts: Vec<Account>,
    pub target_allocation: Vec<AssetWeight>,
    #[serde(default)]
    pub cash_flows: CashFlows,
    #[serde(default)]
    pub constraints: ConstraintsSection,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub time_horizon_years: Option<u32>,
    #[serde(default)]
    pub steps_per_year: Option<u32>,
}

const DEFAULT_HORIZON_YEARS: u32 = 20;
const DEFAULT_STEPS_PER_YEAR: u32 = 12;

/// Normalized, immutable aggregate the simulator runs against.
#[derive(Clone, Debug)]
pub struct ClientPortfolio {
    pub accounts: Vec<Account>,
    pub target_allocation: Vec<AssetWeight>,
    pub cash_flows: CashFlows,
    pub constraints: Constraints,
    pub goals: Vec<Goal>,
    pub horizon_years: u32,
    pub steps_per_year: u32,
}

impl ClientPortfolio {
    /// Builds the normalized portfolio. Type coercion only: class membership
    /// and weight normalization are validated once per run by the simulator.
    pub fn from_description(d: PortfolioDescription) -> Self {
        let horizon_years = d
            .client
            .time_horizon_years
            .or(d.time_horizon_years)
            .unwrap_or(DEFAULT_HORIZON_YEARS);
        let rebalance = if d.constraints.rebalance_frequency.eq_ignore_ascii_case("monthly") {
            RebalanceFrequency::Monthly
        } else {
            RebalanceFrequency::Never
        };
        ClientPortfolio {
            accounts: d.accounts,
            target_allocation: d.target_allocation,
            cash_flows: d.cash_flows,
            constraints: Constraints {
                liquidity_floor_pct: d.constraints.liquidity_floor_pct,
                rebalance,
            },
            goals: d.goals,
            horizon_years,
            steps_per_year: d.steps_per_year.unwrap_or(DEFAULT_STEPS_PER_YEAR),
        }
    }

    pub fn total_steps(&self) -> usize {
        (self.horizon_years * self.steps_per_year) as usize
    }

    pub fn initial_wealth(&self) -> f64 {
        self.accounts.iter().map(|a| a.balance).sum()
    }
}
