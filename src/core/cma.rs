use std::collections::HashMap;

use serde::Deserialize;

use super::error::EngineError;

/// Asset classes covered by the baseline assumption set.
///
/// The baseline correlation table is keyed by these identifiers (via their
/// group) rather than by pattern-matching on free-form labels, so every pair
/// in the table is explicit and validated by construction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AssetClass {
    EquityUs,
    EquityUsSmallMid,
    EquityIntlDev,
    EquityIntlEm,
    FixedIncomeIg,
    FixedIncomeMuni,
    FixedIncomeIntl,
    AlternativesReit,
    AlternativesOther,
    Cash,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Group {
    Equity,
    FixedIncome,
    Reit,
    Alternatives,
    Cash,
}

impl AssetClass {
    pub const ALL: [AssetClass; 10] = [
        AssetClass::EquityUs,
        AssetClass::EquityUsSmallMid,
        AssetClass::EquityIntlDev,
        AssetClass::EquityIntlEm,
        AssetClass::FixedIncomeIg,
        AssetClass::FixedIncomeMuni,
        AssetClass::FixedIncomeIntl,
        AssetClass::AlternativesReit,
        AssetClass::AlternativesOther,
        AssetClass::Cash,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AssetClass::EquityUs => "Equity_US",
            AssetClass::EquityUsSmallMid => "Equity_US_SmallMid",
            AssetClass::EquityIntlDev => "Equity_Intl_Dev",
            AssetClass::EquityIntlEm => "Equity_Intl_EM",
            AssetClass::FixedIncomeIg => "Fixed_Income_IG",
            AssetClass::FixedIncomeMuni => "Fixed_Income_Muni",
            AssetClass::FixedIncomeIntl => "Fixed_Income_Intl",
            AssetClass::AlternativesReit => "Alternatives_REIT",
            AssetClass::AlternativesOther => "Alternatives_Other",
            AssetClass::Cash => "Cash",
        }
    }

    fn group(self) -> Group {
        match self {
            AssetClass::EquityUs
            | AssetClass::EquityUsSmallMid
            | AssetClass::EquityIntlDev
            | AssetClass::EquityIntlEm => Group::Equity,
            AssetClass::FixedIncomeIg
            | AssetClass::FixedIncomeMuni
            | AssetClass::FixedIncomeIntl => Group::FixedIncome,
            AssetClass::AlternativesReit => Group::Reit,
            AssetClass::AlternativesOther => Group::Alternatives,
            AssetClass::Cash => Group::Cash,
        }
    }

    fn annual_mean(self) -> f64 {
        match self {
            AssetClass::EquityUs => 0.07,
            AssetClass::EquityUsSmallMid => 0.08,
            AssetClass::EquityIntlDev => 0.065,
            AssetClass::EquityIntlEm => 0.085,
            AssetClass::FixedIncomeIg => 0.035,
            AssetClass::FixedIncomeMuni => 0.03,
            AssetClass::FixedIncomeIntl => 0.03,
            AssetClass::AlternativesReit => 0.055,
            AssetClass::AlternativesOther => 0.05,
            AssetClass::Cash => 0.02,
        }
    }

    fn annual_volatility(self) -> f64 {
        match self {
            AssetClass::EquityUs => 0.16,
            AssetClass::EquityUsSmallMid => 0.20,
            AssetClass::EquityIntlDev => 0.17,
            AssetClass::EquityIntlEm => 0.23,
            AssetClass::FixedIncomeIg => 0.07,
            AssetClass::FixedIncomeMuni => 0.06,
            AssetClass::FixedIncomeIntl => 0.08,
            AssetClass::AlternativesReit => 0.18,
            AssetClass::AlternativesOther => 0.12,
            AssetClass::Cash => 0.01,
        }
    }
}

fn group_correlation(a: Group, b: Group) -> f64 {
    match (a, b) {
        (Group::Cash, _) | (_, Group::Cash) => 0.05,
        (Group::Equity, Group::Equity) => 0.75,
        (Group::Equity, Group::Reit) | (Group::Reit, Group::Equity) => 0.65,
        (Group::Equity, Group::FixedIncome) | (Group::FixedIncome, Group::Equity) => 0.20,
        (Group::FixedIncome, Group::FixedIncome) => 0.35,
        _ => 0.30,
    }
}

/// Optional partial override of the baseline assumptions. Any map that is
/// supplied entirely replaces the corresponding baseline map; there is no
/// per-key merge.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CmaOverride {
    #[serde(default)]
    pub mu_ann: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub vol_ann: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub corr: Option<HashMap<String, HashMap<String, f64>>>,
}

impl CmaOverride {
    pub fn is_empty(&self) -> bool {
        self.mu_ann.is_none() && self.vol_ann.is_none() && self.corr.is_none()
    }
}

/// Capital market assumptions: annual expected return, annual volatility, and
/// pairwise correlation per asset class. Immutable once built.
#[derive(Clone, Debug)]
pub struct Cma {
    mu_ann: HashMap<String, f64>,
    vol_ann: HashMap<String, f64>,
    corr: HashMap<(String, String), f64>,
}

impl Cma {
    /// The baseline assumption set over [`AssetClass::ALL`].
    pub fn baseline() -> Self {
        let mut mu_ann = HashMap::new();
        let mut vol_ann = HashMap::new();
        let mut corr = HashMap::new();
        for a in AssetClass::ALL {
            mu_ann.insert(a.label().to_string(), a.annual_mean());
            vol_ann.insert(a.label().to_string(), a.annual_volatility());
            for b in AssetClass::ALL {
                let rho = if a == b {
                    1.0
                } else {
                    group_correlation(a.group(), b.group())
                };
                corr.insert((a.label().to_string(), b.label().to_string()), rho);
            }
        }
        Cma { mu_ann, vol_ann, corr }
    }

    /// Baseline with any supplied override maps swapped in wholesale.
    pub fn with_overrides(overrides: &CmaOverride) -> Result<Self, EngineError> {
        let mut cma = Cma::baseline();
        if let Some(mu) = &overrides.mu_ann {
            cma.mu_ann = mu.clone();
        }
        if let Some(vol) = &overrides.vol_ann {
            cma.vol_ann = vol.clone();
        }
        if let Some(corr) = &overrides.corr {
            cma.corr = build_correlation_table(corr)?;
        }
        Ok(cma)
    }

    pub fn annual_mean(&self, class: &str) -> Option<f64> {
        self.mu_ann.get(class).copied()
    }

    pub fn annual_volatility(&self, class: &str) -> Option<f64> {
        self.vol_ann.get(class).copied()
    }

    /// Pairwise correlation; the diagonal is unit by invariant.
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return Some(1.0);
        }
        self.corr
            .get(&(a.to_string(), b.to_string()))
            .or_else(|| self.corr.get(&(b.to_string(), a.to_string())))
            .copied()
    }
}

/// Flattens a nested `{class: {class: rho}}` override into the pair-keyed
/// table, validating range, diagonal, and symmetry. Entries given in only one
/// direction are mirrored.
fn build_correlation_table(
    nested: &HashMap<String, HashMap<String, f64>>,
) -> Result<HashMap<(String, String), f64>, EngineError> {
    let mut table: HashMap<(String, String), f64> = HashMap::new();
    for (a, row) in nested {
        for (b, &rho) in row {
            if !(-1.0..=1.0).contains(&rho) {
                return Err(EngineError::InvalidCorrelation {
                    a: a.clone(),
                    b: b.clone(),
                    value: rho,
                });
            }
            if a == b && (rho - 1.0).abs() > 1e-12 {
                return Err(EngineError::NonUnitDiagonal { class: a.clone(), value: rho });
            }
            if let Some(&reverse) = table.get(&(b.clone(), a.clone())) {
                if (reverse - rho).abs() > 1e-12 {
                    return Err(EngineError::AsymmetricCorrelation {
                        a: a.clone(),
                        b: b.clone(),
                        forward: rho,
                        reverse,
                    });
                }
            }
            table.insert((a.clone(), b.clone()), rho);
            table.insert((b.clone(), a.clone()), rho);
        }
    }
    Ok(table)
}

/// Per-step drift vector and lower-triangular covariance factor for the
/// ordered class list actually simulated.
#[derive(Clone, Debug)]
pub struct StepParams {
    pub classes: Vec<String>,
    /// Mean log-return per step, one entry per class.
    pub drift: Vec<f64>,
    /// Row-major lower-triangular factor L with L·Lᵗ = per-step covariance.
    pub chol: Vec<f64>,
}

impl StepParams {
    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }
}

/// Converts annual assumptions into per-step parameters for `classes`.
///
/// Drift is `ln(1 + mu_ann) / steps_per_year`; the per-step covariance is the
/// annual covariance (correlation scaled by the volatility outer product)
/// divided by steps_per_year, i.e. i.i.d. step increments of a discretized
/// GBM. Referencing a class absent from the assumption maps, or a covariance
/// that is not positive semi-definite, is a fatal configuration error.
pub fn derive_step_params(
    cma: &Cma,
    classes: &[String],
    steps_per_year: u32,
) -> Result<StepParams, EngineError> {
    let n = classes.len();
    let spy = steps_per_year as f64;

    let mut drift = Vec::with_capacity(n);
    let mut vol = Vec::with_capacity(n);
    for class in classes {
        let mu = cma
            .annual_mean(class)
            .ok_or_else(|| EngineError::UnknownAssetClass(class.clone()))?;
        let sigma = cma
            .annual_volatility(class)
            .ok_or_else(|| EngineError::UnknownAssetClass(class.clone()))?;
        if mu <= -1.0 {
            return Err(EngineError::InvalidAssumption(format!(
                "annual mean return for `{class}` must be greater than -1, got {mu}"
            )));
        }
        if sigma < 0.0 {
            return Err(EngineError::InvalidAssumption(format!(
                "annual volatility for `{class}` must be non-negative, got {sigma}"
            )));
        }
        drift.push((1.0 + mu).ln() / spy);
        vol.push(sigma);
    }

    let mut cov = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            let rho = cma.correlation(&classes[i], &classes[j]).ok_or_else(|| {
                EngineError::MissingCorrelation(classes[i].clone(), classes[j].clone())
            })?;
            if !(-1.0..=1.0).contains(&rho) {
                return Err(EngineError::InvalidCorrelation {
                    a: classes[i].clone(),
                    b: classes[j].clone(),
                    value: rho,
                });
            }
            cov[i * n + j] = rho * vol[i] * vol[j] / spy;
        }
    }

    let chol =
        cholesky_lower_psd(&cov, n, 1e-12).ok_or(EngineError::NotPositiveSemiDefinite)?;

    Ok(StepParams { classes: classes.to_vec(), drift, chol })
}

/// Lower-triangular Cholesky factor tolerating positive *semi*-definite
/// input: pivots within `tol` of zero produce a zero row (zero-volatility
/// classes are valid configurations), pivots below `-tol` fail.
fn cholesky_lower_psd(cov: &[f64], n: usize, tol: f64) -> Option<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[i * n + k] * l[j * n + k];
            }
            if i == j {
                let pivot = cov[i * n + i] - sum;
                if pivot < -tol {
                    return None;
                }
                l[i * n + i] = if pivot > tol { pivot.sqrt() } else { 0.0 };
            } else {
                let denom = l[j * n + j];
                l[i * n + j] = if denom.abs() > tol {
                    (cov[i * n + j] - sum) / denom
                } else {
                    0.0
                };
            }
        }
    }
    Some(l)
}
