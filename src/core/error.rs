use thiserror::Error;

/// Fatal conditions surfaced before or during a run. None of these are
/// retried; defaults are only ever applied at construction time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("asset class `{0}` is not present in the capital market assumptions")]
    UnknownAssetClass(String),

    #[error("no correlation defined for asset classes `{0}` and `{1}`")]
    MissingCorrelation(String, String),

    #[error("correlation for `{a}`/`{b}` is {value}, outside [-1, 1]")]
    InvalidCorrelation { a: String, b: String, value: f64 },

    #[error("conflicting correlation override for `{a}`/`{b}`: {forward} vs {reverse}")]
    AsymmetricCorrelation {
        a: String,
        b: String,
        forward: f64,
        reverse: f64,
    },

    #[error("correlation of `{class}` with itself is {value}, expected 1")]
    NonUnitDiagonal { class: String, value: f64 },

    #[error("invalid capital market assumption: {0}")]
    InvalidAssumption(String),

    #[error("per-step covariance matrix is not positive semi-definite")]
    NotPositiveSemiDefinite,

    #[error("target allocation weights sum to zero")]
    ZeroWeightSum,

    #[error("invalid run configuration: {0}")]
    InvalidRunConfig(String),

    #[error("malformed portfolio description: {0}")]
    MalformedInput(String),
}
