use thiserror::Error;

/// Error kinds surfaced by the simulation core.
///
/// The driver treats `Convergence` as a per-step fault (metrics become NaN
/// and the run continues); `InsufficientLiquidity` drops the offending
/// trade; `Solver` falls back to a zero-trade vector. `DataUnavailable`
/// and `Config` are fatal before any simulation starts.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("{0} iteration exceeded {max} steps without converging", max = crate::pool::MAX_ITER)]
    Convergence(&'static str),

    #[error("insufficient liquidity: exchange output would be zero or negative")]
    InsufficientLiquidity,

    #[error("solver failed: {0}")]
    Solver(String),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("config error: {0}")]
    Config(String),
}
