//! Error type shared by the localization and simulation core.
//!
//! Recoverable situations (a beam that hits nothing, an observation with no unique landmark, a
//! collision) are reported as ordinary values by the modules that produce them. The variants here
//! cover inputs the core refuses to process.
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LocalizationError>;

#[derive(Debug, Error)]
pub enum LocalizationError {
    /// Importance weights handed to the particle filter contain NaN.
    #[error("importance weights contain NaN ({count} of {total})")]
    NanWeights { count: usize, total: usize },
    #[error("importance weight {index} is negative ({value})")]
    NegativeWeight { index: usize, value: f64 },
    /// A range fed into the perception model is NaN or infinite.
    #[error("range for beam {beam} is not finite ({value})")]
    NonFiniteRange { beam: usize, value: f64 },
    #[error("beam count mismatch: {observed} observed, {simulated} simulated")]
    BeamCountMismatch { observed: usize, simulated: usize },
    /// A vector argument has the wrong number of components.
    #[error("expected {expected} components, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
    #[error("particle count mismatch: {poses} poses, {weights} weights")]
    ParticleCountMismatch { poses: usize, weights: usize },
    #[error("the particle set is empty")]
    EmptyParticleSet,
    /// A drive command of one variant was applied to a drive of the other.
    #[error("{command} command cannot drive a {drive} robot")]
    CommandMismatch {
        command: &'static str,
        drive: &'static str,
    },
    #[error("innovation covariance is not positive definite")]
    SingularInnovation,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A sampling distribution could not be constructed.
    #[error("sampling failed: {0}")]
    Sampling(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rand::distr::weighted::Error> for LocalizationError {
    fn from(err: rand::distr::weighted::Error) -> Self {
        LocalizationError::Sampling(err.to_string())
    }
}

impl From<rand_distr::NormalError> for LocalizationError {
    fn from(err: rand_distr::NormalError) -> Self {
        LocalizationError::Sampling(err.to_string())
    }
}
