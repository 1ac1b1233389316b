use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributionError {
    #[error("Unknown distribution: {0}")]
    UnknownDistribution(String),

    #[error("Invalid parameter {name} for {distribution}: {reason}")]
    InvalidParameter {
        distribution: &'static str,
        name: String,
        reason: String,
    },

    #[error("Missing required parameter {name} for {distribution}")]
    MissingParameter {
        distribution: &'static str,
        name: String,
    },

    #[error("Unknown parameter {name} for {distribution}")]
    UnknownParameter {
        distribution: &'static str,
        name: String,
    },

    #[error("Parameter {name} for {distribution} must be a {expected}")]
    ParameterType {
        distribution: &'static str,
        name: String,
        expected: &'static str,
    },
}

pub type DistributionResult<T> = Result<T, DistributionError>;
