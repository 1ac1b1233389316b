//! Delay distributions
//!
//! Samplers that produce the artificial delay (in seconds) a relay waits
//! after forwarding each chunk.
//!
//! Key features:
//! - Constant, Gaussian, exponential, log-normal and Poisson models
//! - Parameter validation at construction time
//! - Static registry with a declarative parameter schema per distribution

pub mod error;
pub mod registry;
pub mod types;

pub use error::{DistributionError, DistributionResult};
pub use registry::{
    build, lookup, schemas, DistributionParams, DistributionSchema, ParamKind, ParamSpec,
    ParamValue,
};
pub use types::{DelayModel, Distribution, DistributionKind, DEFAULT_GAUSSIAN_STRICTLY_POSITIVE};
