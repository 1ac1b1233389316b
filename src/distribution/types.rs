use crate::distribution::error::{DistributionError, DistributionResult};
use rand_distr::Distribution as _;
use rand_distr::{Exp, LogNormal, Normal, Poisson};
use std::fmt;

/// Whether Gaussian delays clamp negative samples to zero unless told otherwise
pub const DEFAULT_GAUSSIAN_STRICTLY_POSITIVE: bool = true;

/// Anything that can produce a per-chunk delay
///
/// Implementations are shared by every pump of a relay, so `sample` must be
/// callable concurrently through a shared reference.
pub trait DelayModel: fmt::Debug + fmt::Display + Send + Sync {
    /// Draw one delay, in seconds.
    fn sample(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionKind {
    Constant,
    Gaussian,
    Exponential,
    LogNormal,
    Poisson,
}

impl DistributionKind {
    pub fn name(&self) -> &'static str {
        match self {
            DistributionKind::Constant => "constant",
            DistributionKind::Gaussian => "gaussian",
            DistributionKind::Exponential => "exponential",
            DistributionKind::LogNormal => "lognormal",
            DistributionKind::Poisson => "poisson",
        }
    }
}

#[derive(Clone)]
enum Sampler {
    Constant {
        value: f64,
    },
    Gaussian {
        mean: f64,
        std_dev: f64,
        strictly_positive: bool,
        normal: Normal<f64>,
    },
    Exponential {
        scale: f64,
        exp: Exp<f64>,
    },
    LogNormal {
        mean: f64,
        std_dev: f64,
        log_normal: LogNormal<f64>,
    },
    Poisson {
        mean: f64,
        poisson: Poisson<f64>,
    },
}

/// A validated delay distribution
///
/// Immutable after construction. Sampling draws from the calling thread's
/// RNG, so one instance can serve many pumps without locking.
#[derive(Clone)]
pub struct Distribution {
    sampler: Sampler,
}

impl Distribution {
    /// Always returns `value`.
    pub fn constant(value: f64) -> DistributionResult<Self> {
        non_negative(DistributionKind::Constant, "constant", value)?;
        Ok(Self {
            sampler: Sampler::Constant { value },
        })
    }

    /// Normal distribution, optionally clamped at zero.
    pub fn gaussian(mean: f64, std_dev: f64, strictly_positive: bool) -> DistributionResult<Self> {
        finite(DistributionKind::Gaussian, "mean", mean)?;
        non_negative(DistributionKind::Gaussian, "std_dev", std_dev)?;
        let normal = Normal::new(mean, std_dev)
            .map_err(|e| invalid(DistributionKind::Gaussian, "std_dev", e.to_string()))?;
        Ok(Self {
            sampler: Sampler::Gaussian {
                mean,
                std_dev,
                strictly_positive,
                normal,
            },
        })
    }

    /// Exponential distribution with the given scale (mean).
    pub fn exponential(scale: f64) -> DistributionResult<Self> {
        positive(DistributionKind::Exponential, "scale", scale)?;
        let exp = Exp::new(1.0 / scale)
            .map_err(|e| invalid(DistributionKind::Exponential, "scale", e.to_string()))?;
        Ok(Self {
            sampler: Sampler::Exponential { scale, exp },
        })
    }

    /// Log-normal distribution; `mean` and `std_dev` describe the underlying normal.
    pub fn log_normal(mean: f64, std_dev: f64) -> DistributionResult<Self> {
        finite(DistributionKind::LogNormal, "mean", mean)?;
        non_negative(DistributionKind::LogNormal, "std_dev", std_dev)?;
        let log_normal = LogNormal::new(mean, std_dev)
            .map_err(|e| invalid(DistributionKind::LogNormal, "std_dev", e.to_string()))?;
        Ok(Self {
            sampler: Sampler::LogNormal {
                mean,
                std_dev,
                log_normal,
            },
        })
    }

    /// Poisson distribution; samples are whole numbers.
    pub fn poisson(mean: f64) -> DistributionResult<Self> {
        positive(DistributionKind::Poisson, "mean", mean)?;
        let poisson = Poisson::new(mean)
            .map_err(|e| invalid(DistributionKind::Poisson, "mean", e.to_string()))?;
        Ok(Self {
            sampler: Sampler::Poisson { mean, poisson },
        })
    }

    pub fn kind(&self) -> DistributionKind {
        match self.sampler {
            Sampler::Constant { .. } => DistributionKind::Constant,
            Sampler::Gaussian { .. } => DistributionKind::Gaussian,
            Sampler::Exponential { .. } => DistributionKind::Exponential,
            Sampler::LogNormal { .. } => DistributionKind::LogNormal,
            Sampler::Poisson { .. } => DistributionKind::Poisson,
        }
    }

    pub fn sample(&self) -> f64 {
        let mut rng = rand::thread_rng();
        match &self.sampler {
            Sampler::Constant { value } => *value,
            Sampler::Gaussian {
                strictly_positive,
                normal,
                ..
            } => {
                let value = normal.sample(&mut rng);
                if *strictly_positive {
                    value.max(0.0)
                } else {
                    value
                }
            }
            Sampler::Exponential { exp, .. } => exp.sample(&mut rng),
            Sampler::LogNormal { log_normal, .. } => log_normal.sample(&mut rng),
            Sampler::Poisson { poisson, .. } => poisson.sample(&mut rng),
        }
    }
}

impl DelayModel for Distribution {
    fn sample(&self) -> f64 {
        Distribution::sample(self)
    }
}

impl fmt::Debug for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sampler {
            Sampler::Constant { value } => {
                f.debug_struct("Constant").field("constant", value).finish()
            }
            Sampler::Gaussian {
                mean,
                std_dev,
                strictly_positive,
                ..
            } => f
                .debug_struct("Gaussian")
                .field("mean", mean)
                .field("std_dev", std_dev)
                .field("strictly_positive", strictly_positive)
                .finish(),
            Sampler::Exponential { scale, .. } => {
                f.debug_struct("Exponential").field("scale", scale).finish()
            }
            Sampler::LogNormal { mean, std_dev, .. } => f
                .debug_struct("LogNormal")
                .field("mean", mean)
                .field("std_dev", std_dev)
                .finish(),
            Sampler::Poisson { mean, .. } => f.debug_struct("Poisson").field("mean", mean).finish(),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sampler {
            Sampler::Constant { value } => write!(f, "Constant distribution (constant: {value})"),
            Sampler::Gaussian { mean, std_dev, .. } => write!(
                f,
                "Normal distribution (mean: {mean}, standard deviation: {std_dev})"
            ),
            Sampler::Exponential { scale, .. } => {
                write!(f, "Exponential distribution (scale: {scale})")
            }
            Sampler::LogNormal { mean, std_dev, .. } => write!(
                f,
                "Log-normal distribution (mean: {mean}, standard deviation: {std_dev})"
            ),
            Sampler::Poisson { mean, .. } => write!(f, "Poisson distribution (mean: {mean})"),
        }
    }
}

fn invalid(kind: DistributionKind, name: &str, reason: impl Into<String>) -> DistributionError {
    DistributionError::InvalidParameter {
        distribution: kind.name(),
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn finite(kind: DistributionKind, name: &str, value: f64) -> DistributionResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(invalid(kind, name, format!("{value} is not a finite number")))
    }
}

fn non_negative(kind: DistributionKind, name: &str, value: f64) -> DistributionResult<()> {
    finite(kind, name, value)?;
    if value < 0.0 {
        return Err(invalid(kind, name, format!("{value} must not be negative")));
    }
    Ok(())
}

fn positive(kind: DistributionKind, name: &str, value: f64) -> DistributionResult<()> {
    finite(kind, name, value)?;
    if value <= 0.0 {
        return Err(invalid(kind, name, format!("{value} must be greater than zero")));
    }
    Ok(())
}
