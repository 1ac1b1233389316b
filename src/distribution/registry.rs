//! Static catalogue of the available distributions
//!
//! Each entry names a distribution, lists its parameters with their types and
//! defaults, and knows how to construct it. The CLI generates its subcommands
//! from this table and the configuration loader resolves `name`/`params`
//! blocks through it. Adding a distribution means adding an entry here.

use crate::distribution::error::{DistributionError, DistributionResult};
use crate::distribution::types::{Distribution, DEFAULT_GAUSSIAN_STRICTLY_POSITIVE};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    Bool,
}

impl ParamKind {
    fn expected(&self) -> &'static str {
        match self {
            ParamKind::Float => "number",
            ParamKind::Bool => "boolean",
        }
    }
}

/// A parameter value as supplied by a config file or the command line
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Float(f64),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{value}"),
            ParamValue::Float(value) => write!(f, "{value}"),
        }
    }
}

/// Named parameter values for one distribution
pub type DistributionParams = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    /// Key used in configuration files
    pub name: &'static str,
    /// Long command line flag (without the leading dashes)
    pub flag: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<ParamValue>,
    pub help: &'static str,
}

pub struct DistributionSchema {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub summary: &'static str,
    pub params: &'static [ParamSpec],
    construct: fn(&ResolvedParams) -> DistributionResult<Distribution>,
}

impl fmt::Debug for DistributionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributionSchema")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("params", &self.params)
            .finish()
    }
}

impl DistributionSchema {
    pub fn param(&self, name: &str) -> Option<&'static ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Validate `params` against this schema and construct the distribution.
    pub fn build(&'static self, params: &DistributionParams) -> DistributionResult<Distribution> {
        if let Some(unknown) = params.keys().find(|key| self.param(key).is_none()) {
            return Err(DistributionError::UnknownParameter {
                distribution: self.name,
                name: unknown.clone(),
            });
        }

        let mut values = BTreeMap::new();
        for spec in self.params {
            let value = match params.get(spec.name).copied().or(spec.default) {
                Some(value) => value,
                None if spec.required => {
                    return Err(DistributionError::MissingParameter {
                        distribution: self.name,
                        name: spec.name.to_string(),
                    })
                }
                None => continue,
            };

            let value = match (spec.kind, value) {
                (ParamKind::Float, ParamValue::Float(_))
                | (ParamKind::Bool, ParamValue::Bool(_)) => value,
                _ => {
                    return Err(DistributionError::ParameterType {
                        distribution: self.name,
                        name: spec.name.to_string(),
                        expected: spec.kind.expected(),
                    })
                }
            };
            values.insert(spec.name, value);
        }

        (self.construct)(&ResolvedParams {
            schema: self,
            values,
        })
    }
}

/// Parameters that passed schema validation, defaults filled in
struct ResolvedParams {
    schema: &'static DistributionSchema,
    values: BTreeMap<&'static str, ParamValue>,
}

impl ResolvedParams {
    fn missing(&self, name: &str) -> DistributionError {
        DistributionError::MissingParameter {
            distribution: self.schema.name,
            name: name.to_string(),
        }
    }

    fn float(&self, name: &str) -> DistributionResult<f64> {
        match self.values.get(name) {
            Some(ParamValue::Float(value)) => Ok(*value),
            _ => Err(self.missing(name)),
        }
    }

    fn boolean(&self, name: &str) -> DistributionResult<bool> {
        match self.values.get(name) {
            Some(ParamValue::Bool(value)) => Ok(*value),
            _ => Err(self.missing(name)),
        }
    }
}

const fn float_param(name: &'static str, help: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        flag: name,
        kind: ParamKind::Float,
        required: true,
        default: None,
        help,
    }
}

static REGISTRY: [DistributionSchema; 5] = [
    DistributionSchema {
        name: "constant",
        aliases: &["fixed"],
        summary: "Fixed delay after every chunk",
        params: &[float_param("constant", "Delay in seconds")],
        construct: |p| Distribution::constant(p.float("constant")?),
    },
    DistributionSchema {
        name: "gaussian",
        aliases: &["normal"],
        summary: "Normally distributed delay",
        params: &[
            float_param("mean", "Mean delay in seconds"),
            ParamSpec {
                name: "std_dev",
                flag: "std-dev",
                kind: ParamKind::Float,
                required: true,
                default: None,
                help: "Standard deviation in seconds",
            },
            ParamSpec {
                name: "strictly_positive",
                flag: "strictly-positive",
                kind: ParamKind::Bool,
                required: false,
                default: Some(ParamValue::Bool(DEFAULT_GAUSSIAN_STRICTLY_POSITIVE)),
                help: "Clamp negative samples to zero",
            },
        ],
        construct: |p| {
            Distribution::gaussian(
                p.float("mean")?,
                p.float("std_dev")?,
                p.boolean("strictly_positive")?,
            )
        },
    },
    DistributionSchema {
        name: "exponential",
        aliases: &["exp"],
        summary: "Exponentially distributed delay",
        params: &[float_param("scale", "Scale (mean) in seconds")],
        construct: |p| Distribution::exponential(p.float("scale")?),
    },
    DistributionSchema {
        name: "lognormal",
        aliases: &["lognorm", "log-normal"],
        summary: "Log-normally distributed delay",
        params: &[
            float_param("mean", "Mean of the underlying normal distribution"),
            ParamSpec {
                name: "std_dev",
                flag: "std-dev",
                kind: ParamKind::Float,
                required: true,
                default: None,
                help: "Standard deviation of the underlying normal distribution",
            },
        ],
        construct: |p| Distribution::log_normal(p.float("mean")?, p.float("std_dev")?),
    },
    DistributionSchema {
        name: "poisson",
        aliases: &[],
        summary: "Poisson distributed delay (whole seconds)",
        params: &[float_param("mean", "Mean delay in seconds")],
        construct: |p| Distribution::poisson(p.float("mean")?),
    },
];

pub fn schemas() -> &'static [DistributionSchema] {
    &REGISTRY
}

/// Find a distribution by name, ignoring case.
///
/// A trailing `Distribution` is accepted too, so `GaussianDistribution`
/// resolves to `gaussian`.
pub fn lookup(name: &str) -> Option<&'static DistributionSchema> {
    let name = name.trim();
    let lower = name.to_ascii_lowercase();
    let short = lower
        .strip_suffix("distribution")
        .filter(|s| !s.is_empty())
        .unwrap_or(&lower);

    REGISTRY.iter().find(|schema| schema.matches(short))
}

/// Resolve `name` through the registry and construct it from `params`.
pub fn build(name: &str, params: &DistributionParams) -> DistributionResult<Distribution> {
    lookup(name)
        .ok_or_else(|| DistributionError::UnknownDistribution(name.to_string()))?
        .build(params)
}
