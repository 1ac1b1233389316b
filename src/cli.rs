//! Command line definition
//!
//! Besides `config` and `distributions`, one subcommand is generated per entry
//! of the distribution registry, with one typed flag per schema parameter.

use anyhow::{bail, Context};
use clap::{crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use netjitter::config::{parse_socket_addr, ProxiesFile};
use netjitter::distribution::{
    self, DistributionParams, DistributionSchema, ParamKind, ParamValue,
};
use netjitter::relay::{DelayPolicy, RelayConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// What the user asked for
#[derive(Debug)]
pub enum Invocation {
    /// Run the relays described by a TOML file
    Config(PathBuf),
    /// Print the distribution catalogue
    Distributions,
    /// Run one relay per `--proxy` pair, all with the same distribution
    Relays(RelaysArgs),
}

#[derive(Debug)]
pub struct RelaysArgs {
    pub schema: &'static DistributionSchema,
    pub params: DistributionParams,
    pub proxies: Vec<(SocketAddr, SocketAddr)>,
    pub chunk_size: usize,
}

pub fn command() -> Command {
    let mut cmd = Command::new("netjitter")
        .version(crate_version!())
        .about("TCP relay that delays every forwarded chunk by a random amount")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("More logging (-v debug, -vv trace)"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .global(true)
                .conflicts_with("verbose")
                .help("Only log warnings and errors"),
        )
        .arg(
            Arg::new("metrics_addr")
                .long("metrics-addr")
                .value_name("IP:PORT")
                .value_parser(parse_socket_addr)
                .global(true)
                .help("Serve Prometheus metrics on this address"),
        )
        .subcommand(
            Command::new("config")
                .about("Run every relay defined in a TOML file")
                .arg(
                    Arg::new("file")
                        .value_name("FILE")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(Command::new("distributions").about("List the available delay distributions"));

    for schema in distribution::schemas() {
        cmd = cmd.subcommand(distribution_command(schema));
    }
    cmd
}

fn distribution_command(schema: &'static DistributionSchema) -> Command {
    let mut cmd = Command::new(schema.name)
        .about(schema.summary)
        .visible_aliases(schema.aliases.iter().copied())
        .arg(
            Arg::new("proxy")
                .short('p')
                .long("proxy")
                .num_args(2)
                .value_names(["BIND_ADDR", "CONNECT_ADDR"])
                .value_parser(parse_socket_addr)
                .action(ArgAction::Append)
                .required(true)
                .help("Listen on BIND_ADDR and relay to CONNECT_ADDR (repeatable)"),
        )
        .arg(
            Arg::new("chunk_size")
                .long("chunk-size")
                .value_name("BYTES")
                .value_parser(value_parser!(usize))
                .default_value(DEFAULT_CHUNK_SIZE.to_string())
                .help(format!(
                    "Maximum bytes forwarded between two delays (1 to {MAX_CHUNK_SIZE})"
                )),
        );

    for spec in schema.params {
        let mut arg = Arg::new(spec.name)
            .long(spec.flag)
            .help(spec.help)
            .required(spec.required)
            .action(ArgAction::Set);

        arg = match spec.kind {
            ParamKind::Float => arg
                .value_name("SECONDS")
                .allow_negative_numbers(true)
                .value_parser(value_parser!(f64)),
            ParamKind::Bool => arg.value_name("BOOL").value_parser(value_parser!(bool)),
        };

        if let Some(ParamValue::Bool(default)) = spec.default {
            arg = arg.default_value(if default { "true" } else { "false" });
        }
        cmd = cmd.arg(arg);
    }
    cmd
}

impl Invocation {
    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let Some((name, sub)) = matches.subcommand() else {
            bail!("no command given");
        };

        match name {
            "config" => {
                let path = sub
                    .get_one::<PathBuf>("file")
                    .context("missing config file")?;
                Ok(Invocation::Config(path.clone()))
            }
            "distributions" => Ok(Invocation::Distributions),
            other => {
                let schema = distribution::lookup(other)
                    .with_context(|| format!("unknown distribution command {other}"))?;
                Ok(Invocation::Relays(RelaysArgs::from_matches(schema, sub)?))
            }
        }
    }
}

impl RelaysArgs {
    fn from_matches(
        schema: &'static DistributionSchema,
        matches: &ArgMatches,
    ) -> anyhow::Result<Self> {
        let mut proxies = Vec::new();
        if let Some(occurrences) = matches.get_occurrences::<SocketAddr>("proxy") {
            for mut pair in occurrences {
                match (pair.next(), pair.next()) {
                    (Some(bind), Some(connect)) => proxies.push((*bind, *connect)),
                    _ => bail!("--proxy takes a bind address and a connect address"),
                }
            }
        }

        let chunk_size = matches
            .get_one::<usize>("chunk_size")
            .copied()
            .context("missing chunk size")?;

        let mut params = DistributionParams::new();
        for spec in schema.params {
            let value = match spec.kind {
                ParamKind::Float => matches
                    .get_one::<f64>(spec.name)
                    .copied()
                    .map(ParamValue::Float),
                ParamKind::Bool => matches
                    .get_one::<bool>(spec.name)
                    .copied()
                    .map(ParamValue::Bool),
            };
            if let Some(value) = value {
                params.insert(spec.name.to_string(), value);
            }
        }

        Ok(Self {
            schema,
            params,
            proxies,
            chunk_size,
        })
    }

    /// One relay configuration per proxy pair
    ///
    /// Every relay gets its own instance of the distribution.
    pub fn relay_configs(&self) -> anyhow::Result<Vec<RelayConfig>> {
        self.proxies
            .iter()
            .map(|&(bind, connect)| {
                let model = self
                    .schema
                    .build(&self.params)
                    .with_context(|| format!("invalid {} parameters", self.schema.name))?;
                RelayConfig::new(bind, connect, self.chunk_size, DelayPolicy::shared(model))
                    .with_context(|| format!("invalid relay {bind} -> {connect}"))
            })
            .collect()
    }
}

/// Resolve a configuration file, skipping entries that fail validation
pub fn load_config(path: &Path) -> anyhow::Result<Vec<RelayConfig>> {
    let file = ProxiesFile::from_path(path)?;
    let mut configs = Vec::new();

    for result in file.resolve()? {
        match result {
            Ok(config) => configs.push(config),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Skipping invalid proxy"),
        }
    }

    if configs.is_empty() {
        bail!("no valid proxies in {}", path.display());
    }
    Ok(configs)
}

/// Default log filter when `RUST_LOG` is unset
pub fn log_level(matches: &ArgMatches) -> &'static str {
    if matches.get_flag("quiet") {
        return "warn";
    }
    match matches.get_count("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

pub fn metrics_addr(matches: &ArgMatches) -> Option<SocketAddr> {
    matches.get_one::<SocketAddr>("metrics_addr").copied()
}

/// Human readable listing of the registry
pub fn catalogue() -> String {
    let mut out = String::new();
    for schema in distribution::schemas() {
        let _ = write!(out, "{}", schema.name);
        if !schema.aliases.is_empty() {
            let _ = write!(out, " (aliases: {})", schema.aliases.join(", "));
        }
        let _ = writeln!(out, ": {}", schema.summary);

        for spec in schema.params {
            let kind = match spec.kind {
                ParamKind::Float => "float",
                ParamKind::Bool => "bool",
            };
            let _ = write!(out, "    --{:<20} {:<6} {}", spec.flag, kind, spec.help);
            match spec.default {
                Some(default) => {
                    let _ = write!(out, " [default: {default}]");
                }
                None if spec.required => out.push_str(" [required]"),
                None => {}
            }
            out.push('\n');
        }
    }
    out
}
