//! Command-line interface definitions using clap derive macros.
//!
//! Contains the top-level [`Cli`] parser, the [`Commands`] enum for
//! subcommands (run, validate), and their associated argument structs.
//! Every `run` flag has an environment variable equivalent for container
//! deployments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "gatehouse",
    version,
    long_version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("GATEHOUSE_GIT_SHORT"),
        ", ",
        env!("GATEHOUSE_BUILD_PROFILE"),
        ")"
    ),
    about = "Hot-reconfigurable HTTP reverse-proxy gateway",
    propagate_version = true,
    after_help = "\x1b[1mQuick start:\x1b[0m\n  \
        gatehouse run -c gatehouse.yaml         Start the gateway\n  \
        gatehouse validate gatehouse.yaml       Check a config file"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway
    Run(Box<RunArgs>),

    /// Validate a config file without starting
    Validate(ValidateArgs),
}

#[derive(Args)]
#[command(after_help = "\x1b[1mExamples:\x1b[0m\n  \
        gatehouse run -c gatehouse.yaml                      Start with a config file\n  \
        gatehouse run -c gatehouse.yaml --pretty -l debug    Local dev mode\n  \
        gatehouse run -c gatehouse.yaml --log-file gw.log    Log to a file")]
pub struct RunArgs {
    /// Config file path (.yaml, .yml, .json, .toml)
    #[arg(short, long, env = "GATEHOUSE_CONFIG", default_value = "gatehouse.yaml")]
    pub config: PathBuf,

    // -- Logging --
    /// Log level
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Force pretty (human-readable) log output
    #[arg(long, env = "LOG_PRETTY")]
    pub pretty: bool,

    /// Force JSON log output (overrides TTY detection)
    #[arg(long, env = "LOG_JSON", conflicts_with = "pretty")]
    pub json: bool,

    /// Append logs to this file instead of stdout
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    // -- Tuning --
    /// Config refresh interval in seconds (0 disables hot reload)
    #[arg(
        long,
        env = "POLL_INTERVAL_SECS",
        default_value_t = 30,
        help_heading = "Tuning"
    )]
    pub poll_interval: u64,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Config file to validate
    #[arg(default_value = "gatehouse.yaml")]
    pub config: PathBuf,

    /// Output format
    #[arg(long, default_value = "text")]
    pub format: ValidateFormat,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn to_tracing_level(&self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Clone, Debug, ValueEnum)]
pub enum ValidateFormat {
    Text,
    Json,
}
