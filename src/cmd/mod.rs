//! Subcommands. `run` serves a configuration, `validate` checks one.

pub mod run;
pub mod validate;

use crate::cli::{Cli, Commands};
use crate::error::GatewayError;

pub async fn dispatch(cli: Cli) -> Result<(), GatewayError> {
    match cli.command {
        Some(Commands::Run(args)) => run::execute(*args).await,
        Some(Commands::Validate(ref args)) => validate::execute(args),
        None => {
            print_welcome();
            Ok(())
        }
    }
}

fn print_welcome() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        "\n  gatehouse v{version}: hot-reconfigurable HTTP reverse-proxy gateway\n\n  \
         No command provided. To get started:\n\n    \
         gatehouse run -c example/gatehouse.yaml     Serve a config, reloading it on change\n    \
         gatehouse validate example/full.yaml        Check a config and dry-run its TLS\n    \
         gatehouse --help                            See all commands and options\n\n  \
         Configs may be YAML, JSON or TOML.\n"
    );
}
