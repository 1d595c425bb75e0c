//! # CLI Interface
//!
//! Command-line structure for `wepay-node`: `run`, `init` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Merchant payout service.
///
/// Initiates transfers at the PSP, receives its callbacks, and credits the
/// user's balance once the user confirms.
#[derive(Parser, Debug)]
#[command(
    name = "wepay-node",
    about = "Merchant-to-user payout service",
    version,
    propagate_version = true
)]
pub struct WePayNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP service.
    Run(RunArgs),
    /// Write a development key pair, API v3 key and config template.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a TOML settings file.
    ///
    /// Values from `WEPAY_*` environment variables override the file.
    #[arg(long, short = 'c', env = "WEPAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overriding `listen_addr` from the settings.
    #[arg(long, short = 'l')]
    pub listen: Option<String>,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Directory to write the keys and `wepay.toml` into.
    #[arg(long, short = 'd', default_value = ".")]
    pub dir: PathBuf,

    /// Overwrite existing files.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        WePayNodeCli::command().debug_assert();
    }

    #[test]
    fn parses_run_overrides() {
        let cli =
            WePayNodeCli::try_parse_from(["wepay-node", "run", "-c", "x.toml", "--listen", "0.0.0.0:9"])
                .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, Some(PathBuf::from("x.toml")));
                assert_eq!(args.listen.as_deref(), Some("0.0.0.0:9"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn init_defaults_to_current_dir() {
        let cli = WePayNodeCli::try_parse_from(["wepay-node", "init"]).unwrap();
        match cli.command {
            Commands::Init(args) => {
                assert_eq!(args.dir, PathBuf::from("."));
                assert!(!args.force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
