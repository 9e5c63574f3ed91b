use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ledger-relay",
    about = "Relay state changes from one ledger into another",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay with in-process demo ledgers and the HTTP surface
    Run(RunArgs),
    /// Show delivery counts from a write-ahead log
    Status(WalArgs),
    /// List permanently failed records
    Failures(WalArgs),
    /// Abandon a permanently failed record
    Abandon(AbandonArgs),
    /// Rewrite a write-ahead log with live records only
    Compact(WalArgs),
    /// Print the default configuration as TOML
    Config,
}

#[derive(Args)]
pub struct RunArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Publish this many sample car notifications on startup
    #[arg(long, default_value_t = 0)]
    pub demo: u32,
}

#[derive(Args)]
pub struct WalArgs {
    /// Delivery ledger write-ahead log
    #[arg(long)]
    pub wal: PathBuf,
}

#[derive(Args)]
pub struct AbandonArgs {
    /// Delivery ledger write-ahead log
    #[arg(long)]
    pub wal: PathBuf,
    /// Event id (64 hex characters, optional `evt:` prefix)
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_abandon() {
        let cli = Cli::try_parse_from(["ledger-relay", "abandon", "--wal", "relay.wal", "abcd"]).unwrap();
        match cli.command {
            Command::Abandon(args) => {
                assert_eq!(args.wal, PathBuf::from("relay.wal"));
                assert_eq!(args.id, "abcd");
            }
            _ => panic!("expected abandon"),
        }
    }

    #[test]
    fn parses_run_with_json_output() {
        let cli = Cli::try_parse_from(["ledger-relay", "run", "--demo", "3", "--format", "json"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Command::Run(RunArgs { demo: 3, .. })));
    }
}
