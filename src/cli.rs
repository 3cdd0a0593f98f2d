use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dbft-node")]
#[command(version, about = "dBFT consensus node for a permissioned validator set", long_about = None)]
#[command(author = "dBFT Node Team")]
pub struct Cli {
    #[arg(short, long, global = true, help = "Path to a TOML config file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "text", help = "Log output format")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the consensus node (default mode)
    Run,

    /// Generate a new validator key pair
    Keygen,

    /// Show node identity and validator set
    Info,

    /// Print a signed sample envelope as hex for wire debugging
    EncodeSample {
        #[arg(short, long, default_value = "1", help = "Block height of the sample")]
        height: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let cli = Cli::try_parse_from(["dbft-node"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dbft-node",
            "encode-sample",
            "--height",
            "7",
            "--log-format",
            "json",
            "--config",
            "node.toml",
        ])
        .unwrap();

        assert!(matches!(cli.command, Some(Commands::EncodeSample { height: 7 })));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("node.toml")));
    }
}
