//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Verifies that traffic leaves through the anonymity layer and blocks all
/// traffic the moment it does not
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: `$XDG_CONFIG_HOME/anonwatch/config.toml`)
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log firewall commands instead of running them
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Monitor continuously until interrupted (default)
    Run,
    /// Run every check once and report; never touches the firewall
    Check,
    /// Print the effective configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults_to_no_subcommand() {
        let cli = Cli::parse_from(["anonwatch"]);
        assert!(cli.command.is_none());
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["anonwatch", "check", "--dry-run", "-c", "/tmp/aw.toml"]);
        assert_eq!(cli.command, Some(Command::Check));
        assert!(cli.dry_run);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/aw.toml")));
    }
}
