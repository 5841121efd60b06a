use clap::{Parser, Subcommand};

use crate::catalog::SortMode;

#[derive(Parser, Debug)]
#[command(
    name = "skillsync",
    version,
    about = "Keep a live catalog and usage history of Claude Code / Codex skills"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch skill directories and session logs, refreshing on change (default).
    Watch,
    /// Run one refresh and print catalog and cache counts.
    Status,
    /// Print skills ranked by recorded use.
    Usage {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print the grouped skill and agent catalog.
    Catalog {
        #[arg(long, value_enum)]
        sort: Option<SortMode>,
    },
    /// Run health diagnostics for watched directories and the usage cache.
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::parse_from(["skillsync", "usage", "--limit", "5", "--json"]);
        assert!(matches!(cli.command, Some(Commands::Usage { limit: 5, json: true })));

        let cli = Cli::parse_from(["skillsync", "catalog", "--sort", "most-used"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Catalog {
                sort: Some(SortMode::MostUsed)
            })
        ));

        assert!(Cli::parse_from(["skillsync"]).command.is_none());
    }
}
