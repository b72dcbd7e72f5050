use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::{CONFIG_ENV, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(name = "potion-bridge")]
#[command(about = "Bridges the cocktail maker's controller with the shared status record")]
pub struct Cli {
    /// Settings file
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Serial port to use instead of auto-detection
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Keep the status record in memory instead of the remote database
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the bridge (default)
    Run,
    /// List serial ports and show which one would be picked
    ListPorts,
    /// Write a fresh run-start record, as the mobile app does
    StartRun,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run_with_local_config() {
        let cli = Cli::try_parse_from(["potion-bridge"]).unwrap();
        assert_eq!(cli.command(), Command::Run);
        assert_eq!(cli.port, None);
        assert!(!cli.dry_run);
    }

    #[test]
    fn port_override_after_subcommand() {
        let cli =
            Cli::try_parse_from(["potion-bridge", "run", "--port", "/dev/ttyACM1"]).unwrap();
        assert_eq!(cli.command(), Command::Run);
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM1"));
    }

    #[test]
    fn parses_tool_subcommands() {
        let cli = Cli::try_parse_from(["potion-bridge", "list-ports"]).unwrap();
        assert_eq!(cli.command(), Command::ListPorts);

        let cli = Cli::try_parse_from([
            "potion-bridge",
            "--config",
            "/etc/potion/bridge.json",
            "start-run",
        ])
        .unwrap();
        assert_eq!(cli.command(), Command::StartRun);
        assert_eq!(cli.config, PathBuf::from("/etc/potion/bridge.json"));
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["potion-bridge", "pour"]).is_err());
    }
}
