//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::scenario::Scenario;

/// runctl - cross-triggered run control for multi-core debug sessions
#[derive(Parser)]
#[command(
    name = "runctl",
    about = "Cross-triggered halt/resume coordination for multi-core debug sessions",
    version,
    after_help = "Logs are written to: ~/.local/share/runctl/logs/runctl.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Validate the configuration and show each cluster's CTI wiring
    Check,

    /// Examine every core of the simulated target and show its state
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run validation scenarios against the simulated target
    Scenario {
        /// Scenarios to run (default: all)
        #[arg(value_name = "NAME")]
        names: Vec<Scenario>,
    },
}

/// Output format for the status command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Location of the log file written by `runctl`
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runctl")
        .join("logs")
        .join("runctl.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_no_command() {
        let cli = Cli::parse_from(["runctl"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parse_check() {
        let cli = Cli::parse_from(["runctl", "check"]);
        assert!(matches!(cli.command, Some(Command::Check)));
    }

    #[test]
    fn test_cli_parse_status_json() {
        let cli = Cli::parse_from(["runctl", "status", "--format", "json"]);
        assert!(matches!(
            cli.command,
            Some(Command::Status {
                format: OutputFormat::Json
            })
        ));
    }

    #[test]
    fn test_cli_parse_scenarios() {
        let cli = Cli::parse_from(["runctl", "scenario", "group-halt", "timeout"]);
        if let Some(Command::Scenario { names }) = cli.command {
            assert_eq!(names, vec![Scenario::GroupHalt, Scenario::Timeout]);
        } else {
            panic!("Expected Scenario command");
        }
    }

    #[test]
    fn test_cli_rejects_unknown_scenario() {
        assert!(Cli::try_parse_from(["runctl", "scenario", "single-step"]).is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["runctl", "-c", "/path/to/runctl.yml", "-v", "check"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/runctl.yml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_log_path() {
        assert!(get_log_path().ends_with("runctl/logs/runctl.log"));
    }
}
