//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, UpdateCheckType};

/// Tessera command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tessera", about = "Tessera multiplayer host")]
pub struct CliArgs {
    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Session update mode.
    #[arg(long, value_parser = parse_update_check)]
    pub update_check: Option<UpdateCheckType>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn parse_update_check(value: &str) -> Result<UpdateCheckType, String> {
    match value.to_ascii_lowercase().as_str() {
        "time" => Ok(UpdateCheckType::Time),
        "frame" => Ok(UpdateCheckType::Frame),
        other => Err(format!("unknown update check `{other}` (expected time or frame)")),
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(max) = args.max_connections {
            self.network.max_connections = max;
        }
        if let Some(check) = args.update_check {
            self.network.update_check = check;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            server: Some("192.168.1.1".to_string()),
            update_check: Some(UpdateCheckType::Frame),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.server_address, "192.168.1.1");
        assert_eq!(config.network.update_check, UpdateCheckType::Frame);
        // Non-overridden fields retain defaults
        assert_eq!(config.network.server_port, 7777);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_from_args() {
        let args = CliArgs::parse_from(["tessera", "--port", "9100", "--update-check", "frame"]);
        assert_eq!(args.port, Some(9100));
        assert_eq!(args.update_check, Some(UpdateCheckType::Frame));
    }

    #[test]
    fn test_parse_rejects_unknown_update_check() {
        let result = CliArgs::try_parse_from(["tessera", "--update-check", "sometimes"]);
        assert!(result.is_err());
    }
}
