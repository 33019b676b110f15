//! Proxy configuration: defaults, optional TOML file, CLI overrides.
//!
//! Precedence, lowest to highest: built-in defaults, configuration file,
//! command-line arguments.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Command-line interface for the proxy.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "QUIC proxy with FPGA acceleration offload", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "satq.toml")]
    pub config: String,

    /// Listen port for incoming connections (overrides config file)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Bind address (overrides config file)
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// FPGA device path (overrides config file)
    #[arg(long, short = 'd')]
    pub device: Option<PathBuf>,

    /// Enable or disable FPGA acceleration
    #[arg(long, short = 'a', action = clap::ArgAction::Set)]
    pub acceleration: Option<bool>,

    /// Run in simulation mode without real FPGA
    #[arg(long, short = 's')]
    pub simulation: bool,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// Resolved proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// UDP port the dispatcher listens on.
    pub port: u16,

    /// Address to bind to.
    pub bind: String,

    /// Path of the accelerator's character device.
    pub device: PathBuf,

    /// Offload framing/ACK/retransmission work to the accelerator.
    pub acceleration: bool,

    /// Serve the accelerator contract from the CPU fallback instead of
    /// opening the device.
    pub simulation: bool,

    /// Debug-level logging plus periodic statistics output.
    pub verbose: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            bind: "0.0.0.0".to_string(),
            device: PathBuf::from("/dev/fpga0"),
            acceleration: true,
            simulation: false,
            verbose: false,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        self.bind
            .parse::<IpAddr>()
            .with_context(|| format!("invalid bind address: {}", self.bind))?;
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        Ok(())
    }
}

/// Load and merge configuration sources.
pub fn load_config() -> Result<ProxyConfig> {
    let cli = CliArgs::parse();
    load_with_cli(cli)
}

fn load_with_cli(cli: CliArgs) -> Result<ProxyConfig> {
    let mut config = load_config_file(Path::new(&cli.config))?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(acceleration) = cli.acceleration {
        config.acceleration = acceleration;
    }
    if cli.simulation {
        config.simulation = true;
    }
    if cli.verbose {
        config.verbose = true;
    }

    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<ProxyConfig> {
    if !path.exists() {
        return Ok(ProxyConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse TOML config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("satq").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8443);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.device, PathBuf::from("/dev/fpga0"));
        assert!(config.acceleration);
        assert!(!config.simulation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides() {
        let config = load_with_cli(cli(&[
            "--config",
            "/nonexistent/satq.toml",
            "--port",
            "9000",
            "--bind",
            "127.0.0.1",
            "--acceleration",
            "false",
            "--simulation",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, "127.0.0.1");
        assert!(!config.acceleration);
        assert!(config.simulation);
        assert!(config.verbose);
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let result = load_with_cli(cli(&[
            "--config",
            "/nonexistent/satq.toml",
            "--bind",
            "not-an-address",
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_file_parses() {
        let config: ProxyConfig = toml::from_str(
            r#"
            port = 4433
            bind = "::1"
            simulation = true
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 4433);
        assert_eq!(config.bind, "::1");
        assert!(config.simulation);
        // Unspecified fields keep their defaults.
        assert!(config.acceleration);
    }
}
