use std::path::PathBuf;

use clap::Parser;
use tracing_core::LevelFilter;

use crate::{
    config::{load_config, ServerConfig},
    error::ConfigError,
    model::NasModelConfig,
};

/// Serve the NAS brain tumor classifier over HTTP.
#[derive(Parser, Debug)]
#[command(name = "nas-classifier", version, about)]
pub struct Cli {
    /// JSON server config; flags below override its values.
    #[arg(long, env = "NAS_CONFIG")]
    pub config: Option<PathBuf>,

    /// JSON architecture description replacing the built-in one.
    #[arg(long, env = "NAS_ARCHITECTURE")]
    pub architecture: Option<PathBuf>,

    /// PyTorch parameter file.
    #[arg(long, env = "NAS_WEIGHTS")]
    pub weights: Option<PathBuf>,

    #[arg(long, env = "NAS_HOST")]
    pub host: Option<String>,

    #[arg(long, short, env = "NAS_PORT")]
    pub port: Option<u16>,

    /// Origin allowed to make cross-origin requests.
    #[arg(long, env = "NAS_ALLOWED_ORIGIN")]
    pub allowed_origin: Option<String>,

    #[arg(long, env = "NAS_LOG", default_value = "info")]
    pub log_level: LevelFilter,
}

impl Cli {
    /// Server settings: defaults, then the config file, then the flags.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path, &ServerConfig::new())?,
            None => ServerConfig::new(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(origin) = &self.allowed_origin {
            config.allowed_origin = origin.clone();
        }
        if let Some(weights) = &self.weights {
            config.weights = weights.clone();
        }

        Ok(config)
    }

    /// The architecture to build: the built-in one, with the fields of the architecture
    /// file replacing its own when one is given.
    pub fn architecture(&self) -> Result<NasModelConfig, ConfigError> {
        match &self.architecture {
            Some(path) => load_config(path, &NasModelConfig::tumor_classifier()),
            None => Ok(NasModelConfig::tumor_classifier()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "nas-classifier",
            "--port",
            "9000",
            "--weights",
            "weights/model.pth",
            "--allowed-origin",
            "https://scans.example.org",
            "--log-level",
            "debug",
        ])
        .unwrap();

        let config = cli.server_config().unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.weights, PathBuf::from("weights/model.pth"));
        assert_eq!(config.allowed_origin, "https://scans.example.org");
        assert_eq!(cli.log_level, LevelFilter::DEBUG);
    }

    #[test]
    fn built_in_architecture_by_default() {
        let cli = Cli::try_parse_from(["nas-classifier"]).unwrap();

        let architecture = cli.architecture().unwrap();

        assert_eq!(architecture.conv_layers.len(), 6);
        assert_eq!(architecture.fc_layers.len(), 2);
        assert_eq!(architecture.num_classes, 4);
    }

    #[test]
    fn architecture_file_replaces_the_declared_stages() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/small_nas.json");
        let cli = Cli::try_parse_from(["nas-classifier", "--architecture", path]).unwrap();

        let architecture = cli.architecture().unwrap();

        assert_eq!(architecture.conv_layers.len(), 2);
        assert_eq!(architecture.conv_layers[1].activation, "leakyrelu");
        assert_eq!(architecture.fc_layers.len(), 1);
        assert_eq!(architecture.dropout, 0.3);
        assert_eq!(architecture.num_classes, 4);
    }

    #[test]
    fn config_file_is_layered_under_the_flags() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/server.json");
        let cli =
            Cli::try_parse_from(["nas-classifier", "--config", path, "--port", "7000"]).unwrap();

        let config = cli.server_config().unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.allowed_origin, "https://scans.example.org");
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn unreadable_architecture_file_is_an_error() {
        let cli =
            Cli::try_parse_from(["nas-classifier", "--architecture", "missing/arch.json"]).unwrap();

        assert!(matches!(cli.architecture(), Err(ConfigError::Load { .. })));
    }
}
