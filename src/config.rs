use std::path::{Path, PathBuf};

use burn::config::Config;
use serde_json::Value;

use crate::error::ConfigError;

/// Settings of the HTTP service.
#[derive(Config, Debug)]
pub struct ServerConfig {
    /// Address to bind.
    #[config(default = "String::from(\"0.0.0.0\")")]
    pub host: String,
    /// Port to bind.
    #[config(default = 8000)]
    pub port: u16,
    /// The single origin allowed to make cross-origin requests.
    #[config(default = "String::from(\"http://localhost:3000\")")]
    pub allowed_origin: String,
    /// PyTorch `state_dict` holding the trained parameters.
    #[config(default = "PathBuf::from(\"model/the_nas_model.pth\")")]
    pub weights: PathBuf,
    /// Largest accepted request body, in bytes.
    #[config(default = 16777216)]
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    /// `host:port` to bind.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Loads a JSON config file over `base`.
///
/// Every top-level field present in the file replaces the one of `base`; the others keep
/// their value. Errors carry the path of the file.
pub fn load_config<C: Config>(path: &Path, base: &C) -> Result<C, ConfigError> {
    let load_error = |reason: String| ConfigError::Load {
        path: path.to_path_buf(),
        reason,
    };

    let content = std::fs::read_to_string(path).map_err(|err| load_error(err.to_string()))?;

    merge_config(&content, base).map_err(load_error)
}

/// Deserializes `json` field by field over `base`.
pub fn merge_config<C: Config>(json: &str, base: &C) -> Result<C, String> {
    let overrides = match serde_json::from_str::<Value>(json).map_err(|err| err.to_string())? {
        Value::Object(fields) => fields,
        other => return Err(format!("expected a JSON object, found {other}")),
    };

    let mut merged = serde_json::to_value(base).map_err(|err| err.to_string())?;
    if let Value::Object(fields) = &mut merged {
        fields.extend(overrides);
    }

    serde_json::from_value(merged).map_err(|err| err.to_string())
}
