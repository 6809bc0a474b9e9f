//! Agent configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// The flat configuration record consumed by the agent.
///
/// On disk this is a JSON object with camelCase keys, e.g.
///
/// ```json
/// {
///     "rootPath": "/var/lib/emberlink",
///     "observeInterval": 60,
///     "bootstrapServer": "bootstrap.example.com:5683",
///     "endpointClientName": "urn:imei:490154203237518"
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Filesystem root holding resources and model definitions.
    pub root_path: PathBuf,
    /// Seconds between observe scans.
    pub observe_interval: u64,
    /// `host:port` of the clear-CoAP bootstrap endpoint.
    pub bootstrap_server: String,
    /// Identifier registered with the management server.
    pub endpoint_client_name: String,
}

impl Config {
    /// Reads the configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Config::from_json(&raw)
    }

    /// Parses the configuration from a JSON string.
    pub fn from_json(raw: &str) -> Result<Config> {
        serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_keys() {
        let config = Config::from_json(
            r#"{
                "rootPath": "/tmp/agent",
                "observeInterval": 30,
                "bootstrapServer": "bootstrap.example.com:5683",
                "endpointClientName": "device-1"
            }"#,
        )
        .unwrap();

        assert_eq!(PathBuf::from("/tmp/agent"), config.root_path);
        assert_eq!(30, config.observe_interval);
        assert_eq!("bootstrap.example.com:5683", config.bootstrap_server);
        assert_eq!("device-1", config.endpoint_client_name);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(Config::from_json("{").is_err());
    }
}
