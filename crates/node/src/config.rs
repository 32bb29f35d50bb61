// node/src/config.rs
use chain_core::ProtocolParameters;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub currency: String,
    pub data_dir: String,
    /// Fork window size W; 0 extends the confirmed chain in place
    pub branches_window_size: u64,
    /// Mine blocks when eligible
    pub participate: bool,
    /// Seconds to hold off mining after a self-issued block
    pub pow_delay: u64,
    /// CPU share handed to the proof worker, in (0, 1]
    pub cpu: f64,
    /// Seconds subtracted from the clock for the root block median time
    pub root_offset: u64,
    /// Base58 secret key of the node, if it signs blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub params: ProtocolParameters,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Env-filter directive, e.g. "info" or "consensus=debug"
    pub filter: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            currency: "wotcoin".into(),
            data_dir: "./data".into(),
            branches_window_size: 3,
            participate: false,
            pow_delay: 0,
            cpu: 0.6,
            root_offset: 120,
            secret_key: None,
            params: ProtocolParameters::default(),
            logging: LoggingConfig {
                filter: "info".into(),
            },
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.currency, "wotcoin");
        assert_eq!(config.branches_window_size, 3);
        assert!(!config.participate);
        assert!(config.cpu > 0.0 && config.cpu <= 1.0);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = NodeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.currency, config.currency);
        assert_eq!(parsed.params, config.params);
    }
}
