use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use relay_engine::{RelayConfig, StoreConfig};
use relay_server::ServerConfig;

/// Everything `ledger-relay run` reads from its configuration file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub relay: RelayConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        config.relay.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
