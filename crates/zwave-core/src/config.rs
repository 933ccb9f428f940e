use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use zwave_routing::{FileNvm, MemoryNvm, NvmStore};
use zwave_transport::EngineConfig;

/// Prefix of environment overrides, e.g. `ZWAVE__ENGINE__NODE_ID=5`
pub const ENV_PREFIX: &str = "ZWAVE";

/// Host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where routing state is kept; volatile when unset
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

impl NodeConfig {
    /// Storage for routing state: a directory store or an in-memory one
    pub fn open_nvm(&self) -> Result<Box<dyn NvmStore>> {
        match &self.storage_dir {
            Some(dir) => {
                let nvm = FileNvm::open(dir).with_context(|| {
                    format!("Failed to open storage directory {}", dir.display())
                })?;
                info!("Routing state stored in {}", dir.display());
                Ok(Box::new(nvm))
            }
            None => {
                info!("No storage directory configured, routing state is volatile");
                Ok(Box::new(MemoryNvm::new()))
            }
        }
    }
}

/// Load configuration from an optional file, overlaid with `ZWAVE__*` variables
///
/// The file format (TOML, YAML or JSON) follows its extension. Nested keys
/// are separated by a double underscore in variable names.
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }
        builder = builder.add_source(config::File::from(path));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config: NodeConfig = builder
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Failed to parse configuration")?;
    config
        .engine
        .validate()
        .context("Invalid engine configuration")?;
    Ok(config)
}
