use anyhow::{Context, Result};
use serde::Deserialize;

// Re-export component config types
pub use crate::anomaly::AnomalyConfig;
pub use crate::buffer::BufferConfig;
pub use crate::pipeline::TasksConfig;
pub use crate::sink::SinkConfig;
pub use crate::transform::{PlantBounds, TransformConfig};
pub use crate::transport::TransportConfig;
pub use crate::zone::ZonesConfig;

/// Complete ingest configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub zones: ZonesConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            transform: TransformConfig::default(),
            zones: ZonesConfig::default(),
            anomaly: AnomalyConfig::default(),
            buffer: BufferConfig::default(),
            sink: SinkConfig::default(),
            tasks: TasksConfig::default(),
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<IngestConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: IngestConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
