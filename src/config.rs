use std::path::Path;

use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::asset::{SizeLabel, SizeParams, SizeSpecs};
use crate::storage::backends::BackendConfigs;

static CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

pub fn config() -> &'static RuntimeConfig {
    CONFIG.get().expect("config init")
}

#[cfg(test)]
pub fn init_test(data: &str) -> anyhow::Result<()> {
    let cfg: RuntimeConfig = serde_yaml::from_str(data)?;
    let _ = CONFIG.set(cfg);
    Ok(())
}

pub async fn init(config_file: &Path) -> anyhow::Result<()> {
    let file = tokio::fs::read(config_file).await?;

    let cfg: RuntimeConfig = if config_file
        .extension()
        .map(|ext| ext == "json")
        .unwrap_or(false)
    {
        serde_json::from_slice(&file)?
    } else {
        serde_yaml::from_slice(&file)?
    };

    cfg.validate()?;
    let _ = CONFIG.set(cfg);

    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// The set storage backend configuration.
    pub backend: BackendConfigs,

    #[serde(default)]
    /// A set of resizing presets, this allows resizing dimensions to be accessed
    /// via a name. E.g. "small", "medium", "large", etc...
    ///
    /// Every upload gets one variant per preset.
    pub presets: HashMap<SizeLabel, SizeParams>,
}

impl RuntimeConfig {
    /// Checks the presets the same way a write would, so a bad preset is
    /// reported at startup instead of on the first upload.
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::asset::validate_sizes(&self.presets)?;
        Ok(())
    }

    pub fn sizes(&self) -> &SizeSpecs {
        &self.presets
    }

    /// The preset labels in a stable order.
    pub fn labels(&self) -> Vec<SizeLabel> {
        let mut labels: Vec<SizeLabel> = self.presets.keys().cloned().collect();
        labels.sort();
        labels
    }
}
