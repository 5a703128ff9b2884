//! File-backed config source with SHA-256 change detection.
//!
//! [`FileSource`] is format-agnostic: the YAML, JSON and TOML modules only supply
//! the deserializer. Every load is validated before it is handed out, so a
//! half-edited file never reaches the running gateway.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::sha256_hex;
use crate::config::model::Config;
use crate::config::validation::validate;
use crate::config::{ConfigSource, ConfigVersion};
use crate::error::GatewayError;

pub type Deserialize = fn(&str) -> Result<Config, Box<dyn std::error::Error + Send + Sync>>;

pub struct FileSource {
    path: PathBuf,
    name: &'static str,
    deserialize: Deserialize,
}

impl FileSource {
    #[must_use]
    pub fn new(path: PathBuf, name: &'static str, deserialize: Deserialize) -> Self {
        Self {
            path,
            name,
            deserialize,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<String, GatewayError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GatewayError::ConfigFileNotFound {
                    path: self.path.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn version_of(content: &str) -> ConfigVersion {
        ConfigVersion::Hash(sha256_hex(content.as_bytes()))
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn load(&self) -> Result<(Config, ConfigVersion), GatewayError> {
        let content = self.read().await?;
        let config = (self.deserialize)(&content).map_err(|source| GatewayError::ConfigParse {
            path: self.path.display().to_string(),
            source,
        })?;
        validate(&config).map_err(|errors| GatewayError::ConfigValidation { errors })?;

        tracing::debug!(
            path = %self.path.display(),
            entry_points = config.entry_points.len(),
            "config file loaded"
        );
        Ok((config, Self::version_of(&content)))
    }

    async fn has_changed(&self, current: &ConfigVersion) -> Result<bool, GatewayError> {
        let content = self.read().await?;
        Ok(*current != Self::version_of(&content))
    }
}
