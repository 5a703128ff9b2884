//! Configuration loading, validation, and change detection.
//!
//! Defines the [`ConfigSource`] trait for pluggable config backends and the
//! [`ConfigVersion`] enum used by the refresh loop to notice edits.
//! Submodules provide the data model, duration parsing, validation logic,
//! and the file-based source implementations.

pub mod duration;
pub mod model;
pub mod sources;
pub mod validation;

use async_trait::async_trait;

use crate::error::GatewayError;
use model::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigVersion {
    Hash(String),
}

// async_trait keeps ConfigSource object safe for Box<dyn ConfigSource>.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load(&self) -> Result<(Config, ConfigVersion), GatewayError>;
    async fn has_changed(&self, current: &ConfigVersion) -> Result<bool, GatewayError>;
}
