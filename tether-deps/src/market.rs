//! Plugin market collaborator.

use crate::Result;
use async_trait::async_trait;
use tether_types::{PluginId, PluginManifest};

/// Remote catalogue used for auto-install and update checks.
///
/// Implementations report failures as [`crate::DepsError::Market`]; the
/// resolver treats them as "still unsatisfied", never as fatal.
#[async_trait]
pub trait PluginMarket: Send + Sync {
    /// Latest published manifest for `id`, if the market knows it.
    async fn get_details(&self, id: &PluginId) -> Result<Option<PluginManifest>>;

    /// Package bytes for one published version.
    async fn get_package(&self, id: &PluginId, version: &str) -> Result<Vec<u8>>;
}

/// A package the resolver fetched while auto-installing. Installing it is
/// the caller's job.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPackage {
    pub manifest: PluginManifest,
    pub bytes: Vec<u8>,
}

/// A newer version reported by the market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub plugin_id: PluginId,
    pub current: String,
    pub latest: String,
}
