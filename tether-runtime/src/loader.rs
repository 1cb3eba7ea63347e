//! Host seam that turns package module bytes into runnable plugin code.

use async_trait::async_trait;
use std::sync::Arc;
use tether_package::ModuleDescriptor;
use tether_sandbox::{ModuleError, PluginModule};
use tether_types::PluginManifest;

/// Instantiates the module shipped in a package.
///
/// Loading plugin code is the kernel's trust boundary: it is only reached
/// for packages that passed signature checks, and every call is logged
/// with the package content hash.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(
        &self,
        plugin: &PluginManifest,
        descriptor: &ModuleDescriptor,
        bytes: &[u8],
    ) -> Result<Arc<dyn PluginModule>, ModuleError>;
}
