//! Operations behind the `tether` binary.
//!
//! Kept in a library so they can be tested without spawning the binary.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tether_deps::{CheckOptions, DependencyReport, DependencyResolver};
use tether_package::{
    KeyPair, PackageBuilder, PackageManifest, PluginPackage, SigningKey, VerifyingKey,
};
use tether_runtime::KernelConfig;
use tether_types::{PluginId, PluginManifest};
use tracing::{debug, info};

/// Reads one plugin manifest, TOML or JSON by extension.
pub fn read_manifest(path: &Path) -> Result<PluginManifest> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let manifest: PluginManifest = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON manifest {}", path.display()))?,
        _ => toml::from_str(&text)
            .with_context(|| format!("Invalid TOML manifest {}", path.display()))?,
    };
    manifest
        .validate()
        .with_context(|| format!("Invalid manifest {}", path.display()))?;
    Ok(manifest)
}

/// Reads every `*.toml` and `*.json` manifest in `dir`, in file name order.
pub fn load_manifests(dir: &Path) -> Result<Vec<PluginManifest>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("toml" | "json")
                )
        })
        .collect();
    paths.sort();

    let manifests = paths
        .iter()
        .map(|p| read_manifest(p))
        .collect::<Result<Vec<_>>>()?;
    debug!(dir = %dir.display(), count = manifests.len(), "Manifests loaded");
    Ok(manifests)
}

/// A resolver holding every manifest.
pub fn resolver_for(manifests: &[PluginManifest]) -> Result<DependencyResolver> {
    let resolver = DependencyResolver::new();
    for manifest in manifests {
        resolver
            .register_plugin(manifest)
            .with_context(|| format!("Failed to register {}", manifest.id))?;
    }
    Ok(resolver)
}

/// Installation order of a manifest set: dependencies first.
pub fn installation_order(manifests: &[PluginManifest]) -> Result<Vec<PluginId>> {
    let resolver = resolver_for(manifests)?;
    let ids: Vec<PluginId> = manifests.iter().map(|m| m.id.clone()).collect();
    Ok(resolver.get_installation_order(&ids))
}

/// Dependency reports for every manifest, or just `only` if given.
pub async fn check_all(
    manifests: &[PluginManifest],
    only: Option<&PluginId>,
    options: &CheckOptions,
) -> Result<Vec<DependencyReport>> {
    let resolver = resolver_for(manifests)?;
    let mut reports = Vec::new();
    for manifest in manifests {
        if only.is_some_and(|id| *id != manifest.id) {
            continue;
        }
        reports.push(resolver.check_dependencies(&manifest.id, options).await?);
    }
    if let Some(id) = only {
        if reports.is_empty() {
            bail!("No manifest for plugin {id}");
        }
    }
    Ok(reports)
}

/// Generates a signing key and writes its hex form to `out`.
/// Refuses to replace an existing file unless `force`.
pub fn keygen(out: &Path, force: bool) -> Result<VerifyingKey> {
    if out.exists() && !force {
        bail!("{} already exists (use --force to replace it)", out.display());
    }
    let keypair = KeyPair::generate();
    fs::write(out, keypair.signing_key.to_hex())
        .with_context(|| format!("Failed to write key file {}", out.display()))?;
    info!(path = %out.display(), "Signing key written");
    Ok(keypair.verifying_key)
}

pub fn read_signing_key(path: &Path) -> Result<SigningKey> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    SigningKey::from_hex(text.trim())
        .with_context(|| format!("Invalid signing key in {}", path.display()))
}

/// Inputs of [`pack`].
#[derive(Debug, Clone)]
pub struct PackRequest {
    /// `manifest.toml` with `[plugin]` and `[module]` tables.
    pub manifest: PathBuf,
    pub module: PathBuf,
    pub readme: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub out: PathBuf,
}

/// Builds a package archive and returns its content hash.
pub fn pack(request: &PackRequest) -> Result<String> {
    let text = fs::read_to_string(&request.manifest)
        .with_context(|| format!("Failed to read {}", request.manifest.display()))?;
    let manifest = PackageManifest::from_toml(&text)
        .with_context(|| format!("Invalid package manifest {}", request.manifest.display()))?;
    let module = fs::read(&request.module)
        .with_context(|| format!("Failed to read module {}", request.module.display()))?;

    let mut builder = PackageBuilder::new(manifest).module(module);
    if let Some(readme) = &request.readme {
        let data =
            fs::read(readme).with_context(|| format!("Failed to read {}", readme.display()))?;
        builder = builder.readme(data);
    }
    if let Some(key) = &request.key {
        builder = builder.sign(&read_signing_key(key)?);
    }

    let bytes = builder.build().context("Failed to build package")?;
    let hash = PluginPackage::from_bytes(&bytes)?.content_hash();
    fs::write(&request.out, &bytes)
        .with_context(|| format!("Failed to write {}", request.out.display()))?;
    info!(path = %request.out.display(), bytes = bytes.len(), %hash, "Package written");
    Ok(hash)
}

/// What `inspect` reports about a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Unsigned,
    /// Signed, but no trusted key was supplied or none matched.
    Unverified,
    Trusted(String),
}

#[derive(Debug, Clone)]
pub struct PackageSummary {
    pub manifest: PackageManifest,
    pub content_hash: String,
    pub module_bytes: usize,
    pub has_readme: bool,
    pub signature: SignatureStatus,
}

/// Opens a package and checks its signature against `trusted`.
/// A signature that verifies against none of them is an error only when
/// keys were supplied.
pub fn inspect(path: &Path, trusted: &[VerifyingKey]) -> Result<PackageSummary> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let package = PluginPackage::from_bytes(&bytes)
        .with_context(|| format!("Invalid package {}", path.display()))?;

    let signature = if !package.is_signed() {
        SignatureStatus::Unsigned
    } else if trusted.is_empty() {
        SignatureStatus::Unverified
    } else {
        let key = package
            .verify_trusted(trusted)
            .context("Package signature is not from a trusted key")?;
        SignatureStatus::Trusted(key.to_hex())
    };

    Ok(PackageSummary {
        content_hash: package.content_hash(),
        module_bytes: package.module.len(),
        has_readme: package.readme.is_some(),
        manifest: package.manifest,
        signature,
    })
}

/// Parses a kernel config file strictly, failing on any error.
pub fn check_config(path: &Path) -> Result<KernelConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = KernelConfig::from_toml_str(&text)?;
    config.packages.verifying_keys()?;
    Ok(config)
}

/// One line per report, for terminal output.
#[must_use]
pub fn render_report(report: &DependencyReport) -> String {
    let id = report
        .plugin_id
        .as_ref()
        .map_or("?", PluginId::as_str);
    if report.success {
        let mut line = format!("ok    {id} ({} satisfied", report.satisfied.len());
        if !report.optional_unsatisfied.is_empty() {
            line.push_str(&format!(
                ", {} optional missing",
                report.optional_unsatisfied.len()
            ));
        }
        line.push(')');
        line
    } else {
        let message = report.error_message.as_deref().unwrap_or("dependency check failed");
        format!("FAIL  {id}: {message}")
    }
}
