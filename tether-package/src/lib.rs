//! Tether plugin package format.
//!
//! A package is a zip archive containing:
//! - `manifest.toml`: the plugin manifest plus a `[module]` descriptor
//!   (`format`, `entry`)
//! - `module.bin`: pre-compiled module bytes, handed to the host's loader
//! - `README.md`: optional documentation
//! - `signature.bin`: optional Ed25519 signature over the content hash
//!
//! The content hash is SHA-256 over every entry except `signature.bin`.
//! Hosts decide which signing keys they trust; the kernel refuses unsigned
//! or untrusted packages unless configured otherwise.

mod error;
mod manifest;
mod package;
mod signing;

pub use error::{PackageError, Result};
pub use manifest::{ModuleDescriptor, PackageManifest};
pub use package::{
    PackageBuilder, PackageEntry, PluginPackage, MANIFEST_ENTRY, MODULE_ENTRY, README_ENTRY,
    SIGNATURE_ENTRY,
};
pub use signing::{KeyPair, Signature, SigningKey, VerifyingKey};
