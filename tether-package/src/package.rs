//! Packing, unpacking and content hashing.

use std::io::{Cursor, Read, Seek, Write};

use sha2::{Digest, Sha256};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::manifest::PackageManifest;
use crate::signing::{Signature, SigningKey, VerifyingKey};
use crate::{PackageError, Result};

pub const MANIFEST_ENTRY: &str = "manifest.toml";
pub const MODULE_ENTRY: &str = "module.bin";
pub const README_ENTRY: &str = "README.md";
pub const SIGNATURE_ENTRY: &str = "signature.bin";

/// A single file inside a package archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// SHA-256 over every entry except the signature, sorted by name. Each
/// entry contributes its name, its length as little-endian u64, then its
/// bytes.
fn content_hash_of<'a>(entries: impl IntoIterator<Item = &'a PackageEntry>) -> String {
    let mut sorted: Vec<&PackageEntry> = entries
        .into_iter()
        .filter(|e| e.name != SIGNATURE_ENTRY)
        .collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for entry in sorted {
        hasher.update(entry.name.as_bytes());
        hasher.update((entry.data.len() as u64).to_le_bytes());
        hasher.update(&entry.data);
    }
    hex::encode(hasher.finalize())
}

/// An opened plugin package.
#[derive(Debug, Clone)]
pub struct PluginPackage {
    pub manifest: PackageManifest,
    pub module: Vec<u8>,
    pub readme: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
    entries: Vec<PackageEntry>,
}

impl PluginPackage {
    pub fn open<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            entries.push(PackageEntry {
                name: file.name().to_string(),
                data,
            });
        }

        let find = |name: &str| entries.iter().find(|e| e.name == name).map(|e| e.data.clone());
        let manifest_bytes =
            find(MANIFEST_ENTRY).ok_or_else(|| PackageError::MissingEntry(MANIFEST_ENTRY.into()))?;
        let module = find(MODULE_ENTRY).ok_or_else(|| PackageError::MissingEntry(MODULE_ENTRY.into()))?;
        let readme = find(README_ENTRY);
        let signature = find(SIGNATURE_ENTRY);

        let manifest_text = std::str::from_utf8(&manifest_bytes)
            .map_err(|e| PackageError::ManifestInvalid(e.to_string()))?;
        let manifest = PackageManifest::from_toml(manifest_text)?;

        Ok(Self {
            manifest,
            module,
            readme,
            signature,
            entries,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::open(Cursor::new(bytes))
    }

    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    #[must_use]
    pub fn content_hash(&self) -> String {
        content_hash_of(&self.entries)
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Verifies the signature against one key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let raw = self.signature.as_deref().ok_or(PackageError::NotSigned)?;
        let signature = Signature::from_slice(raw)?;
        key.verify(self.content_hash().as_bytes(), &signature)
    }

    /// Verifies against a set of trusted keys and returns the one that
    /// signed the package.
    pub fn verify_trusted<'k>(&self, trusted: &'k [VerifyingKey]) -> Result<&'k VerifyingKey> {
        if !self.is_signed() {
            return Err(PackageError::NotSigned);
        }
        trusted
            .iter()
            .find(|key| self.verify(key).is_ok())
            .ok_or(PackageError::Untrusted)
    }
}

/// Builder for package archives.
pub struct PackageBuilder {
    manifest: PackageManifest,
    module: Option<Vec<u8>>,
    readme: Option<Vec<u8>>,
    signing_key: Option<SigningKey>,
}

impl PackageBuilder {
    #[must_use]
    pub fn new(manifest: PackageManifest) -> Self {
        Self {
            manifest,
            module: None,
            readme: None,
            signing_key: None,
        }
    }

    #[must_use]
    pub fn module(mut self, data: Vec<u8>) -> Self {
        self.module = Some(data);
        self
    }

    #[must_use]
    pub fn readme(mut self, data: Vec<u8>) -> Self {
        self.readme = Some(data);
        self
    }

    #[must_use]
    pub fn sign(mut self, key: &SigningKey) -> Self {
        self.signing_key = Some(key.clone());
        self
    }

    /// Builds the zip archive and returns its bytes.
    pub fn build(self) -> Result<Vec<u8>> {
        self.manifest.validate()?;
        let module = self
            .module
            .ok_or_else(|| PackageError::MissingEntry(MODULE_ENTRY.into()))?;

        let mut entries = vec![
            PackageEntry {
                name: MANIFEST_ENTRY.into(),
                data: self.manifest.to_toml()?.into_bytes(),
            },
            PackageEntry {
                name: MODULE_ENTRY.into(),
                data: module,
            },
        ];
        if let Some(readme) = self.readme {
            entries.push(PackageEntry {
                name: README_ENTRY.into(),
                data: readme,
            });
        }

        if let Some(key) = &self.signing_key {
            let hash = content_hash_of(&entries);
            debug!(plugin_id = %self.manifest.plugin.id, %hash, "Signing package");
            entries.push(PackageEntry {
                name: SIGNATURE_ENTRY.into(),
                data: key.sign(hash.as_bytes()).to_bytes().to_vec(),
            });
        }

        write_archive(&entries)
    }
}

fn write_archive(entries: &[PackageEntry]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for entry in entries {
        zip.start_file(entry.name.as_str(), options)?;
        zip.write_all(&entry.data)?;
    }
    Ok(zip.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyPair, ModuleDescriptor};
    use tether_types::PluginManifest;

    fn manifest() -> PackageManifest {
        PackageManifest::new(
            PluginManifest::new("acme.test", "Test", "1.0.0"),
            ModuleDescriptor::new("wasm", "main"),
        )
    }

    #[test]
    fn module_is_required() {
        assert!(matches!(
            PackageBuilder::new(manifest()).build(),
            Err(PackageError::MissingEntry(name)) if name == MODULE_ENTRY
        ));
    }

    #[test]
    fn content_hash_excludes_signature() {
        let unsigned = PackageBuilder::new(manifest())
            .module(b"module".to_vec())
            .build()
            .unwrap();

        let kp = KeyPair::generate();
        let signed = PackageBuilder::new(manifest())
            .module(b"module".to_vec())
            .sign(&kp.signing_key)
            .build()
            .unwrap();

        let p1 = PluginPackage::from_bytes(&unsigned).unwrap();
        let p2 = PluginPackage::from_bytes(&signed).unwrap();
        assert_eq!(p1.content_hash(), p2.content_hash());
        assert!(!p1.is_signed());
        assert!(p2.is_signed());
    }

    #[test]
    fn hash_depends_on_module_bytes() {
        let a = PackageBuilder::new(manifest()).module(b"a".to_vec()).build().unwrap();
        let b = PackageBuilder::new(manifest()).module(b"b".to_vec()).build().unwrap();
        assert_ne!(
            PluginPackage::from_bytes(&a).unwrap().content_hash(),
            PluginPackage::from_bytes(&b).unwrap().content_hash()
        );
    }
}
