use pretty_assertions::assert_eq;
use std::fs::File;
use std::io::Write;
use tether_package::{
    KeyPair, ModuleDescriptor, PackageBuilder, PackageError, PackageManifest, PluginPackage,
    MANIFEST_ENTRY, SIGNATURE_ENTRY,
};
use tether_types::{Capability, PluginManifest};

fn manifest(id: &str) -> PackageManifest {
    PackageManifest::new(
        PluginManifest::new(id, "Sample", "0.3.1").with_capability(Capability::Storage),
        ModuleDescriptor::new("wasm", "run"),
    )
}

#[test]
fn signed_package_round_trips_through_a_file() {
    let keypair = KeyPair::generate();
    let bytes = PackageBuilder::new(manifest("acme.sample"))
        .module(b"\0asm module".to_vec())
        .readme(b"# Sample".to_vec())
        .sign(&keypair.signing_key)
        .build()
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.tpk");
    File::create(&path).unwrap().write_all(&bytes).unwrap();

    let pkg = PluginPackage::open(File::open(&path).unwrap()).unwrap();
    assert_eq!(pkg.manifest, manifest("acme.sample"));
    assert_eq!(pkg.module, b"\0asm module".to_vec());
    assert_eq!(pkg.readme.as_deref(), Some(b"# Sample".as_slice()));
    assert!(pkg.verify(&keypair.verifying_key).is_ok());
    assert_eq!(pkg.content_hash().len(), 64);
}

#[test]
fn trusted_key_lookup() {
    let signer = KeyPair::generate();
    let other = KeyPair::generate();
    let bytes = PackageBuilder::new(manifest("acme.sample"))
        .module(b"m".to_vec())
        .sign(&signer.signing_key)
        .build()
        .unwrap();
    let pkg = PluginPackage::from_bytes(&bytes).unwrap();

    let trusted = [other.verifying_key, signer.verifying_key];
    assert_eq!(pkg.verify_trusted(&trusted).unwrap(), &signer.verifying_key);
    assert!(matches!(
        pkg.verify_trusted(&[other.verifying_key]),
        Err(PackageError::Untrusted)
    ));
}

#[test]
fn unsigned_package_reports_not_signed() {
    let bytes = PackageBuilder::new(manifest("acme.sample"))
        .module(b"m".to_vec())
        .build()
        .unwrap();
    let pkg = PluginPackage::from_bytes(&bytes).unwrap();
    let key = KeyPair::generate().verifying_key;

    assert!(matches!(pkg.verify(&key), Err(PackageError::NotSigned)));
    assert!(matches!(pkg.verify_trusted(&[key]), Err(PackageError::NotSigned)));
}

#[test]
fn tampered_module_fails_verification() {
    let keypair = KeyPair::generate();
    let bytes = PackageBuilder::new(manifest("acme.sample"))
        .module(b"original".to_vec())
        .sign(&keypair.signing_key)
        .build()
        .unwrap();
    let signed = PluginPackage::from_bytes(&bytes).unwrap();

    // Re-pack the same signature next to a different module.
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for entry in signed.entries() {
        zip.start_file(entry.name.as_str(), options).unwrap();
        let data = if entry.name == "module.bin" { b"evil".to_vec() } else { entry.data.clone() };
        zip.write_all(&data).unwrap();
    }
    let tampered = zip.finish().unwrap().into_inner();

    let pkg = PluginPackage::from_bytes(&tampered).unwrap();
    assert!(pkg.entries().iter().any(|e| e.name == SIGNATURE_ENTRY));
    assert!(matches!(
        pkg.verify(&keypair.verifying_key),
        Err(PackageError::SignatureInvalid)
    ));
}

#[test]
fn archive_without_manifest_is_rejected() {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    zip.start_file("module.bin", zip::write::SimpleFileOptions::default()).unwrap();
    zip.write_all(b"m").unwrap();
    let bytes = zip.finish().unwrap().into_inner();

    match PluginPackage::from_bytes(&bytes) {
        Err(PackageError::MissingEntry(name)) => assert_eq!(name, MANIFEST_ENTRY),
        other => panic!("expected missing manifest, got {other:?}"),
    }
}

#[test]
fn invalid_manifest_id_is_rejected_at_build() {
    let bad = PackageManifest::new(
        PluginManifest::new("has spaces", "Bad", "1.0.0"),
        ModuleDescriptor::new("wasm", "run"),
    );
    assert!(matches!(
        PackageBuilder::new(bad).module(b"m".to_vec()).build(),
        Err(PackageError::ManifestInvalid(_))
    ));
}
