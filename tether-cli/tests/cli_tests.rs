use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use tether_cli::{PackRequest, SignatureStatus};
use tether_deps::CheckOptions;
use tether_package::VerifyingKey;
use tether_types::PluginId;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

fn plugin_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a-ui.toml",
        r#"
id = "acme.ui"
name = "UI"
version = "1.0.0"

[[dependencies]]
id = "acme.core"
version_range = "^2.0.0"
"#,
    );
    write(
        dir.path(),
        "b-core.json",
        r#"{ "id": "acme.core", "name": "Core", "version": "2.3.0" }"#,
    );
    write(
        dir.path(),
        "c-sync.toml",
        r#"
id = "acme.sync"
name = "Sync"
version = "0.9.0"

[[dependencies]]
id = "acme.ui"

[[dependencies]]
id = "acme.cloud"
optional = true
"#,
    );
    write(dir.path(), "notes.txt", "ignored");
    dir
}

#[test]
fn order_puts_dependencies_first() {
    let dir = plugin_dir();
    let manifests = tether_cli::load_manifests(dir.path()).unwrap();
    assert_eq!(manifests.len(), 3);

    let order = tether_cli::installation_order(&manifests).unwrap();
    assert_eq!(
        order,
        vec![
            PluginId::new("acme.core"),
            PluginId::new("acme.ui"),
            PluginId::new("acme.sync"),
        ]
    );
}

#[tokio::test]
async fn check_reports_each_plugin() {
    let dir = plugin_dir();
    write(
        dir.path(),
        "d-broken.toml",
        r#"
id = "acme.broken"
name = "Broken"
version = "1.0.0"

[[dependencies]]
id = "acme.core"
version_range = "^3.0.0"
"#,
    );
    let manifests = tether_cli::load_manifests(dir.path()).unwrap();

    let reports = tether_cli::check_all(&manifests, None, &CheckOptions::default())
        .await
        .unwrap();
    let lines: Vec<String> = reports.iter().map(tether_cli::render_report).collect();
    assert_eq!(
        lines,
        vec![
            "ok    acme.ui (1 satisfied)".to_string(),
            "ok    acme.core (0 satisfied)".to_string(),
            "ok    acme.sync (1 satisfied, 1 optional missing)".to_string(),
            "FAIL  acme.broken: plugin 'acme.broken' has unsatisfied dependencies: acme.core"
                .to_string(),
        ]
    );

    let only = PluginId::new("acme.sync");
    let reports = tether_cli::check_all(&manifests, Some(&only), &CheckOptions::default())
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert!(tether_cli::check_all(&manifests, Some(&PluginId::new("acme.nope")), &CheckOptions::default())
        .await
        .is_err());
}

#[test]
fn invalid_manifest_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "bad.toml", "id = \"acme.bad\"\nname = \"\"\nversion = \"1.0.0\"\n");
    let err = tether_cli::load_manifests(dir.path()).unwrap_err();
    assert!(format!("{err:#}").contains("bad.toml"));
}

#[test]
fn keygen_pack_and_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("signing.key");
    let public = tether_cli::keygen(&key_path, false).unwrap();
    assert!(tether_cli::keygen(&key_path, false).is_err());

    write(
        dir.path(),
        "manifest.toml",
        r#"
[plugin]
id = "acme.notes"
name = "Notes"
version = "1.2.0"

[module]
format = "wasm"
entry = "run"
"#,
    );
    fs::write(dir.path().join("plugin.wasm"), b"\0asm").unwrap();

    let out = dir.path().join("notes.tpk");
    let hash = tether_cli::pack(&PackRequest {
        manifest: dir.path().join("manifest.toml"),
        module: dir.path().join("plugin.wasm"),
        readme: None,
        key: Some(key_path),
        out: out.clone(),
    })
    .unwrap();

    let summary = tether_cli::inspect(&out, &[]).unwrap();
    assert_eq!(summary.content_hash, hash);
    assert_eq!(summary.module_bytes, 4);
    assert!(!summary.has_readme);
    assert_eq!(summary.signature, SignatureStatus::Unverified);

    let summary = tether_cli::inspect(&out, &[public]).unwrap();
    assert_eq!(summary.signature, SignatureStatus::Trusted(public.to_hex()));

    let stranger = tether_package::KeyPair::generate().verifying_key;
    assert!(tether_cli::inspect(&out, &[stranger]).is_err());
}

#[test]
fn unsigned_package_reports_unsigned() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "manifest.toml",
        "[plugin]\nid = \"acme.x\"\nname = \"X\"\nversion = \"0.1.0\"\n\n[module]\nformat = \"native\"\nentry = \"main\"\n",
    );
    fs::write(dir.path().join("module.bin"), b"code").unwrap();
    let out = dir.path().join("x.tpk");
    tether_cli::pack(&PackRequest {
        manifest: dir.path().join("manifest.toml"),
        module: dir.path().join("module.bin"),
        readme: None,
        key: None,
        out: out.clone(),
    })
    .unwrap();

    let trusted: Vec<VerifyingKey> = Vec::new();
    assert_eq!(
        tether_cli::inspect(&out, &trusted).unwrap().signature,
        SignatureStatus::Unsigned
    );
}

#[test]
fn config_check_is_strict() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "tether.toml",
        "[sandbox]\nmax_sandboxes = 8\n\n[policy]\nmode = \"denylist\"\n",
    );
    let config = tether_cli::check_config(&dir.path().join("tether.toml")).unwrap();
    assert_eq!(config.sandbox.max_sandboxes, 8);

    write(dir.path(), "bad.toml", "[packages]\ntrusted_keys = [\"zz\"]\n");
    assert!(tether_cli::check_config(&dir.path().join("bad.toml")).is_err());
}
