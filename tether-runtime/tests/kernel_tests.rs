use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_bus::{BusError, Responder};
use tether_deps::{DepsError, PluginMarket};
use tether_package::{KeyPair, ModuleDescriptor, PackageBuilder, PackageError, PackageManifest};
use tether_permissions::PermissionError;
use tether_runtime::{Kernel, KernelConfig, KernelError, ModuleLoader, PackageConfig};
use tether_sandbox::{ModuleError, PluginModule, PolicyMode, SandboxError, SandboxScope};
use tether_types::store::keys;
use tether_types::{
    Capability, CapabilityPatch, DenialReason, DependencySpec, KernelEvent, KeyValueStore,
    MemoryStore, PermissionDefinition, PermissionKind, PermissionScope, PluginId, PluginManifest,
};

// ================================================================
// Fixtures
// ================================================================

fn id(s: &str) -> PluginId {
    PluginId::new(s)
}

fn messaging_plugin(name: &str) -> PluginManifest {
    PluginManifest::new(name, name, "1.0.0").with_capability(Capability::Messaging)
}

fn no_patch() -> CapabilityPatch {
    CapabilityPatch::default()
}

/// Echoes its context back, or stores it under `last`.
struct EchoModule;

#[async_trait]
impl PluginModule for EchoModule {
    async fn invoke(&self, entry: &str, scope: SandboxScope, context: Value) -> Result<Value, ModuleError> {
        match entry {
            "echo" => Ok(context),
            "remember" => {
                scope.storage().set("last", context.clone())?;
                Ok(json!({ "stored": context }))
            }
            other => Err(ModuleError(format!("unknown entry '{other}'"))),
        }
    }
}

/// Accepts any module bytes and records what it was asked to load.
#[derive(Default)]
struct RecordingLoader {
    loaded: Mutex<Vec<(PluginId, String, Vec<u8>)>>,
}

#[async_trait]
impl ModuleLoader for RecordingLoader {
    async fn load(
        &self,
        plugin: &PluginManifest,
        descriptor: &ModuleDescriptor,
        bytes: &[u8],
    ) -> Result<Arc<dyn PluginModule>, ModuleError> {
        self.loaded
            .lock()
            .unwrap()
            .push((plugin.id.clone(), descriptor.entry.clone(), bytes.to_vec()));
        Ok(Arc::new(EchoModule))
    }
}

#[derive(Default)]
struct FakeMarket {
    catalogue: HashMap<PluginId, (PluginManifest, Vec<u8>)>,
}

impl FakeMarket {
    fn publish(mut self, manifest: PluginManifest, bytes: Vec<u8>) -> Self {
        self.catalogue.insert(manifest.id.clone(), (manifest, bytes));
        self
    }
}

#[async_trait]
impl PluginMarket for FakeMarket {
    async fn get_details(&self, id: &PluginId) -> tether_deps::Result<Option<PluginManifest>> {
        Ok(self.catalogue.get(id).map(|(m, _)| m.clone()))
    }

    async fn get_package(&self, id: &PluginId, _version: &str) -> tether_deps::Result<Vec<u8>> {
        self.catalogue
            .get(id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| DepsError::Market(format!("no package for {id}")))
    }
}

fn package(manifest: PluginManifest, keys: Option<&KeyPair>) -> Vec<u8> {
    let mut builder = PackageBuilder::new(PackageManifest::new(
        manifest,
        ModuleDescriptor::new("native", "main"),
    ))
    .module(b"module-bytes".to_vec());
    if let Some(keys) = keys {
        builder = builder.sign(&keys.signing_key);
    }
    builder.build().unwrap()
}

fn trusting(keys: &KeyPair) -> KernelConfig {
    KernelConfig {
        packages: PackageConfig {
            trusted_keys: vec![keys.verifying_key.to_hex()],
            allow_unsigned: false,
        },
        ..KernelConfig::default()
    }
}

// ================================================================
// Registration
// ================================================================

#[tokio::test]
async fn prerelease_plugin_versions_register() {
    let kernel = Kernel::builder().build().unwrap();
    for (name, version) in [("acme.beta", "1.0.0-beta.1"), ("acme.build", "1.2.0+build5")] {
        kernel
            .register_plugin(PluginManifest::new(name, name, version), &no_patch())
            .await
            .unwrap();
    }
    assert_eq!(
        kernel.resolver().installed_version(&id("acme.beta")).map(|v| v.to_string()),
        Some("1.0.0-beta.1".to_string())
    );
    assert!(kernel.is_registered(&id("acme.build")));
}

#[tokio::test]
async fn register_persists_and_announces() {
    let store = Arc::new(MemoryStore::new());
    let kernel = Kernel::builder()
        .store(store.clone() as Arc<dyn KeyValueStore>)
        .build()
        .unwrap();
    let mut rx = kernel.events().subscribe();

    let ctx = kernel
        .register_plugin(messaging_plugin("acme.notes"), &no_patch())
        .await
        .unwrap();

    assert_eq!(ctx.plugin_id(), &id("acme.notes"));
    assert!(ctx.is_active());
    assert!(kernel.bus().is_registered(&id("acme.notes")));
    assert_eq!(kernel.plugins(), vec![id("acme.notes")]);
    assert_eq!(
        kernel.installed_manifests().unwrap(),
        vec![messaging_plugin("acme.notes")]
    );
    let types: Vec<&str> = rx.drain().iter().map(|e| e.event_type()).collect();
    assert_eq!(types, vec!["sandbox:created", "plugin:registered"]);

    let err = kernel
        .register_plugin(messaging_plugin("acme.notes"), &no_patch())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::AlreadyRegistered(_)));
}

#[tokio::test]
async fn invalid_manifest_is_rejected_before_anything_is_created() {
    let kernel = Kernel::builder().build().unwrap();
    let err = kernel
        .register_plugin(PluginManifest::new("acme.bad", "", "1.0.0"), &no_patch())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KernelError::Sandbox(SandboxError::InvalidManifest(_))
    ));
    assert!(kernel.sandboxes().is_empty());
}

#[tokio::test]
async fn unsatisfied_dependency_rolls_back_registration() {
    let kernel = Kernel::builder().build().unwrap();
    let app = messaging_plugin("acme.app")
        .with_dependency(DependencySpec::required("acme.core", Some("^1.0.0")));

    let err = kernel.register_plugin(app.clone(), &no_patch()).await.unwrap_err();
    assert_eq!(err.to_string(), "plugin 'acme.app' has unsatisfied dependencies: acme.core");
    assert!(!kernel.is_registered(&id("acme.app")));
    assert!(!kernel.resolver().is_registered(&id("acme.app")));
    assert!(kernel.sandboxes().is_empty());
    assert!(!kernel.bus().is_registered(&id("acme.app")));

    kernel
        .register_plugin(PluginManifest::new("acme.core", "Core", "1.4.0"), &no_patch())
        .await
        .unwrap();
    kernel.register_plugin(app, &no_patch()).await.unwrap();
    assert_eq!(
        kernel.installation_order(&[id("acme.app"), id("acme.core")]),
        vec![id("acme.core"), id("acme.app")]
    );
}

#[tokio::test]
async fn policy_denial_leaves_no_trace() {
    let mut config = KernelConfig::default();
    config.policy.mode = PolicyMode::Denylist;
    config.policy.plugins.deny.push("acme.blocked".into());
    let kernel = Kernel::builder().config(config).build().unwrap();

    let err = kernel
        .register_plugin(messaging_plugin("acme.blocked"), &no_patch())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Sandbox(SandboxError::PolicyDenied(_))));
    assert!(!kernel.resolver().is_registered(&id("acme.blocked")));
    assert!(kernel.installed_manifests().unwrap().is_empty());
}

// ================================================================
// Teardown cascade
// ================================================================

#[tokio::test(start_paused = true)]
async fn unload_cancels_pending_requests_and_permissions() {
    let kernel = Kernel::builder().build().unwrap();
    let x = kernel
        .register_plugin(messaging_plugin("acme.x"), &no_patch())
        .await
        .unwrap();
    let y = kernel
        .register_plugin(messaging_plugin("acme.y"), &no_patch())
        .await
        .unwrap();

    // X holds requests without answering them.
    let held: Arc<Mutex<Vec<Responder>>> = Arc::default();
    let sink = Arc::clone(&held);
    x.on_channel("jobs", move |_envelope, responder| {
        sink.lock().unwrap().push(responder);
        Ok(())
    })
    .unwrap();

    let caller = y.clone();
    let request = tokio::spawn(async move {
        caller
            .request(&id("acme.x"), "jobs", "run", json!({}), None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(kernel.bus().pending_count(), 1);

    let permission = x
        .begin_permission_request(
            PermissionDefinition::new(PermissionKind::Clipboard, PermissionScope::Read),
            None,
        )
        .unwrap();
    assert!(!permission.is_settled());

    assert!(kernel.unload_plugin(&id("acme.x")).unwrap());

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, KernelError::Bus(BusError::PluginUnregistered(_))));
    assert!(err.is_unregistered());
    assert!(matches!(
        permission.wait().await,
        Err(PermissionError::Denied { reason: DenialReason::Cancelled, .. })
    ));

    // Later traffic to X fails the same way, and X's own context is dead.
    let err = y.notify(&id("acme.x"), "jobs", "run", json!({})).await.unwrap_err();
    assert!(matches!(err, KernelError::Bus(BusError::PluginUnregistered(_))));
    assert!(!x.is_active());
    assert!(x.broadcast("jobs", "ping", Value::Null).await.unwrap_err().is_unregistered());
    assert!(!kernel.unload_plugin(&id("acme.x")).unwrap());
}

#[tokio::test]
async fn unload_announces_and_keeps_persisted_data() {
    let kernel = Kernel::builder().build().unwrap();
    let ctx = kernel
        .register_plugin(messaging_plugin("acme.notes"), &no_patch())
        .await
        .unwrap();
    ctx.set_config(json!({ "theme": "dark" })).unwrap();
    let mut rx = kernel.events().subscribe();

    kernel.unload_plugin(&id("acme.notes")).unwrap();

    let events = rx.drain();
    assert!(matches!(*events[0], KernelEvent::SandboxDestroyed { .. }));
    assert_eq!(
        events.last().map(|e| e.event_type()),
        Some("plugin:unregistered")
    );
    assert_eq!(
        kernel.plugin_config(&id("acme.notes")).unwrap(),
        Some(json!({ "theme": "dark" }))
    );
    assert_eq!(kernel.installed_manifests().unwrap().len(), 1);
    assert!(ctx.set_config(json!({})).is_err());
}

#[tokio::test]
async fn uninstall_purges_everything_persisted() {
    let store = Arc::new(MemoryStore::new());
    let kernel = Kernel::builder()
        .store(store.clone() as Arc<dyn KeyValueStore>)
        .build()
        .unwrap();
    let manifest = messaging_plugin("acme.notes").with_capability(Capability::Storage);
    let ctx = kernel
        .register_plugin_with_module(manifest, &no_patch(), Arc::new(EchoModule))
        .await
        .unwrap();
    ctx.set_config(json!({ "theme": "dark" })).unwrap();
    let result = ctx.execute("remember", json!("hello")).await.unwrap();
    assert!(result.success);
    let pending = ctx
        .begin_permission_request(
            PermissionDefinition::new(PermissionKind::Notifications, PermissionScope::Write),
            None,
        )
        .unwrap();
    kernel.permissions().grant(pending.grant_id(), None).unwrap();
    assert!(store.get(&keys::permissions(&id("acme.notes"))).unwrap().is_some());

    assert!(kernel.uninstall_plugin(&id("acme.notes")).unwrap());

    assert!(store
        .keys_with_prefix(&keys::plugin_prefix(&id("acme.notes")))
        .unwrap()
        .is_empty());
    assert!(kernel.installed_manifests().unwrap().is_empty());
    assert!(kernel.permissions().grants_for(&id("acme.notes")).is_empty());
    assert!(!kernel.uninstall_plugin(&id("acme.notes")).unwrap());
}

#[tokio::test]
async fn uninstall_forgets_the_bus_endpoint() {
    let kernel = Kernel::builder().build().unwrap();
    let sender = kernel
        .register_plugin(messaging_plugin("acme.sender"), &no_patch())
        .await
        .unwrap();
    kernel
        .register_plugin(messaging_plugin("acme.notes"), &no_patch())
        .await
        .unwrap();

    kernel.unload_plugin(&id("acme.notes")).unwrap();
    let err = sender
        .notify(&id("acme.notes"), "jobs", "run", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Bus(BusError::PluginUnregistered(_))));

    kernel.uninstall_plugin(&id("acme.notes")).unwrap();
    let err = sender
        .notify(&id("acme.notes"), "jobs", "run", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Bus(BusError::NotRegistered(_))));
}

// ================================================================
// Capabilities, quotas and config
// ================================================================

#[tokio::test]
async fn messaging_requires_the_capability() {
    let kernel = Kernel::builder().build().unwrap();
    let quiet = kernel
        .register_plugin(PluginManifest::new("acme.quiet", "Quiet", "1.0.0"), &no_patch())
        .await
        .unwrap();

    let err = quiet.broadcast("news", "hello", Value::Null).await.unwrap_err();
    assert!(matches!(
        err,
        KernelError::Sandbox(SandboxError::CapabilityDenied { ref capability, .. })
            if capability == "messaging"
    ));

    // A host request can narrow the declared capability away.
    let narrowed = kernel
        .register_plugin(
            messaging_plugin("acme.narrow"),
            &CapabilityPatch {
                messaging: Some(false),
                ..CapabilityPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(!narrowed.capabilities().unwrap().messaging);
    assert!(narrowed.on_channel("news", |_, _| Ok(())).is_err());
}

#[tokio::test]
async fn broadcast_reaches_plugins_with_a_handler() {
    let kernel = Kernel::builder().build().unwrap();
    let sender = kernel
        .register_plugin(messaging_plugin("acme.a"), &no_patch())
        .await
        .unwrap();
    let listener = kernel
        .register_plugin(messaging_plugin("acme.b"), &no_patch())
        .await
        .unwrap();
    kernel
        .register_plugin(messaging_plugin("acme.c"), &no_patch())
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = Arc::clone(&seen);
    listener
        .on_channel("news", move |envelope, _| {
            sink.lock().unwrap().push(envelope.into_payload().unwrap_or(Value::Null));
            Ok(())
        })
        .unwrap();

    let recipients = sender.broadcast("news", "posted", json!({ "n": 1 })).await.unwrap();
    assert_eq!(recipients, vec![id("acme.b")]);
    assert_eq!(*seen.lock().unwrap(), vec![json!({ "n": 1 })]);
}

#[tokio::test]
async fn storage_quota_is_enforced_through_the_context() {
    let kernel = Kernel::builder().build().unwrap();
    let manifest = PluginManifest::new("acme.cache", "Cache", "1.0.0")
        .with_capability(Capability::Storage);
    let ctx = kernel
        .register_plugin(
            manifest,
            &CapabilityPatch {
                storage_quota_bytes: Some(32),
                ..CapabilityPatch::default()
            },
        )
        .await
        .unwrap();

    let scope = ctx.scope().unwrap();
    scope.storage().set("a", json!("small")).unwrap();
    let err = scope.storage().set("b", json!("x".repeat(64))).unwrap_err();
    assert!(matches!(err, SandboxError::QuotaExceeded { .. }));
    assert_eq!(scope.storage().keys().unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn config_round_trips_through_the_store() {
    let kernel = Kernel::builder().build().unwrap();
    let mut manifest = messaging_plugin("acme.notes");
    manifest.config_schema = Some(json!({ "theme": { "type": "string" } }));
    let ctx = kernel.register_plugin(manifest, &no_patch()).await.unwrap();

    assert_eq!(ctx.config().unwrap(), None);
    ctx.set_config(json!({ "theme": "dark" })).unwrap();
    assert_eq!(ctx.config().unwrap(), Some(json!({ "theme": "dark" })));
    assert_eq!(ctx.config_schema(), Some(&json!({ "theme": { "type": "string" } })));

    let again = kernel.context(&id("acme.notes")).unwrap();
    assert_eq!(again.config().unwrap(), Some(json!({ "theme": "dark" })));
    assert!(matches!(
        kernel.context(&id("acme.missing")),
        Err(KernelError::NotRegistered(_))
    ));
}

// ================================================================
// Packages
// ================================================================

#[tokio::test]
async fn trusted_package_installs_and_runs() {
    let keys = KeyPair::generate();
    let loader = Arc::new(RecordingLoader::default());
    let kernel = Kernel::builder()
        .config(trusting(&keys))
        .loader(loader.clone() as Arc<dyn ModuleLoader>)
        .build()
        .unwrap();

    let bytes = package(messaging_plugin("acme.signed"), Some(&keys));
    let ctx = kernel.install_package(&bytes, &no_patch()).await.unwrap();

    assert_eq!(ctx.plugin_id(), &id("acme.signed"));
    assert_eq!(
        *loader.loaded.lock().unwrap(),
        vec![(id("acme.signed"), "main".to_string(), b"module-bytes".to_vec())]
    );
    let result = ctx.execute("echo", json!({ "ping": true })).await.unwrap();
    assert_eq!(result.result, Some(json!({ "ping": true })));
}

#[tokio::test]
async fn unsigned_or_untrusted_packages_are_refused() {
    let trusted = KeyPair::generate();
    let stranger = KeyPair::generate();
    let loader = Arc::new(RecordingLoader::default());
    let kernel = Kernel::builder()
        .config(trusting(&trusted))
        .loader(loader.clone() as Arc<dyn ModuleLoader>)
        .build()
        .unwrap();

    let err = kernel
        .install_package(&package(messaging_plugin("acme.u"), None), &no_patch())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Package(PackageError::NotSigned)));

    let err = kernel
        .install_package(&package(messaging_plugin("acme.u"), Some(&stranger)), &no_patch())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Package(PackageError::Untrusted)));

    assert!(loader.loaded.lock().unwrap().is_empty());
    assert!(kernel.plugins().is_empty());
}

#[tokio::test]
async fn allow_unsigned_accepts_unsigned_packages() {
    let config = KernelConfig {
        packages: PackageConfig {
            trusted_keys: Vec::new(),
            allow_unsigned: true,
        },
        ..KernelConfig::default()
    };
    let kernel = Kernel::builder()
        .config(config)
        .loader(Arc::new(RecordingLoader::default()))
        .build()
        .unwrap();

    kernel
        .install_package(&package(messaging_plugin("acme.dev"), None), &no_patch())
        .await
        .unwrap();
    assert!(kernel.is_registered(&id("acme.dev")));
}

#[tokio::test]
async fn packages_need_a_loader() {
    let keys = KeyPair::generate();
    let kernel = Kernel::builder().config(trusting(&keys)).build().unwrap();
    let err = kernel
        .install_package(&package(messaging_plugin("acme.x"), Some(&keys)), &no_patch())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Loader(_)));
}

#[test]
fn malformed_trusted_key_fails_build() {
    let config = KernelConfig {
        packages: PackageConfig {
            trusted_keys: vec!["not-hex".into()],
            allow_unsigned: false,
        },
        ..KernelConfig::default()
    };
    assert!(matches!(
        Kernel::builder().config(config).build(),
        Err(KernelError::Config(_))
    ));
}

// ================================================================
// Auto-install
// ================================================================

#[tokio::test]
async fn auto_install_installs_fetched_packages_first() {
    let keys = KeyPair::generate();
    let core = PluginManifest::new("acme.core", "Core", "1.2.0");
    let market = FakeMarket::default().publish(core.clone(), package(core, Some(&keys)));
    let loader = Arc::new(RecordingLoader::default());

    let mut config = trusting(&keys);
    config.dependencies.auto_install = true;
    let kernel = Kernel::builder()
        .config(config)
        .market(Arc::new(market))
        .loader(loader.clone() as Arc<dyn ModuleLoader>)
        .build()
        .unwrap();
    let mut rx = kernel.events().subscribe();

    let app = messaging_plugin("acme.app")
        .with_dependency(DependencySpec::required("acme.core", Some("^1.0.0")));
    kernel.register_plugin(app, &no_patch()).await.unwrap();

    assert_eq!(kernel.plugins(), vec![id("acme.app"), id("acme.core")]);
    assert_eq!(loader.loaded.lock().unwrap().len(), 1);
    let registered: Vec<PluginId> = rx
        .drain()
        .iter()
        .filter_map(|e| match &**e {
            KernelEvent::PluginRegistered { plugin_id, .. } => Some(plugin_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(registered, vec![id("acme.core"), id("acme.app")]);
}

#[tokio::test]
async fn auto_install_without_loader_registers_the_manifest() {
    let core = PluginManifest::new("acme.core", "Core", "2.0.0");
    let market = FakeMarket::default().publish(core, b"opaque".to_vec());
    let mut config = KernelConfig::default();
    config.dependencies.auto_install = true;
    let kernel = Kernel::builder()
        .config(config)
        .market(Arc::new(market))
        .build()
        .unwrap();

    let app = messaging_plugin("acme.app")
        .with_dependency(DependencySpec::required("acme.core", Some("^1.0.0 || ^2.0.0")));
    let err = kernel.register_plugin(app, &no_patch()).await.unwrap_err();
    // The range syntax is outside the supported subset, so nothing is fetched.
    assert!(matches!(err, KernelError::Deps(DepsError::Unsatisfied { .. })));

    let app = messaging_plugin("acme.app2")
        .with_dependency(DependencySpec::required("acme.core", Some("^2.0.0")));
    kernel.register_plugin(app, &no_patch()).await.unwrap();
    assert!(kernel.is_registered(&id("acme.core")));
    assert!(kernel.sandboxes().sandbox_for(&id("acme.core")).is_some());
}

// ================================================================
// Shutdown
// ================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_stops_reporter_and_unloads_all() {
    let kernel = Kernel::builder().build().unwrap();
    kernel
        .register_plugin(messaging_plugin("acme.a"), &no_patch())
        .await
        .unwrap();
    kernel
        .register_plugin(messaging_plugin("acme.b"), &no_patch())
        .await
        .unwrap();
    kernel.start_reporter();
    kernel.start_reporter();

    kernel.shutdown().await;

    assert!(kernel.plugins().is_empty());
    assert!(kernel.sandboxes().is_empty());
    assert!(kernel.bus().endpoints().is_empty());
    assert_eq!(kernel.installed_manifests().unwrap().len(), 2);
}

#[test]
fn http_transport_switch_builds_a_client() {
    let mut config = KernelConfig::default();
    config.sandbox.http_transport = true;
    let kernel = Kernel::builder().config(config).build().unwrap();
    assert!(kernel.config().sandbox.http_transport);
}
