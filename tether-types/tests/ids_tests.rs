use std::collections::HashSet;
use std::str::FromStr;
use tether_types::{GrantId, MessageId, PluginId, SandboxId};

// ── PluginId ──────────────────────────────────────────────────────

#[test]
fn plugin_id_display_and_parse() {
    let id = PluginId::parse("acme.notes").unwrap();
    assert_eq!(id.to_string(), "acme.notes");
    assert_eq!(id.as_str(), "acme.notes");
}

#[test]
fn plugin_id_from_str_validates() {
    assert!(PluginId::from_str("acme.notes").is_ok());
    assert!(PluginId::from_str("").is_err());
    assert!(PluginId::from_str("has space").is_err());
    assert!(PluginId::from_str("has:colon").is_err());
}

#[test]
fn plugin_id_serde_is_transparent() {
    let id = PluginId::new("acme.notes");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"acme.notes\"");
    let back: PluginId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn plugin_id_borrows_as_str_for_lookups() {
    let mut set = HashSet::new();
    set.insert(PluginId::new("a"));
    assert!(set.contains("a"));
}

// ── SandboxId / GrantId ───────────────────────────────────────────

#[test]
fn sandbox_id_new_is_unique() {
    assert_ne!(SandboxId::new(), SandboxId::new());
}

#[test]
fn sandbox_id_display_and_parse() {
    let id = SandboxId::new();
    let parsed = SandboxId::parse(&id.to_string()).unwrap();
    assert_eq!(id, parsed);
    assert!(SandboxId::parse("not-a-uuid").is_err());
}

#[test]
fn grant_id_roundtrip() {
    let id = GrantId::new();
    let parsed: GrantId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
}

// ── MessageId ─────────────────────────────────────────────────────

#[test]
fn message_ids_are_unique_per_sender() {
    let sender = PluginId::new("acme.chat");
    let a = MessageId::for_sender(&sender);
    let b = MessageId::for_sender(&sender);
    assert_ne!(a, b);
    assert_eq!(a.namespace(), b.namespace());
}

#[test]
fn message_id_namespace_does_not_match_prefix_plugins() {
    let id = MessageId::for_sender(&PluginId::new("acme.chat"));
    assert!(!id.is_namespaced_under(&PluginId::new("acme")));
    assert!(id.as_str().starts_with("acme.chat:"));
}
