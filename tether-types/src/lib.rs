//! Core type definitions for the Tether plugin runtime kernel.
//!
//! This crate defines the plugin-agnostic data model shared by every
//! subsystem of the kernel:
//! - Plugin, sandbox, message and grant identifiers
//! - Millisecond wall-clock timestamps
//! - Capability sets and permission grants
//! - Resource usage samples
//! - Plugin manifests and dependency declarations
//! - The kernel event channel used for all cross-subsystem effects
//! - The host key-value store seam for persisted state
//!
//! Subsystem logic (sandboxing, messaging, dependency resolution,
//! permission decisions) lives in the sibling crates, not here.

mod capability;
mod event;
mod ids;
mod manifest;
mod permission;
mod resource;
pub mod store;
mod timestamp;

pub use capability::{Capability, CapabilityPatch, CapabilitySet};
pub use event::{EventBus, EventReceiver, EventSubscriber, KernelEvent, SubscriberId};
pub use ids::{GrantId, MessageId, PluginId, SandboxId};
pub use manifest::{DependencyKind, DependencySpec, PluginManifest};
pub use permission::{
    DenialReason, GrantStatus, PermissionDefinition, PermissionGrant, PermissionKind,
    PermissionScope, PermissionStatus, WILDCARD_TARGET,
};
pub use resource::{ResourceKind, UsageSample};
pub use store::{KeyValueStore, MemoryStore};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid plugin id: {0:?}")]
    InvalidPluginId(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("store error: {0}")]
    Store(String),
}
