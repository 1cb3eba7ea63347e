//! Tether plugin runtime kernel.
//!
//! [`Kernel`] composes the subsystem crates into one runtime:
//! - `tether-sandbox`: per-plugin capability sets, quotas and execution
//! - `tether-bus`: inter-plugin messaging and services
//! - `tether-deps`: dependency checks, install order and auto-install
//! - `tether-permissions`: runtime consent grants
//! - `tether-monitor`: usage samples, limits and periodic reports
//! - `tether-package`: signed plugin packages
//!
//! Plugins interact with the kernel only through their [`PluginContext`].
//! Subsystems never call each other directly: sandbox teardown is
//! published on the kernel event bus, and the bus and permission teardown
//! hooks react to it before `destroy` returns.

mod config;
mod context;
mod error;
mod kernel;
mod loader;
pub mod logging;

pub use config::{KernelConfig, PackageConfig};
pub use context::PluginContext;
pub use error::{KernelError, Result};
pub use kernel::{Kernel, KernelBuilder};
pub use loader::ModuleLoader;

pub use tether_bus as bus;
pub use tether_deps as deps;
pub use tether_monitor as monitor;
pub use tether_package as package;
pub use tether_permissions as permissions;
pub use tether_sandbox as sandbox;
pub use tether_types as types;
