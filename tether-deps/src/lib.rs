//! Dependency resolution for the Tether plugin kernel.
//!
//! Plugins declare REQUIRED, OPTIONAL, RECOMMENDS, ENHANCES and CONFLICTS
//! edges in their manifests. The resolver keeps the registered set as a
//! graph and answers three questions about it:
//! - can this plugin run (direct dependencies, conflicts, cycles)?
//! - in which order should a set of plugins be installed?
//! - what does this plugin transitively pull in, and who depends on it?
//!
//! Missing dependencies can be fetched from a [`PluginMarket`]; installing
//! what was fetched is left to the caller.

mod error;
mod graph;
mod market;
mod report;
mod resolver;
mod version;

pub use error::{DepsError, Result};
pub use graph::{DependencyEdge, DependencyGraph, PluginNode};
pub use market::{FetchedPackage, PluginMarket, UpdateInfo};
pub use report::{
    DependencyConflict, DependencyReport, SatisfiedDependency, UnsatisfiedDependency,
    UnsatisfiedReason,
};
pub use resolver::{CheckOptions, DependencyResolver};
pub use version::{Version, VersionRange};
