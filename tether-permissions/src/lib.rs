//! Permission grants for the Tether plugin kernel.
//!
//! A plugin asks for a `(kind, scope, target)` permission; the request stays
//! PENDING until the host's consent collaborator, which watches
//! `permission:requested` events, calls [`PermissionManager::grant`] or
//! [`PermissionManager::deny`]. Granted permissions can be revoked or run out
//! after an optional deadline. DENIED is terminal.

mod error;
mod manager;
mod teardown;

pub use error::{PermissionError, Result};
pub use manager::{PendingPermission, PermissionManager};
pub use teardown::PermissionTeardownHook;
