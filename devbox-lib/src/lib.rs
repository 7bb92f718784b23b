//! devbox: one resource-bounded development container per project, with the
//! project's stored files kept in sync with the container workspace.
//!
//! [`WorkspaceService`] is the entry point. It composes the
//! [`ContainerManager`] (lifecycle, quotas, reconciliation passes) and
//! [`WorkspaceSync`] (push/pull between file records and the container).

pub use devbox_common as common;
pub use devbox_runtime as runtime;
pub use devbox_store as store;

pub mod facade;
pub mod lifecycle;
pub mod locks;
pub mod reconcile;
pub mod sync;

pub use facade::{WorkspaceService, WorkspaceServiceBuilder};
pub use lifecycle::{CleanupReport, ContainerManager, Ensured, HealthReport, PassError};
pub use reconcile::Reconciler;
pub use sync::{PullOptions, PullReport, PushReport, SyncError, WorkspaceSync};
