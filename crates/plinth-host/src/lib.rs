//! Plinth plugin host.
//!
//! Discovers plugin artifacts in a directory, loads native ones across the
//! C ABI defined by `plinth-abi`, extracts their manifests and UI bundles,
//! merges their routes into one lock-free route table, and dispatches
//! requests into plugin handlers. Script artifacts contribute a UI bundle
//! only and are hot-swapped when their file changes.

pub mod assets;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod native;
pub mod registry;
pub mod routes;
pub mod scanner;
pub mod watcher;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use assets::{BundleSource, UiBundle};
pub use config::HostConfig;
pub use dispatcher::Dispatcher;
pub use error::{DiscoveryError, DispatchError, HostError, LoadError, UnloadError};
pub use events::{HostEvent, UnloadReport};
pub use lifecycle::{LoadState, Retirement};
pub use loader::{DropReason, RouteDiagnostic};
pub use manifest::PluginManifest;
pub use native::{DylibOpener, LibraryOpener, NativeLibrary};
pub use registry::{PluginHost, PluginStatus, RescanReport, RoutesSnapshot};
pub use routes::{RouteCollision, RouteInfo};
pub use scanner::ArtifactKind;
pub use watcher::PluginWatcher;
