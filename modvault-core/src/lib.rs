/*!
# modvault core engine

Lifecycle management for user-installed game content:

- **Packages (mods)**: validated from a zip archive or a directory, tracked
  per file by content hash in an embedded registry, installed into a live
  packages directory and uninstalled into a trash area.
- **Save snapshots**: timestamped zip archives of the live save directory
  that can be restored, renamed and deleted.
- **Soundpacks**: untracked directories copied into the soundpacks root.

## Architecture

The registry store sits behind the [`storage::Repository`] port with a SQLite
adapter. Managers are constructed explicitly from a [`LayoutConfig`] and
shared by the caller; long operations are handed back as a
[`BackgroundTask`] that the caller runs inline or starts on its own thread.

## Usage

```rust,no_run
use modvault_core::{AtomicProgress, LayoutConfig, RegistryManager, SqliteStore, DO_NOTHING};
use std::sync::Arc;

# fn main() -> modvault_core::Result<()> {
let layout = LayoutConfig::under_root("/games/cdda");
let store = Arc::new(SqliteStore::open(&layout.database_path)?);
let registry = Arc::new(RegistryManager::new(store, layout)?);

let progress = Arc::new(AtomicProgress::new());
let handle = registry
    .install_task("/downloads/mutation_rebalance.zip".into(), progress.clone())
    .start()?;
let package = handle.join()?;

registry.uninstall(&package, DO_NOTHING)?;
# Ok(())
# }
```
*/

pub mod archive;
pub mod config;
pub mod error;
pub mod fsops;
pub mod hash;
pub mod model;
pub mod observability;
pub mod progress;
pub mod registry;
pub mod snapshot;
pub mod soundpack;
pub mod storage;
pub mod validator;

#[cfg(test)]
mod error_tests;

pub use config::{LayoutConfig, DEFAULT_MANIFEST_NAME};
pub use error::{Result, VaultError};
pub use fsops::directory_size;
pub use hash::hash_file;
pub use model::{FileRecord, NewFile, NewPackage, Package, PackageRecord};
pub use observability::init_observability;
#[cfg(feature = "metrics")]
pub use observability::VaultMetrics;
pub use progress::{
    AtomicProgress, BackgroundTask, ChannelProgress, NoProgress, ProgressSink, ProgressTracker,
    TaskHandle, TaskState,
};
pub use registry::{diff_files, FileDiff, RegistryManager, UninstallOutcome, DO_NOTHING};
pub use snapshot::{Snapshot, SnapshotManager};
pub use soundpack::{Soundpack, SoundpackManager};
pub use storage::{Disposable, RegistryQueries, Repository, SqliteStore, StoreTransaction};
pub use validator::{PackageValidator, WorkingTree};
