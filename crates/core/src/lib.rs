// redmap-core: a named key-value collection shared by many processes
// through a remote store, deleted automatically once no process holds a
// handle to it.

pub mod bookkeeping;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod handle;
pub mod identity;
pub mod lifecycle;
pub mod registry;
pub mod store;

pub use config::MapConfig;
pub use coordinator::{CleanupOutcome, CleanupStats};
pub use error::{ConfigError, MapError, Result};
pub use handle::{Liveness, SharedMap};
pub use identity::HandleId;
pub use lifecycle::Lifecycle;
pub use store::{CollectionStore, MemoryStore, RedisStore};
