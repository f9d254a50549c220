//! Context stack engine: named tracks of staged files, a virtual folder
//! tree projected over them, background token-stats enrichment and
//! debounced, fingerprinted persistence.

pub mod engine;
pub mod events;
pub mod hydrate;
pub mod index;
pub mod model;
pub mod persist;
pub mod stats;
pub mod store;
pub mod tree;
pub mod watch;
pub mod workspace;

pub use engine::{ContextStackEngine, EngineConfig};
pub use events::{EventHub, Subscription};
pub use model::{FileStats, StagedFile, Track, Uri};
pub use persist::{PersistNotice, StateStorage};
pub use stats::{EnrichedFile, StatsEvent};
pub use store::StoreEvent;
pub use tree::{FolderView, StackItem};
pub use watch::SyncAction;
pub use workspace::{StaticWorkspace, WorkspaceResolver};
