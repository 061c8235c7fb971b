//! Shared domain model for the sercha execution plane.
//!
//! Every backend crate (queue, store, credentials, connectors, index,
//! orchestrator) speaks in terms of these types. They are plain data:
//! no I/O, no backend-specific details.

mod document;
mod id;
mod installation;
mod search;
mod source;
mod task;

pub use document::{Change, ChangeKind, Chunk, ContainerInfo, ContainerPage, Document, DocumentInfo};
pub use id::{DocumentId, InstallationId, SourceId, TaskId};
pub use installation::{AuthMethod, Installation, OAuthState, ProviderConfig};
pub use search::{RankedChunk, SearchMode, SearchOptions};
pub use source::{Source, SyncResult, SyncState, SyncStats, SyncStatus};
pub use task::{
	DEFAULT_MAX_ATTEMPTS, DEFAULT_TENANT, ScheduledTask, SyncSourcePayload, TASK_SYNC_ALL,
	TASK_SYNC_SOURCE, Task, TaskFilter, TaskStatus,
};
