//! The File Cache & Replication Engine's local half (§2): content-addressed
//! storage, metadata, ingest, and eviction. The replication engine itself
//! lives in [`crate::broker::replication`] since it talks to executors.

pub mod eviction;
pub mod ingest;
pub mod registry;
pub mod store;

pub use eviction::EvictionLoop;
pub use ingest::{ChunkOutcome, IngestPipeline, SessionMeta, UploadCommands};
pub use registry::{CacheEntry, MetadataRegistry, RemoteDescriptor, RemoteFileDescriptor, ReplicationStatus};
pub use store::{FileStore, StreamingWrite};
