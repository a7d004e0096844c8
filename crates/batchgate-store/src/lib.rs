//! Single-node collaborators for the batchgate processor.
//!
//! Provides implementations of the collaborator traits that need no
//! external services:
//! - In-memory priority queue
//! - Job repository and status store (in-memory and spool directory)
//! - Broadcast event channel
//! - File stores (local directory and in-memory)

pub mod events;
pub mod files;
pub mod queue;
pub mod repository;
pub mod status;

pub use events::BroadcastEventChannel;
pub use files::{LocalFileStore, MemoryFileStore};
pub use queue::MemoryQueue;
pub use repository::{MemoryJobRepository, SpoolJobRepository};
pub use status::{MemoryStatusStore, SpoolStatusStore};
