//! ModelPool Coordinator
//!
//! Keeps a small pool of per-user model workers resident inside a fixed
//! accelerator memory arena and streams chat replies from them.

pub mod allocator;
pub mod dispatch;
pub mod locator;
pub mod process;
pub mod protocol;
pub mod session;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use allocator::{Allocator, AllocatorStats, EvictionListener, MemoryAllocation, MemoryFragment, Priority};
pub use locator::{DirectoryLocator, ModelLocator, StaticLocator};
pub use process::{CommandLauncher, KillHandle, LaunchSpec, WorkerLauncher, WorkerProcess};
pub use protocol::{ChunkCallback, ProtocolDriver, RequestState, StreamingChunk};
pub use session::{ChatMessage, ChatSession, MessageMetadata, ServiceStats, SessionManager};
pub use store::{MemorySessionStore, SessionStore};
pub use supervisor::{ModelWorker, Supervisor, SupervisorStats, WorkerSnapshot, WorkerState};
