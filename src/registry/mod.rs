//! Coordination registry: the one place agents and operators look to learn
//! who owns a task, where its workspace is, and what state it is in.

mod coordination;
mod entry;
pub mod store;

pub use coordination::{CoordinationRegistry, ListFilter};
pub use entry::{EntryUpdate, RegistryEntry, WorkspaceRef};
pub use store::{JournalStore, MemoryStore, RegistryStore};
