//! Mailbox store abstraction and its adapters.

pub mod graph;
pub mod memory;
pub mod traits;

pub use graph::{GraphConfig, GraphMailbox};
pub use memory::InMemoryMailbox;
pub use traits::{FolderEntry, MailboxStore, MessageQuery};
