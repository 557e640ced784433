//! Folder lookup, creation and label resolution.

pub mod cache;
pub mod resolver;

pub use cache::FolderCache;
pub use resolver::{Destination, FolderResolver};
