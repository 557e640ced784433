//! Inbox Sorter — classify mailbox messages and file them into folders.

pub mod config;
pub mod error;
pub mod folders;
pub mod llm;
pub mod pipeline;
pub mod retry;
pub mod store;
