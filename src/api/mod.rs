//! HTTP collaborator for the chat backend

pub mod client;

pub use client::{ChatApi, ChatApiConfig, FileUpload, DEFAULT_HISTORY_LIMIT, MAX_FILE_SIZE};
