//! Core module - Fundamental types and collaborator traits
//!
//! This module defines the abstractions shared by the queue, the worker pool
//! and the session manager:
//! - Execution value objects (config, status, stored result, backend output)
//! - The result storage contract and its file/in-memory implementations

pub mod storage;
pub mod types;

pub use storage::{FileResultStore, MemoryResultStore, ResultStore, ResultUpdate};
pub use types::*;
