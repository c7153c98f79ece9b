//! # Request State
//!
//! Lifecycle tracking for prompt requests: the [`Request`] record, its
//! [`Stage`] graph, the [`RequestStateMachine`] that is its only mutator, and
//! the [`RequestStore`] implementations it writes through to.

pub mod error;
pub mod machine;
pub mod request;
pub mod storage;

pub use error::{Result, StateError, StoreError};
pub use machine::RequestStateMachine;
pub use request::{Request, Stage};
pub use storage::{FileStore, MemoryStore, RequestStore};
