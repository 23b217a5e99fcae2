//! Core types and error definitions for the Hierarch orchestration engine.
//!
//! This crate provides the foundational types shared across all Hierarch crates:
//! the error taxonomy of the engine and the message model agents use to report
//! upward through the spawn hierarchy.
//!
//! # Main types
//!
//! - [`HierarchError`]: Unified error enum for every engine component.
//! - [`HierarchResult`]: Convenience alias for `Result<T, HierarchError>`.
//! - [`Message`]: A message sent between agents (or from a root agent to the coordinator).
//! - [`MessageType`]: Closed set of message kinds.

/// Error taxonomy.
pub mod error;
/// Inter-agent messages.
pub mod message;

pub use error::{HierarchError, HierarchResult};
pub use message::{Message, MessageType};
